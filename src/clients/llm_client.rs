//! LLM 客户端
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 支持自定义 API 端点和模型
//! - 兼容 OpenAI API 的服务（如 Azure, Gemini, Doubao 等）

use std::time::Duration;

use anyhow::Result;
use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::clients::{ContentGenerator, Generation};
use crate::config::Config;
use crate::error::{AppError, LlmError};

/// 基于 OpenAI 兼容接口的内容生成器
///
/// 职责：
/// - 调用 chat completion 接口生成章节内容
/// - 对瞬时错误（超时、限流、5xx）做有限次数的内部重试
/// - 不关心章节顺序和质量判断
pub struct OpenAiGenerator {
    client: Client<OpenAIConfig>,
    model_name: String,
    max_retries: u32,
    retry_delay: Duration,
}

impl OpenAiGenerator {
    /// 创建新的 LLM 客户端
    pub fn new(config: &Config) -> Self {
        // 配置 OpenAI 客户端（兼容 OpenAI API 的服务）
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_api_base_url);

        Self {
            client: Client::with_config(openai_config),
            model_name: config.llm_model_name.clone(),
            max_retries: config.llm_max_retries.max(1),
            retry_delay: Duration::from_secs(1),
        }
    }

    /// 单次调用，不重试
    async fn send_once(&self, system_prompt: &str, user_prompt: &str, max_tokens: u32) -> Result<Generation, AppError> {
        let build_err = |e| AppError::llm_api_failed(&self.model_name, e);

        let messages = vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system_prompt)
                    .build()
                    .map_err(build_err)?,
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user_prompt)
                    .build()
                    .map_err(build_err)?,
            ),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(messages)
            .temperature(0.7)
            .max_tokens(max_tokens)
            .build()
            .map_err(build_err)?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| {
                let message = e.to_string().to_ascii_lowercase();
                if message.contains("rate limit") || message.contains("429") {
                    AppError::Llm(LlmError::RateLimited {
                        model: self.model_name.clone(),
                    })
                } else {
                    AppError::llm_api_failed(&self.model_name, e)
                }
            })?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| LlmError::EmptyContent {
                model: self.model_name.clone(),
            })?;

        let tokens_used = response.usage.map(|u| u.total_tokens).unwrap_or(0);

        Ok(Generation {
            content: content.trim().to_string(),
            tokens_used,
            model: response.model,
        })
    }
}

#[async_trait]
impl ContentGenerator for OpenAiGenerator {
    async fn generate(&self, system_prompt: &str, user_prompt: &str, max_tokens: u32) -> Result<Generation> {
        debug!("调用 LLM API，模型: {}", self.model_name);
        debug!("用户消息长度: {} 字符", user_prompt.len());

        let mut last_error = String::new();
        for attempt in 1..=self.max_retries {
            match self.send_once(system_prompt, user_prompt, max_tokens).await {
                Ok(generation) => {
                    debug!("LLM API 调用成功 (tokens: {})", generation.tokens_used);
                    return Ok(generation);
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    warn!(
                        "LLM 调用失败 (尝试 {}/{}): {}，{} 秒后重试",
                        attempt,
                        self.max_retries,
                        e,
                        self.retry_delay.as_secs() * attempt as u64
                    );
                    last_error = e.to_string();
                    sleep(self.retry_delay * attempt).await;
                }
                Err(e) if e.is_transient() => {
                    last_error = e.to_string();
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(LlmError::RetriesExhausted {
            model: self.model_name.clone(),
            attempts: self.max_retries,
            last_error,
        }
        .into())
    }
}

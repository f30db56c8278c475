//! 外部协作方接口（端口）与具体适配器
//!
//! 编排核心只依赖这里的 trait：
//! - `ContentGenerator` - LLM 内容生成
//! - `ResearchProvider` - 网络研究搜索
//! - `ArticleStore` - 文章持久化

pub mod article_store;
pub mod llm_client;
pub mod research_client;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ArticleState, SectionIndex, SectionRecord, Source};

pub use article_store::JsonFileStore;
pub use llm_client::OpenAiGenerator;
pub use research_client::HttpResearchClient;

/// 一次生成调用的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub content: String,
    pub tokens_used: u32,
    pub model: String,
}

/// LLM 内容生成服务
///
/// 实现方自带内部重试；返回错误意味着内部重试已经耗尽。
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, system_prompt: &str, user_prompt: &str, max_tokens: u32) -> Result<Generation>;
}

/// 网络研究服务
#[async_trait]
pub trait ResearchProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<Source>>;
}

/// 文章持久化存储
#[async_trait]
pub trait ArticleStore: Send + Sync {
    async fn load_article(&self, article_id: &str) -> Result<ArticleState>;

    /// 写入一批章节（同索引整体替换），`last_index` 为本批最大索引
    async fn save_sections(&self, article_id: &str, sections: &[SectionRecord], last_index: SectionIndex) -> Result<()>;
}

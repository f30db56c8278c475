use std::time::Duration;

use crate::error::ConfigError;

/// 程序配置文件
#[derive(Clone, Debug)]
pub struct Config {
    /// 同时处理的文章数量
    pub max_concurrent_articles: usize,
    /// 全局并发生成调用上限（跨所有文章）
    pub global_concurrency: usize,
    /// 单篇文章同时执行的任务上限
    pub per_article_concurrency: usize,
    /// 单个任务超时（秒）
    pub task_timeout_secs: u64,
    /// 单个任务最多重试次数
    pub task_max_retries: u32,
    /// 重试固定等待（毫秒）
    pub retry_delay_ms: u64,
    /// 重试随机抖动上限（毫秒）
    pub retry_jitter_ms: u64,
    // --- 研究缓存 ---
    pub research_cache_ttl_secs: u64,
    pub research_sweep_interval_secs: u64,
    pub max_sources_per_section: usize,
    /// 综合搜索结果少于该数量时追加一次定向搜索
    pub sparse_source_threshold: usize,
    // --- 上下文构建 ---
    pub context_max_tokens: usize,
    /// 滚动摘要保留的章节数
    pub context_window: usize,
    /// 最近一个章节摘要保留的字符数
    pub recent_digest_chars: usize,
    // --- 质量门 ---
    pub max_regenerations: u32,
    // --- 持久化 ---
    /// 每积累多少个章节批量写一次
    pub persist_batch_size: usize,
    // --- LLM 配置 ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
    pub llm_max_retries: u32,
    // --- 研究服务配置 ---
    pub research_api_base_url: String,
    pub research_api_key: String,
    /// 大纲 TOML 文件存放目录
    pub outline_folder: String,
    /// 文章 JSON 存放目录
    pub store_folder: String,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 输出日志文件
    pub output_log_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_articles: 3,
            global_concurrency: 5,
            per_article_concurrency: 4,
            task_timeout_secs: 300,
            task_max_retries: 1,
            retry_delay_ms: 2000,
            retry_jitter_ms: 500,
            research_cache_ttl_secs: 24 * 60 * 60,
            research_sweep_interval_secs: 60 * 60,
            max_sources_per_section: 8,
            sparse_source_threshold: 5,
            context_max_tokens: 1500,
            context_window: 6,
            recent_digest_chars: 600,
            max_regenerations: 1,
            persist_batch_size: 3,
            llm_api_key: String::new(),
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            llm_model_name: "gpt-4o-mini".to_string(),
            llm_max_retries: 3,
            research_api_base_url: "http://localhost:8088".to_string(),
            research_api_key: String::new(),
            outline_folder: "outlines".to_string(),
            store_folder: "articles".to_string(),
            verbose_logging: false,
            output_log_file: "output.txt".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_concurrent_articles: env_parse("MAX_CONCURRENT_ARTICLES").unwrap_or(default.max_concurrent_articles),
            global_concurrency: env_parse("GLOBAL_CONCURRENCY").unwrap_or(default.global_concurrency),
            per_article_concurrency: env_parse("PER_ARTICLE_CONCURRENCY").unwrap_or(default.per_article_concurrency),
            task_timeout_secs: env_parse("TASK_TIMEOUT_SECS").unwrap_or(default.task_timeout_secs),
            task_max_retries: env_parse("TASK_MAX_RETRIES").unwrap_or(default.task_max_retries),
            retry_delay_ms: env_parse("RETRY_DELAY_MS").unwrap_or(default.retry_delay_ms),
            retry_jitter_ms: env_parse("RETRY_JITTER_MS").unwrap_or(default.retry_jitter_ms),
            research_cache_ttl_secs: env_parse("RESEARCH_CACHE_TTL_SECS").unwrap_or(default.research_cache_ttl_secs),
            research_sweep_interval_secs: env_parse("RESEARCH_SWEEP_INTERVAL_SECS").unwrap_or(default.research_sweep_interval_secs),
            max_sources_per_section: env_parse("MAX_SOURCES_PER_SECTION").unwrap_or(default.max_sources_per_section),
            sparse_source_threshold: env_parse("SPARSE_SOURCE_THRESHOLD").unwrap_or(default.sparse_source_threshold),
            context_max_tokens: env_parse("CONTEXT_MAX_TOKENS").unwrap_or(default.context_max_tokens),
            context_window: env_parse("CONTEXT_WINDOW").unwrap_or(default.context_window),
            recent_digest_chars: env_parse("RECENT_DIGEST_CHARS").unwrap_or(default.recent_digest_chars),
            max_regenerations: env_parse("MAX_REGENERATIONS").unwrap_or(default.max_regenerations),
            persist_batch_size: env_parse("PERSIST_BATCH_SIZE").unwrap_or(default.persist_batch_size),
            llm_api_key: std::env::var("LLM_API_KEY").unwrap_or(default.llm_api_key),
            llm_api_base_url: std::env::var("LLM_API_BASE_URL").unwrap_or(default.llm_api_base_url),
            llm_model_name: std::env::var("LLM_MODEL_NAME").unwrap_or(default.llm_model_name),
            llm_max_retries: env_parse("LLM_MAX_RETRIES").unwrap_or(default.llm_max_retries),
            research_api_base_url: std::env::var("RESEARCH_API_BASE_URL").unwrap_or(default.research_api_base_url),
            research_api_key: std::env::var("RESEARCH_API_KEY").unwrap_or(default.research_api_key),
            outline_folder: std::env::var("OUTLINE_FOLDER").unwrap_or(default.outline_folder),
            store_folder: std::env::var("STORE_FOLDER").unwrap_or(default.store_folder),
            verbose_logging: env_parse("VERBOSE_LOGGING").unwrap_or(default.verbose_logging),
            output_log_file: std::env::var("OUTPUT_LOG_FILE").unwrap_or(default.output_log_file),
        }
    }

    /// 校验必须为正数的并发与容量配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_concurrent_articles", self.max_concurrent_articles),
            ("global_concurrency", self.global_concurrency),
            ("per_article_concurrency", self.per_article_concurrency),
            ("max_sources_per_section", self.max_sources_per_section),
            ("context_window", self.context_window),
            ("persist_batch_size", self.persist_batch_size),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    value: value.to_string(),
                    reason: "必须大于 0",
                });
            }
        }
        if self.context_max_tokens < 200 {
            return Err(ConfigError::InvalidValue {
                field: "context_max_tokens",
                value: self.context_max_tokens.to_string(),
                reason: "至少需要 200 个 token",
            });
        }
        if self.task_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "task_timeout_secs",
                value: "0".to_string(),
                reason: "必须大于 0",
            });
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn research_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.research_cache_ttl_secs)
    }

    pub fn research_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.research_sweep_interval_secs)
    }
}

fn env_parse<T: std::str::FromStr>(var_name: &str) -> Option<T> {
    std::env::var(var_name).ok().and_then(|v| v.parse().ok())
}

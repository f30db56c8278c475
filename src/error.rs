use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// LLM 服务错误
    #[error("LLM错误: {0}")]
    Llm(#[from] LlmError),
    /// 研究服务错误
    #[error("研究服务错误: {0}")]
    Research(#[from] ResearchError),
    /// 存储错误
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
    /// 大纲错误
    #[error("大纲错误: {0}")]
    Outline(#[from] OutlineError),
    /// 任务执行错误
    #[error("任务错误: {0}")]
    Task(#[from] TaskError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 其他错误（用于包装第三方库错误）
    #[error("错误: {0}")]
    Other(String),
}

/// LLM 服务错误
#[derive(Debug, Error)]
pub enum LlmError {
    /// API 调用失败
    #[error("LLM API调用失败 (模型: {model}): {source}")]
    ApiCallFailed {
        model: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// 返回内容为空
    #[error("LLM返回内容为空 (模型: {model})")]
    EmptyContent { model: String },
    /// 请求频率限制
    #[error("LLM请求频率限制 (模型: {model})")]
    RateLimited { model: String },
    /// 内部重试耗尽
    #[error("LLM调用重试 {attempts} 次后仍失败 (模型: {model}): {last_error}")]
    RetriesExhausted {
        model: String,
        attempts: u32,
        last_error: String,
    },
}

/// 研究服务错误
#[derive(Debug, Error)]
pub enum ResearchError {
    /// 网络请求失败
    #[error("研究API请求失败 ({endpoint}): {source}")]
    RequestFailed {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    /// 返回非成功状态码
    #[error("研究API返回错误状态 ({endpoint}): HTTP {status}")]
    BadStatus { endpoint: String, status: u16 },
    /// JSON 解析失败
    #[error("研究API响应解析失败: {0}")]
    JsonParseFailed(#[source] reqwest::Error),
}

/// 存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 文章不存在
    #[error("文章不存在: {article_id}")]
    NotFound { article_id: String },
    /// 读取文件失败
    #[error("读取文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// 写入文件失败
    #[error("写入文件失败 ({path}): {source}")]
    WriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// JSON 序列化/反序列化失败
    #[error("JSON处理失败: {0}")]
    Json(#[from] serde_json::Error),
}

/// 大纲错误
#[derive(Debug, Error)]
pub enum OutlineError {
    /// 大纲没有任何 H2 章节
    #[error("大纲至少需要一个H2章节")]
    NoSections,
    /// 节点标题为空
    #[error("大纲节点标题为空: {position}")]
    EmptyTitle { position: String },
    /// 索引在大纲中不存在
    #[error("大纲中不存在章节索引 {index}")]
    UnknownIndex { index: String },
    /// 索引格式错误
    #[error("无法解析章节索引: {value}")]
    InvalidIndex { value: String },
}

/// 任务执行错误
#[derive(Debug, Error)]
pub enum TaskError {
    /// 任务超时
    #[error("任务 {task_id} 超时 ({timeout_secs} 秒)")]
    Timeout { task_id: String, timeout_secs: u64 },
    /// 任务崩溃
    #[error("任务 {task_id} 执行崩溃: {message}")]
    Panicked { task_id: String, message: String },
    /// 章节状态机收到非法转换
    #[error("章节 {index} 不能从 {from} 转到 {to}")]
    IllegalTransition {
        index: String,
        from: &'static str,
        to: &'static str,
    },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置值不合法
    #[error("配置项 {field} 的值 {value} 不合法: {reason}")]
    InvalidValue {
        field: &'static str,
        value: String,
        reason: &'static str,
    },
}

// ========== 瞬时错误判定 ==========

static TRANSIENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(timed?\s?out|timeout|超时|rate.?limit|频率限制|too many requests|\b429\b|\b5\d\d\b|service unavailable|bad gateway|gateway timeout|overloaded|connection reset)",
    )
    .expect("transient pattern is valid")
});

impl AppError {
    /// 是否属于可重试的瞬时错误（超时、限流、5xx）
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Llm(e) => e.is_transient(),
            AppError::Research(e) => e.is_transient(),
            AppError::Task(e) => e.is_transient(),
            AppError::Store(_) | AppError::Outline(_) | AppError::Config(_) => false,
            AppError::Other(msg) => TRANSIENT_PATTERN.is_match(msg),
        }
    }
}

impl LlmError {
    /// 内部重试耗尽后不再视为瞬时错误
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } => true,
            LlmError::ApiCallFailed { source, .. } => TRANSIENT_PATTERN.is_match(&source.to_string()),
            LlmError::EmptyContent { .. } | LlmError::RetriesExhausted { .. } => false,
        }
    }
}

impl ResearchError {
    pub fn is_transient(&self) -> bool {
        match self {
            ResearchError::BadStatus { status, .. } => *status == 429 || (500..600).contains(status),
            ResearchError::RequestFailed { source, .. } => source.is_timeout() || source.is_connect(),
            ResearchError::JsonParseFailed(_) => false,
        }
    }
}

impl TaskError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TaskError::Timeout { .. })
    }
}

/// 判断任意错误是否为瞬时错误
///
/// 优先使用错误链中的类型信息，无法识别时退回到对错误文本做模式匹配。
pub fn is_transient(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<AppError>() {
            return e.is_transient();
        }
        if let Some(e) = cause.downcast_ref::<LlmError>() {
            return e.is_transient();
        }
        if let Some(e) = cause.downcast_ref::<ResearchError>() {
            return e.is_transient();
        }
        if let Some(e) = cause.downcast_ref::<TaskError>() {
            return e.is_transient();
        }
    }
    // 只看最底层的错误，上层 context 里可能带有文章 id 之类的数字
    TRANSIENT_PATTERN.is_match(&err.root_cause().to_string())
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建LLM API调用错误
    pub fn llm_api_failed(model: impl Into<String>, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        AppError::Llm(LlmError::ApiCallFailed {
            model: model.into(),
            source: Box::new(source),
        })
    }

    /// 创建研究API请求失败错误
    pub fn research_request_failed(endpoint: impl Into<String>, source: reqwest::Error) -> Self {
        AppError::Research(ResearchError::RequestFailed {
            endpoint: endpoint.into(),
            source,
        })
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

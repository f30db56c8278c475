//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批量处理和流程调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `batch_processor` - 批量文章处理器
//! - 管理应用生命周期（初始化、运行）
//! - 批量加载文章任务（Vec<ArticleJob>）
//! - 控制同时处理的文章数量（Semaphore）
//! - 输出全局统计信息
//!
//! ### `article_processor` - 单篇文章处理器
//! - 按大纲分阶段调度章节
//! - 断点续跑、批量持久化
//! - 汇总单篇文章的报告
//!
//! ### `task_runner` - 批量任务执行器
//! - 单篇文章内的有界并发、超时、重试与错误隔离
//!
//! ## 层次关系
//!
//! ```text
//! batch_processor (处理 Vec<ArticleJob>)
//!     ↓
//! article_processor (处理大纲中的全部章节)
//!     ↓
//! task_runner (一批互不依赖的章节)
//!     ↓
//! workflow::SectionFlow (处理单个章节)
//!     ↓
//! services (能力层：research / context / quality / monitor)
//!     ↓
//! infrastructure (基础设施：ConcurrencyLimiter)
//! ```

pub mod article_processor;
pub mod batch_processor;
pub mod task_runner;

// 重新导出主要类型
pub use article_processor::{ArticleProcessor, ArticleReport, Collaborators, SectionFailure};
pub use batch_processor::App;
pub use task_runner::{
    BatchOutcome, RunnerSettings, RunningBatch, Task, TaskFailure, TaskResult, TaskRunner, TaskSuccess,
};

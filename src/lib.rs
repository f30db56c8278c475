//! # Article Pipeline
//!
//! 按大纲分章节生成长文的编排流水线
//!
//! ## 架构设计
//!
//! 本系统采用分层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有稀缺资源，只暴露能力
//! - `ConcurrencyLimiter` - 全局生成调用的公平限流
//!
//! ### ② 外部协作方（Clients）
//! - `clients/` - `ContentGenerator` / `ResearchProvider` / `ArticleStore` 接口及其实现
//!
//! ### ③ 业务能力层（Services）
//! - `ResearchCache` - 每篇文章至多两次外部搜索，按章节排序来源
//! - `ContextBuilder` - 有 token 上限的滚动上下文
//! - `QualityGate` - 质量检查与自动修复
//! - `PerformanceMonitor` - 阶段耗时、调用次数、token 统计
//!
//! ### ④ 流程层（Workflow）
//! - `SectionCtx` - 上下文封装（article_id + 大纲节点）
//! - `SectionFlow` - 单章节流程（research → context → generate → quality → regenerate）
//!
//! ### ⑤ 编排层（Orchestration）
//! - `orchestrator/task_runner` - 有界并发、超时、重试的批量执行器
//! - `orchestrator/article_processor` - 单篇文章的分阶段调度与持久化
//! - `orchestrator/batch_processor` - 批量文章处理器，管理资源和并发
//!
//! ## 模块结构

pub mod clients;
pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult};
pub use infrastructure::ConcurrencyLimiter;
pub use models::{Outline, SectionIndex, SectionRecord, SectionType};
pub use orchestrator::{App, ArticleProcessor, ArticleReport, Collaborators};
pub use workflow::{SectionCtx, SectionFlow};

pub mod citation;
pub mod context_builder;
pub mod performance_monitor;
pub mod prompt_builder;
pub mod quality_gate;
pub mod research_cache;

pub use citation::format_citations;
pub use context_builder::{estimate_tokens, ContextBuilder, ContextCacheEntry, ContextStats};
pub use performance_monitor::{
    ApiKind, ArticleMetrics, BatchMetrics, PerformanceMonitor, PerformanceReport, Phase,
};
pub use quality_gate::{QualityCheck, QualityGate, QualityIssue, QualityResult, Severity};
pub use research_cache::{CacheStats, ResearchCache, ResearchCacheEntry};

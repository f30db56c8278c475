//! 基础设施层：持有稀缺资源，只暴露能力

pub mod concurrency_limiter;

pub use concurrency_limiter::{ConcurrencyLimiter, LimiterStats};

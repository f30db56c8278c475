//! 性能监控 - 业务能力层
//!
//! 按文章记录阶段耗时、API 调用次数、token 用量、缓存命中与失败次数

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

/// 流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Research,
    Context,
    Generation,
    QualityGate,
    Regeneration,
    Persistence,
    Total,
}

/// 外部调用种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ApiKind {
    Research,
    Generation,
    StoreWrite,
}

/// 一个批次的汇总指标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchMetrics {
    pub article_id: String,
    pub task_count: usize,
    pub successful: usize,
    pub failed: usize,
    pub retries: usize,
    pub peak_concurrency: usize,
    pub duration: Duration,
}

/// 单篇文章的累计指标
#[derive(Debug, Clone, Default)]
pub struct ArticleMetrics {
    pub phase_timings: BTreeMap<Phase, Duration>,
    pub api_calls: BTreeMap<ApiKind, u64>,
    pub tokens_used: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub sections_generated: u64,
    pub regenerations: u64,
    pub failures: u64,
    pub batches: Vec<BatchMetrics>,
    started_at: Option<Instant>,
}

impl ArticleMetrics {
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    pub fn api_calls_of(&self, kind: ApiKind) -> u64 {
        self.api_calls.get(&kind).copied().unwrap_or(0)
    }
}

/// 文章完成时生成的报告
#[derive(Debug, Clone)]
pub struct PerformanceReport {
    pub article_id: String,
    pub total_duration: Duration,
    pub metrics: ArticleMetrics,
}

/// 性能监控器
///
/// 所有方法都只做短暂加锁的内存更新，可以在任意任务中调用。
#[derive(Debug, Default)]
pub struct PerformanceMonitor {
    articles: Mutex<HashMap<String, ArticleMetrics>>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_article<R>(&self, article_id: &str, f: impl FnOnce(&mut ArticleMetrics) -> R) -> R {
        let mut articles = self.articles.lock();
        let metrics = articles.entry(article_id.to_string()).or_default();
        f(metrics)
    }

    pub fn start_article(&self, article_id: &str) {
        self.with_article(article_id, |m| {
            m.started_at.get_or_insert_with(Instant::now);
        });
    }

    pub fn record_phase(&self, article_id: &str, phase: Phase, elapsed: Duration) {
        self.with_article(article_id, |m| {
            *m.phase_timings.entry(phase).or_default() += elapsed;
        });
    }

    /// 返回一个计时守卫，drop 时记录阶段耗时
    pub fn time_phase(self: &Arc<Self>, article_id: &str, phase: Phase) -> PhaseTimer {
        PhaseTimer {
            monitor: Arc::clone(self),
            article_id: article_id.to_string(),
            phase,
            start: Instant::now(),
        }
    }

    pub fn record_api_call(&self, article_id: &str, kind: ApiKind) {
        self.with_article(article_id, |m| {
            *m.api_calls.entry(kind).or_default() += 1;
        });
    }

    pub fn record_tokens(&self, article_id: &str, tokens: u32) {
        self.with_article(article_id, |m| m.tokens_used += tokens as u64);
    }

    pub fn record_cache(&self, article_id: &str, hit: bool) {
        self.with_article(article_id, |m| {
            if hit {
                m.cache_hits += 1;
            } else {
                m.cache_misses += 1;
            }
        });
    }

    pub fn record_section(&self, article_id: &str) {
        self.with_article(article_id, |m| m.sections_generated += 1);
    }

    pub fn record_regeneration(&self, article_id: &str) {
        self.with_article(article_id, |m| m.regenerations += 1);
    }

    pub fn record_failure(&self, article_id: &str) {
        self.with_article(article_id, |m| m.failures += 1);
    }

    pub fn record_batch(&self, batch: BatchMetrics) {
        info!(
            "[文章 {}] 📦 批次完成: 成功 {}/{}，重试 {} 次，峰值并发 {}，耗时 {:?}",
            batch.article_id,
            batch.successful,
            batch.task_count,
            batch.retries,
            batch.peak_concurrency,
            batch.duration
        );
        let article_id = batch.article_id.clone();
        self.with_article(&article_id, |m| m.batches.push(batch));
    }

    pub fn snapshot(&self, article_id: &str) -> Option<ArticleMetrics> {
        self.articles.lock().get(article_id).cloned()
    }

    /// 结束文章计时并输出报告
    pub fn finish_article(&self, article_id: &str) -> PerformanceReport {
        let metrics = self.with_article(article_id, |m| {
            let total = m.started_at.map(|s| s.elapsed()).unwrap_or_default();
            m.phase_timings.insert(Phase::Total, total);
            m.clone()
        });
        let total_duration = metrics.phase_timings.get(&Phase::Total).copied().unwrap_or_default();

        info!(
            "[文章 {}] 📊 耗时 {:?} | 生成调用 {} | 研究调用 {} | tokens {} | 缓存命中率 {:.0}% | 重新生成 {} | 失败 {}",
            article_id,
            total_duration,
            metrics.api_calls_of(ApiKind::Generation),
            metrics.api_calls_of(ApiKind::Research),
            metrics.tokens_used,
            metrics.cache_hit_rate() * 100.0,
            metrics.regenerations,
            metrics.failures
        );

        PerformanceReport {
            article_id: article_id.to_string(),
            total_duration,
            metrics,
        }
    }

    /// 所有文章的当前指标（供观测面板读取）
    pub fn all_reports(&self) -> Vec<(String, ArticleMetrics)> {
        let mut all: Vec<_> = self
            .articles
            .lock()
            .iter()
            .map(|(id, m)| (id.clone(), m.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

/// 阶段计时守卫
pub struct PhaseTimer {
    monitor: Arc<PerformanceMonitor>,
    article_id: String,
    phase: Phase,
    start: Instant,
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        self.monitor
            .record_phase(&self.article_id, self.phase, self.start.elapsed());
    }
}

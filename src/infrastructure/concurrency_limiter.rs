//! 并发限流器 - 基础设施层
//!
//! 持有全局唯一的"生成调用槽位"资源，只暴露"在槽位内执行"的能力

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

/// 限流器统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimiterStats {
    pub capacity: usize,
    pub active: usize,
    pub waiting: usize,
    pub peak: usize,
    pub total_admitted: u64,
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    waiting: AtomicUsize,
    peak: AtomicUsize,
    total_admitted: AtomicU64,
}

/// 全局并发限流器
///
/// 职责：
/// - 限制整个进程同时进行的外部生成调用数量
/// - 按到达顺序（FIFO）放行等待者
/// - 不认识文章 / 章节
///
/// tokio 的 `Semaphore` 是公平的，等待者按排队顺序获得许可。
/// 许可以 RAII 方式持有，成功、失败、panic 或 future 被丢弃时都会归还。
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<Counters>,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(Counters::default()),
        }
    }

    /// 在一个槽位内执行 future
    pub async fn execute<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let _slot = self.acquire().await;
        fut.await
    }

    async fn acquire(&self) -> SlotGuard {
        self.counters.waiting.fetch_add(1, Ordering::SeqCst);
        let waiting = WaitingGuard(self.counters.clone());
        // 信号量从不关闭，acquire 只会在关闭时失败
        let permit = self.semaphore.clone().acquire_owned().await.ok();
        drop(waiting);

        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(active, Ordering::SeqCst);
        self.counters.total_admitted.fetch_add(1, Ordering::Relaxed);
        debug!("获得生成槽位 ({}/{})", active, self.capacity);

        SlotGuard {
            _permit: permit,
            counters: self.counters.clone(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            capacity: self.capacity,
            active: self.counters.active.load(Ordering::SeqCst),
            waiting: self.counters.waiting.load(Ordering::SeqCst),
            peak: self.counters.peak.load(Ordering::SeqCst),
            total_admitted: self.counters.total_admitted.load(Ordering::Relaxed),
        }
    }
}

struct WaitingGuard(Arc<Counters>);

impl Drop for WaitingGuard {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

struct SlotGuard {
    _permit: Option<tokio::sync::OwnedSemaphorePermit>,
    counters: Arc<Counters>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}

//! 批量任务执行器 - 编排层
//!
//! ## 职责
//!
//! 在单篇文章的并发上限内执行一批相互独立的任务：
//!
//! 1. **按优先级入队**：任务按优先级排序后写入有界通道
//! 2. **固定数量的 worker**：worker 数量即单篇文章的并发上限
//! 3. **超时与重试**：每次尝试单独计时，瞬时错误最多重试 `max_retries` 次
//! 4. **错误隔离**：单个任务失败（包括 panic）不会影响同批其他任务
//! 5. **结构化并发**：worker 都在 `JoinSet` 中，批次返回前全部结束；丢弃批次 future 会中止所有任务

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::FutureExt;
use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{is_transient, TaskError};
use crate::services::{BatchMetrics, PerformanceMonitor};

/// 待执行的任务
#[derive(Debug, Clone)]
pub struct Task<P> {
    pub id: Uuid,
    /// 数值越小越先执行
    pub priority: u8,
    pub payload: P,
    /// 已经发起的尝试次数
    pub attempt: u32,
}

impl<P> Task<P> {
    pub fn new(priority: u8, payload: P) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority,
            payload,
            attempt: 0,
        }
    }
}

/// 执行器参数
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub concurrency: usize,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub retry_jitter: Duration,
}

impl RunnerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.per_article_concurrency.max(1),
            timeout: config.task_timeout(),
            max_retries: config.task_max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            retry_jitter: Duration::from_millis(config.retry_jitter_ms),
        }
    }
}

#[derive(Debug)]
pub struct TaskSuccess<P, T> {
    pub task: Task<P>,
    pub output: T,
}

#[derive(Debug)]
pub struct TaskFailure<P> {
    pub task: Task<P>,
    pub error: anyhow::Error,
    /// 失败原因是否属于瞬时错误（重试已用尽）
    pub retryable: bool,
}

/// 批次结果，成功与失败均按完成顺序排列
#[derive(Debug)]
pub struct BatchOutcome<P, T> {
    pub successful: Vec<TaskSuccess<P, T>>,
    pub failed: Vec<TaskFailure<P>>,
    pub metrics: BatchMetrics,
}

/// 单个任务的最终结果
pub type TaskResult<P, T> = std::result::Result<TaskSuccess<P, T>, TaskFailure<P>>;

/// 批量任务执行器
#[derive(Clone)]
pub struct TaskRunner {
    settings: RunnerSettings,
    monitor: Arc<PerformanceMonitor>,
}

impl TaskRunner {
    pub fn new(settings: RunnerSettings, monitor: Arc<PerformanceMonitor>) -> Self {
        Self { settings, monitor }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// 执行一批任务，总是返回（不会因为单个任务失败而中止）
    pub async fn process_batch<P, T, H, Fut>(&self, article_id: &str, tasks: Vec<Task<P>>, handler: H) -> BatchOutcome<P, T>
    where
        P: Clone + Send + 'static,
        T: Send + 'static,
        H: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut batch = self.start_batch(article_id, tasks, handler);
        let mut successful = Vec::new();
        let mut failed = Vec::new();
        while let Some(result) = batch.next().await {
            match result {
                Ok(success) => successful.push(success),
                Err(failure) => failed.push(failure),
            }
        }
        let metrics = batch.finish().await;

        BatchOutcome {
            successful,
            failed,
            metrics,
        }
    }

    /// 启动一批任务，结果按完成顺序通过 [`RunningBatch::next`] 逐个取出
    pub fn start_batch<P, T, H, Fut>(&self, article_id: &str, mut tasks: Vec<Task<P>>, handler: H) -> RunningBatch<P, T>
    where
        P: Clone + Send + 'static,
        T: Send + 'static,
        H: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let task_count = tasks.len();
        tasks.sort_by_key(|t| t.priority);

        let (task_tx, task_rx) = mpsc::channel(task_count.max(1));
        for task in tasks {
            // 通道容量等于任务数，不会阻塞
            if task_tx.try_send(task).is_err() {
                error!("[文章 {}] 任务入队失败", article_id);
            }
        }
        drop(task_tx);

        let task_rx = Arc::new(Mutex::new(task_rx));
        let (result_tx, result_rx) = mpsc::unbounded_channel::<TaskResult<P, T>>();
        let handler = Arc::new(handler);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let retries = Arc::new(AtomicUsize::new(0));

        let mut workers = JoinSet::new();
        for _ in 0..self.settings.concurrency.min(task_count) {
            let task_rx = Arc::clone(&task_rx);
            let result_tx = result_tx.clone();
            let handler = Arc::clone(&handler);
            let settings = self.settings.clone();
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            let retries = Arc::clone(&retries);
            let article_id = article_id.to_string();

            workers.spawn(async move {
                loop {
                    let next = task_rx.lock().await.recv().await;
                    let Some(task) = next else { break };

                    let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now_active, Ordering::SeqCst);
                    let result = run_task(&article_id, task, handler.as_ref(), &settings, &retries).await;
                    active.fetch_sub(1, Ordering::SeqCst);

                    if result_tx.send(result).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        RunningBatch {
            article_id: article_id.to_string(),
            workers,
            results: result_rx,
            monitor: Arc::clone(&self.monitor),
            task_count,
            successful: 0,
            failed: 0,
            peak,
            retries,
            start: Instant::now(),
        }
    }
}

/// 正在执行的批次
///
/// worker 都在内部的 `JoinSet` 中，丢弃本结构会中止所有未完成的任务。
pub struct RunningBatch<P, T> {
    article_id: String,
    workers: JoinSet<()>,
    results: mpsc::UnboundedReceiver<TaskResult<P, T>>,
    monitor: Arc<PerformanceMonitor>,
    task_count: usize,
    successful: usize,
    failed: usize,
    peak: Arc<AtomicUsize>,
    retries: Arc<AtomicUsize>,
    start: Instant,
}

impl<P, T> RunningBatch<P, T> {
    /// 下一个完成的任务；全部任务结束后返回 `None`
    pub async fn next(&mut self) -> Option<TaskResult<P, T>> {
        let result = self.results.recv().await?;
        match &result {
            Ok(_) => self.successful += 1,
            Err(_) => {
                self.failed += 1;
                self.monitor.record_failure(&self.article_id);
            }
        }
        Some(result)
    }

    /// 等待所有 worker 退出并记录批次指标
    pub async fn finish(mut self) -> BatchMetrics {
        while let Some(joined) = self.workers.join_next().await {
            if let Err(e) = joined {
                error!("[文章 {}] ❌ worker 异常退出: {}", self.article_id, e);
            }
        }

        let metrics = BatchMetrics {
            article_id: self.article_id.clone(),
            task_count: self.task_count,
            successful: self.successful,
            failed: self.failed,
            retries: self.retries.load(Ordering::SeqCst),
            peak_concurrency: self.peak.load(Ordering::SeqCst),
            duration: self.start.elapsed(),
        };
        self.monitor.record_batch(metrics.clone());
        metrics
    }
}

/// 执行单个任务（含重试）
async fn run_task<P, T, H, Fut>(
    article_id: &str,
    mut task: Task<P>,
    handler: &H,
    settings: &RunnerSettings,
    retries: &AtomicUsize,
) -> TaskResult<P, T>
where
    P: Clone,
    H: Fn(P) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        task.attempt += 1;
        let error = match attempt(task.id, task.payload.clone(), handler, settings.timeout).await {
            Ok(output) => return Ok(TaskSuccess { task, output }),
            Err(e) => e,
        };

        let retryable = is_transient(&error);
        if retryable && task.attempt <= settings.max_retries {
            retries.fetch_add(1, Ordering::SeqCst);
            let delay = settings.retry_delay + jitter(settings.retry_jitter);
            warn!(
                "[文章 {}] 🔁 任务 {} 第 {} 次尝试失败，{:?} 后重试: {:#}",
                article_id, task.id, task.attempt, delay, error
            );
            tokio::time::sleep(delay).await;
            continue;
        }

        debug!(
            "[文章 {}] 任务 {} 失败 (可重试: {}): {:#}",
            article_id, task.id, retryable, error
        );
        return Err(TaskFailure {
            task,
            error,
            retryable,
        });
    }
}

/// 单次尝试：超时与 panic 都转换为错误
async fn attempt<P, T, H, Fut>(task_id: Uuid, payload: P, handler: &H, timeout: Duration) -> Result<T>
where
    H: Fn(P) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let fut = AssertUnwindSafe(handler(payload)).catch_unwind();
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(TaskError::Panicked {
            task_id: task_id.to_string(),
            message: panic_message(panic.as_ref()),
        }
        .into()),
        Err(_) => Err(TaskError::Timeout {
            task_id: task_id.to_string(),
            timeout_secs: timeout.as_secs(),
        }
        .into()),
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let ms = rand::thread_rng().gen_range(0..=max_ms);
    Duration::from_millis(ms)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use std::sync::atomic::AtomicU32;

    fn runner(concurrency: usize, timeout: Duration) -> TaskRunner {
        TaskRunner::new(
            RunnerSettings {
                concurrency,
                timeout,
                max_retries: 1,
                retry_delay: Duration::from_millis(10),
                retry_jitter: Duration::from_millis(5),
            },
            Arc::new(PerformanceMonitor::new()),
        )
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let runner = runner(3, Duration::from_secs(5));
        let tasks: Vec<_> = (0..8u32).map(|i| Task::new(1, i)).collect();

        let outcome = runner
            .process_batch("a", tasks, |i: u32| async move {
                if i % 3 == 0 {
                    anyhow::bail!("invalid payload {}", i);
                }
                Ok(i * 10)
            })
            .await;

        assert_eq!(outcome.successful.len(), 5);
        assert_eq!(outcome.failed.len(), 3);
        assert!(outcome.failed.iter().all(|f| !f.retryable && f.task.attempt == 1));
        assert_eq!(outcome.metrics.retries, 0);
        assert!(outcome.metrics.peak_concurrency <= 3);
    }

    #[tokio::test]
    async fn test_transient_error_retried_once() {
        let runner = runner(2, Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let outcome = runner
            .process_batch("a", vec![Task::new(1, ())], move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        anyhow::bail!("upstream returned 503");
                    }
                    Ok("done")
                }
            })
            .await;

        assert_eq!(outcome.successful.len(), 1);
        assert_eq!(outcome.successful[0].task.attempt, 2);
        assert_eq!(outcome.metrics.retries, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_article_id_does_not_affect_retry_decision() {
        let runner = runner(1, Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let outcome = runner
            .process_batch("post-500", vec![Task::new(1, ())], move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("content policy rejected the prompt"))
                        .context("[文章 post-500 章节 1 H2] 生成失败")
                }
            })
            .await;

        assert_eq!(outcome.failed.len(), 1);
        assert!(!outcome.failed[0].retryable);
        assert_eq!(outcome.failed[0].task.attempt, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_persistent_transient_error_marked_retryable() {
        let runner = runner(1, Duration::from_secs(5));
        let outcome = runner
            .process_batch("a", vec![Task::new(1, ())], |_| async {
                Err::<(), _>(anyhow::anyhow!("rate limit exceeded"))
            })
            .await;
        assert_eq!(outcome.failed.len(), 1);
        assert!(outcome.failed[0].retryable);
        assert_eq!(outcome.failed[0].task.attempt, 2);
    }

    #[tokio::test]
    async fn test_timeout_and_panic_become_failures() {
        let runner = runner(2, Duration::from_millis(50));
        let tasks = vec![Task::new(1, 0u8), Task::new(1, 1u8), Task::new(1, 2u8)];
        let started = Instant::now();

        let outcome = runner
            .process_batch("a", tasks, |i: u8| async move {
                match i {
                    0 => {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        Ok(i)
                    }
                    1 => panic!("boom"),
                    _ => Ok(i),
                }
            })
            .await;

        assert_eq!(outcome.successful.len(), 1);
        assert_eq!(outcome.failed.len(), 2);
        let timed_out = outcome.failed.iter().find(|f| f.task.payload == 0).unwrap();
        assert!(timed_out.retryable);
        assert_eq!(timed_out.task.attempt, 2);
        let panicked = outcome.failed.iter().find(|f| f.task.payload == 1).unwrap();
        assert!(!panicked.retryable);
        assert!(panicked.error.to_string().contains("boom"));
        // 超时 × (1 + 重试) + 重试等待
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_priority_order_with_single_worker() {
        let runner = runner(1, Duration::from_secs(5));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let tasks = vec![Task::new(4, "faq"), Task::new(0, "intro"), Task::new(3, "conclusion")];

        runner
            .process_batch("a", tasks, move |name: &'static str| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(name);
                    Ok(())
                }
            })
            .await;

        assert_eq!(*order.lock(), vec!["intro", "conclusion", "faq"]);
    }

    #[tokio::test]
    async fn test_results_stream_in_completion_order() {
        let runner = runner(2, Duration::from_secs(5));
        let tasks = vec![Task::new(1, 200u64), Task::new(1, 10u64)];

        let mut batch = runner.start_batch("a", tasks, |ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ms)
        });

        let first = batch.next().await.unwrap().unwrap();
        assert_eq!(first.output, 10);
        let second = batch.next().await.unwrap().unwrap();
        assert_eq!(second.output, 200);
        assert!(batch.next().await.is_none());

        let metrics = batch.finish().await;
        assert_eq!(metrics.successful, 2);
        assert_eq!(metrics.peak_concurrency, 2);
    }

    #[tokio::test]
    async fn test_payload_only_needs_send() {
        use std::cell::Cell;

        let runner = runner(2, Duration::from_secs(5));
        let tasks = vec![Task::new(1, Cell::new(2u32)), Task::new(1, Cell::new(3u32))];

        let outcome = runner
            .process_batch("a", tasks, |n: Cell<u32>| async move { Ok(n.get() * 2) })
            .await;

        let mut outputs: Vec<u32> = outcome.successful.iter().map(|s| s.output).collect();
        outputs.sort();
        assert_eq!(outputs, vec![4, 6]);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let runner = runner(4, Duration::from_secs(1));
        let outcome = runner
            .process_batch("a", Vec::<Task<u8>>::new(), |i: u8| async move { Ok(i) })
            .await;
        assert_eq!(outcome.metrics.task_count, 0);
        assert!(outcome.successful.is_empty() && outcome.failed.is_empty());
    }
}

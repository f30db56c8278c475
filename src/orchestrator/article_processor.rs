//! 单篇文章处理器 - 编排层
//!
//! 按大纲顺序分阶段生成章节：
//!
//! 1. 引言（单独生成并立即持久化）
//! 2. 全部 H2 作为一批
//! 3. 按大纲顺序，每个 H2 的 H3 子章节各作为一批
//! 4. 结论与 FAQ 作为一批
//!
//! 已持久化的章节会被复用（断点续跑），成功的章节按批次写入存储。

use std::collections::BTreeMap;
use std::mem;
use std::slice;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::clients::{ArticleStore, ContentGenerator, ResearchProvider};
use crate::config::Config;
use crate::error::{AppError, OutlineError};
use crate::infrastructure::ConcurrencyLimiter;
use crate::models::{ArticlePreferences, Outline, OutlineNode, SectionIndex, SectionRecord, SectionType};
use crate::orchestrator::task_runner::{BatchOutcome, RunnerSettings, Task, TaskRunner};
use crate::services::{ApiKind, ContextBuilder, PerformanceMonitor, PerformanceReport, Phase, ResearchCache};
use crate::workflow::{SectionCtx, SectionFlow, SectionState, SectionTracker};

/// 外部协作方
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn ContentGenerator>,
    pub research: Arc<dyn ResearchProvider>,
    pub store: Arc<dyn ArticleStore>,
}

/// 生成失败的章节
#[derive(Debug, Clone)]
pub struct SectionFailure {
    pub index: SectionIndex,
    pub title: String,
    pub error: String,
    /// 是否值得稍后重试
    pub retryable: bool,
}

/// 单篇文章的生成结果
#[derive(Debug, Clone)]
pub struct ArticleReport {
    pub article_id: String,
    /// 按索引排序，每个成功的大纲节点恰好一条
    pub sections: Vec<SectionRecord>,
    pub failures: Vec<SectionFailure>,
    /// 每个大纲节点的最终状态
    pub section_states: BTreeMap<SectionIndex, SectionState>,
    pub performance: PerformanceReport,
}

impl ArticleReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// 单次文章运行的可变状态
struct ArticleRun {
    article_id: String,
    keyword: String,
    preferences: ArticlePreferences,
    completed: BTreeMap<SectionIndex, SectionRecord>,
    states: BTreeMap<SectionIndex, SectionState>,
    failures: Vec<SectionFailure>,
}

impl ArticleRun {
    fn prior_sections(&self) -> Arc<Vec<SectionRecord>> {
        Arc::new(self.completed.values().cloned().collect())
    }

    fn fail(&mut self, node: &OutlineNode, error: String, retryable: bool) {
        self.states.insert(node.index, SectionState::Failed);
        error!(
            "[文章 {}] ❌ 章节 {} 失败 (可重试: {}): {}",
            self.article_id, node.index, retryable, error
        );
        self.failures.push(SectionFailure {
            index: node.index,
            title: node.title.clone(),
            error,
            retryable,
        });
    }
}

/// 文章处理器
///
/// 在所有文章间共享：全局限流器、研究缓存与上下文缓存都只有一份。
pub struct ArticleProcessor {
    store: Arc<dyn ArticleStore>,
    research: Arc<ResearchCache>,
    context: Arc<ContextBuilder>,
    flow: Arc<SectionFlow>,
    runner: TaskRunner,
    limiter: ConcurrencyLimiter,
    monitor: Arc<PerformanceMonitor>,
    persist_batch_size: usize,
}

impl ArticleProcessor {
    pub fn new(config: &Config, collaborators: Collaborators) -> Self {
        let monitor = Arc::new(PerformanceMonitor::new());
        let limiter = ConcurrencyLimiter::new(config.global_concurrency);
        let research = Arc::new(ResearchCache::new(
            collaborators.research,
            Arc::clone(&monitor),
            config,
        ));
        let context = Arc::new(ContextBuilder::new(config));
        let flow = Arc::new(SectionFlow::new(
            config,
            collaborators.generator,
            Arc::clone(&research),
            Arc::clone(&context),
            limiter.clone(),
            Arc::clone(&monitor),
        ));
        let runner = TaskRunner::new(RunnerSettings::from_config(config), Arc::clone(&monitor));

        Self {
            store: collaborators.store,
            research,
            context,
            flow,
            runner,
            limiter,
            monitor,
            persist_batch_size: config.persist_batch_size.max(1),
        }
    }

    pub fn research_cache(&self) -> &Arc<ResearchCache> {
        &self.research
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// 生成整篇文章
    ///
    /// 单个章节的失败不会中止文章，失败记录在报告中。
    pub async fn generate_article(&self, article_id: &str, outline: &Outline) -> Result<ArticleReport> {
        outline.validate().map_err(AppError::from)?;
        self.monitor.start_article(article_id);

        let state = self
            .store
            .load_article(article_id)
            .await
            .with_context(|| format!("[文章 {}] 读取文章状态失败", article_id))?;

        let nodes = outline.nodes();
        let mut run = ArticleRun {
            article_id: article_id.to_string(),
            keyword: state.keyword.clone(),
            preferences: state.preferences.clone(),
            completed: BTreeMap::new(),
            states: BTreeMap::new(),
            failures: Vec::new(),
        };

        // 断点续跑：复用大纲中仍然存在的已持久化章节
        for record in state.sections {
            if nodes.iter().any(|n| n.index == record.index) {
                run.states.insert(record.index, SectionState::Persisted);
                run.completed.insert(record.index, record);
            }
        }
        info!(
            "[文章 {}] 🚀 开始生成 \"{}\"：共 {} 个章节，已完成 {} 个",
            article_id,
            run.keyword,
            nodes.len(),
            run.completed.len()
        );

        self.research.acquire(article_id, &run.keyword, outline).await;

        // ========== 阶段 1: 引言 ==========
        self.run_phase(&mut run, outline, by_type(&nodes, SectionType::Introduction))
            .await;

        // ========== 阶段 2: 全部 H2 ==========
        self.run_phase(&mut run, outline, by_type(&nodes, SectionType::H2))
            .await;

        // ========== 阶段 3: 每个 H2 的 H3 ==========
        for major in 1..=outline.sections.len() as u32 {
            let children: Vec<OutlineNode> = nodes
                .iter()
                .filter(|n| n.section_type == SectionType::H3 && n.index.major() == major)
                .cloned()
                .collect();
            self.run_phase(&mut run, outline, children).await;
        }

        // ========== 阶段 4: 结论 + FAQ ==========
        let closing: Vec<OutlineNode> = nodes
            .iter()
            .filter(|n| matches!(n.section_type, SectionType::Conclusion | SectionType::Faq))
            .cloned()
            .collect();
        self.run_phase(&mut run, outline, closing).await;

        self.context.clear(article_id);
        let performance = self.monitor.finish_article(article_id);

        let report = ArticleReport {
            article_id: article_id.to_string(),
            sections: run.completed.into_values().collect(),
            failures: run.failures,
            section_states: run.states,
            performance,
        };
        if report.is_complete() {
            info!("[文章 {}] 🎉 全部 {} 个章节完成", article_id, report.sections.len());
        } else {
            warn!(
                "[文章 {}] ⚠️ 完成 {} 个章节，失败 {} 个",
                article_id,
                report.sections.len(),
                report.failures.len()
            );
        }
        Ok(report)
    }

    /// 单独重新生成一个章节并持久化
    pub async fn generate_section(&self, article_id: &str, index: SectionIndex, outline: &Outline) -> Result<SectionRecord> {
        let node = outline.node(index).ok_or_else(|| {
            AppError::from(OutlineError::UnknownIndex {
                index: index.to_string(),
            })
        })?;
        let state = self
            .store
            .load_article(article_id)
            .await
            .with_context(|| format!("[文章 {}] 读取文章状态失败", article_id))?;

        self.research.acquire(article_id, &state.keyword, outline).await;

        let prior: Vec<SectionRecord> = state
            .sections
            .iter()
            .filter(|s| s.index < index)
            .cloned()
            .collect();
        let target = outline.target_words_for(&node, state.preferences.target_word_count);
        let ctx = SectionCtx::new(article_id, &state.keyword, node, target);

        // 重新生成时上下文从存储中的章节重建
        self.context.clear(article_id);
        let mut outcome = self.execute(article_id, vec![ctx], Arc::new(prior)).await;
        self.context.clear(article_id);

        if let Some(failure) = outcome.failed.pop() {
            return Err(failure
                .error
                .context(format!("[文章 {}] 章节 {} 生成失败", article_id, index)));
        }
        let record = outcome
            .successful
            .pop()
            .map(|s| s.output)
            .ok_or_else(|| AppError::Other(format!("章节 {} 没有生成结果", index)))?;

        self.persist(article_id, slice::from_ref(&record)).await?;
        Ok(record)
    }

    /// 执行一个阶段：跳过已完成的章节，生成其余章节并持久化
    async fn run_phase(&self, run: &mut ArticleRun, outline: &Outline, nodes: Vec<OutlineNode>) {
        let pending: Vec<SectionCtx> = nodes
            .into_iter()
            .filter(|n| !run.completed.contains_key(&n.index))
            .map(|node| {
                let target = outline.target_words_for(&node, run.preferences.target_word_count);
                SectionCtx::new(&run.article_id, &run.keyword, node, target)
            })
            .collect();
        if pending.is_empty() {
            return;
        }

        let flow = Arc::clone(&self.flow);
        let prior = run.prior_sections();
        let mut batch = self
            .runner
            .start_batch(&run.article_id, tasks_for(pending), move |ctx: SectionCtx| {
                let flow = Arc::clone(&flow);
                let prior = Arc::clone(&prior);
                async move { flow.run(&ctx, &prior).await }
            });

        // 按完成顺序缓冲，满 persist_batch_size 条即写入，不等待同批其余章节
        let mut buffer = Vec::with_capacity(self.persist_batch_size);
        while let Some(result) = batch.next().await {
            match result {
                Ok(success) => {
                    buffer.push(success.output);
                    if buffer.len() >= self.persist_batch_size {
                        let records = mem::take(&mut buffer);
                        self.flush(run, outline, &records).await;
                    }
                }
                Err(failure) => {
                    let ctx = failure.task.payload;
                    run.fail(&ctx.node, format!("{:#}", failure.error), failure.retryable);
                }
            }
        }
        self.flush(run, outline, &buffer).await;
        batch.finish().await;
    }

    async fn execute(
        &self,
        article_id: &str,
        contexts: Vec<SectionCtx>,
        prior: Arc<Vec<SectionRecord>>,
    ) -> BatchOutcome<SectionCtx, SectionRecord> {
        let flow = Arc::clone(&self.flow);
        self.runner
            .process_batch(article_id, tasks_for(contexts), move |ctx: SectionCtx| {
                let flow = Arc::clone(&flow);
                let prior = Arc::clone(&prior);
                async move { flow.run(&ctx, &prior).await }
            })
            .await
    }

    /// 批量写入；失败时逐条写入，仍失败的章节记为失败
    async fn flush(&self, run: &mut ArticleRun, outline: &Outline, records: &[SectionRecord]) {
        match self.persist(&run.article_id, records).await {
            Ok(()) => {
                for record in records {
                    self.complete(run, record.clone());
                }
            }
            Err(e) => {
                warn!(
                    "[文章 {}] ⚠️ 批量写入 {} 个章节失败，改为逐条写入: {:#}",
                    run.article_id,
                    records.len(),
                    e
                );
                for record in records {
                    match self.persist(&run.article_id, slice::from_ref(record)).await {
                        Ok(()) => self.complete(run, record.clone()),
                        Err(e) => {
                            let node = outline.node(record.index).unwrap_or_else(|| OutlineNode {
                                index: record.index,
                                section_type: record.section_type,
                                title: record.title.clone(),
                                parent_title: None,
                            });
                            run.fail(&node, format!("持久化失败: {:#}", e), true);
                        }
                    }
                }
            }
        }
    }

    fn complete(&self, run: &mut ArticleRun, record: SectionRecord) {
        let mut tracker = SectionTracker::checked(record.index);
        match tracker.advance(SectionState::Persisted) {
            Ok(state) => {
                run.states.insert(record.index, state);
            }
            Err(e) => warn!("[文章 {}] {}", run.article_id, e),
        }
        info!(
            "[文章 {}] 💾 章节 {} 已保存 ({} 词, {} 处引用)",
            run.article_id, record.index, record.word_count, record.citations_included
        );
        run.completed.insert(record.index, record);
    }

    async fn persist(&self, article_id: &str, records: &[SectionRecord]) -> Result<()> {
        let Some(last_index) = records.iter().map(|r| r.index).max() else {
            return Ok(());
        };
        let _timer = self.monitor.time_phase(article_id, Phase::Persistence);
        self.monitor.record_api_call(article_id, ApiKind::StoreWrite);
        self.store
            .save_sections(article_id, records, last_index)
            .await
            .with_context(|| format!("保存章节失败 (截至 {})", last_index))
    }
}

fn tasks_for(contexts: Vec<SectionCtx>) -> Vec<Task<SectionCtx>> {
    contexts
        .into_iter()
        .map(|ctx| Task::new(ctx.priority(), ctx))
        .collect()
}

fn by_type(nodes: &[OutlineNode], section_type: SectionType) -> Vec<OutlineNode> {
    nodes
        .iter()
        .filter(|n| n.section_type == section_type)
        .cloned()
        .collect()
}

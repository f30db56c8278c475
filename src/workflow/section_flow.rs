//! 章节生成流程 - 流程层
//!
//! 核心职责：定义"一个章节"的完整处理流程
//!
//! 流程顺序：
//! 1. 读取研究缓存中的章节来源
//! 2. 构建滚动上下文
//! 3. 通过全局限流器调用 LLM 生成
//! 4. 引用格式化 → 质量门 → 自动修复
//! 5. 仍有严重问题时做有限次数的定向重写

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::clients::{ContentGenerator, Generation};
use crate::config::Config;
use crate::infrastructure::ConcurrencyLimiter;
use crate::models::{count_words, SectionRecord, Source};
use crate::services::prompt_builder::{self, PromptInput};
use crate::services::{
    format_citations, ApiKind, ContextBuilder, PerformanceMonitor, Phase, QualityGate,
    QualityResult, ResearchCache,
};
use crate::workflow::section_ctx::SectionCtx;
use crate::workflow::section_state::{SectionState, SectionTracker};

/// 章节生成流程
///
/// - 只处理单个章节，不关心遍历顺序与持久化
/// - 依赖注入的缓存与限流器在所有文章间共享
pub struct SectionFlow {
    generator: Arc<dyn ContentGenerator>,
    research: Arc<ResearchCache>,
    context: Arc<ContextBuilder>,
    gate: QualityGate,
    limiter: ConcurrencyLimiter,
    monitor: Arc<PerformanceMonitor>,
    max_regenerations: u32,
}

/// 一版草稿及其评估结果
struct Draft {
    content: String,
    citations: usize,
    result: QualityResult,
    auto_fixed: bool,
}

impl SectionFlow {
    pub fn new(
        config: &Config,
        generator: Arc<dyn ContentGenerator>,
        research: Arc<ResearchCache>,
        context: Arc<ContextBuilder>,
        limiter: ConcurrencyLimiter,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self {
            generator,
            research,
            context,
            gate: QualityGate::new(),
            limiter,
            monitor,
            max_regenerations: config.max_regenerations,
        }
    }

    /// 生成单个章节
    ///
    /// `prior_sections` 为已完成的章节，用于构建上下文。
    /// 返回的记录已经过质量门；未解决的问题记录在 `quality_metrics` 中。
    pub async fn run(&self, ctx: &SectionCtx, prior_sections: &[SectionRecord]) -> Result<SectionRecord> {
        let mut tracker = SectionTracker::new(ctx.index());
        let node = &ctx.node;

        // ========== 研究来源 ==========
        let sources = self.research.sources_for(&ctx.article_id, &node.title);
        let research_degraded = self.research.is_degraded(&ctx.article_id);
        tracker.advance(SectionState::ResearchAcquired)?;
        debug!("{} 使用 {} 个来源 (降级: {})", ctx, sources.len(), research_degraded);

        // ========== 上下文 ==========
        let context = {
            let _timer = self.monitor.time_phase(&ctx.article_id, Phase::Context);
            self.context.build_context(
                &ctx.article_id,
                &ctx.keyword,
                ctx.index(),
                prior_sections,
                ctx.target_words,
            )
        };
        tracker.advance(SectionState::ContextBuilt)?;

        let input = PromptInput {
            keyword: &ctx.keyword,
            section_type: node.section_type,
            title: &node.title,
            parent_title: node.parent_title.as_deref(),
            context: &context,
            sources: &sources,
            target_words: ctx.target_words,
        };
        let system_prompt = prompt_builder::system_prompt(node.section_type);

        // ========== 首次生成 ==========
        info!("{} ✍️ 开始生成: {}", ctx, node.title);
        let generation = match self
            .generate(ctx, &system_prompt, &prompt_builder::user_prompt(&input), Phase::Generation)
            .await
        {
            Ok(generation) => generation,
            Err(e) => {
                tracker.advance(SectionState::Failed)?;
                return Err(e.context(format!("{} 生成失败", ctx)));
            }
        };
        tracker.advance(SectionState::Generated)?;
        let mut tokens_used = generation.tokens_used;
        let mut draft = self.check(ctx, generation.content, &sources);
        tracker.advance(SectionState::QualityChecked)?;

        // ========== 定向重写 ==========
        let mut regenerations = 0;
        while !draft.result.passed && regenerations < self.max_regenerations {
            tracker.advance(SectionState::RegenerationPending)?;
            regenerations += 1;
            self.monitor.record_regeneration(&ctx.article_id);

            let failing = draft.result.failing_checks();
            warn!(
                "{} 🔁 质量未通过 (分数 {})，第 {} 次重写: {:?}",
                ctx,
                draft.result.quality_score,
                regenerations,
                failing.iter().map(|c| c.name()).collect::<Vec<_>>()
            );
            let prompt = prompt_builder::regeneration_prompt(&input, &draft.content, &failing);
            match self.generate(ctx, &system_prompt, &prompt, Phase::Regeneration).await {
                Ok(generation) => {
                    tracker.advance(SectionState::Generated)?;
                    tokens_used += generation.tokens_used;
                    draft = self.check(ctx, generation.content, &sources);
                    tracker.advance(SectionState::QualityChecked)?;
                }
                Err(e) => {
                    warn!("{} ⚠️ 重写调用失败，沿用上一版: {:#}", ctx, e);
                    tracker.advance(SectionState::QualityChecked)?;
                    break;
                }
            }
        }

        if draft.result.passed {
            info!("{} ✅ 质量通过 (分数 {})", ctx, draft.result.quality_score);
        } else {
            warn!(
                "{} ⚠️ 仍有 {} 个严重问题，按现状接受",
                ctx,
                draft.result.critical_issues.len()
            );
        }
        self.monitor.record_section(&ctx.article_id);

        Ok(SectionRecord {
            section_type: node.section_type,
            index: node.index,
            title: node.title.clone(),
            word_count: count_words(&draft.content),
            research_sources: sources,
            citations_included: draft.citations,
            tokens_used,
            quality_metrics: draft
                .result
                .to_metrics(draft.auto_fixed, regenerations, research_degraded),
            content: draft.content,
            generated_at: Utc::now(),
        })
    }

    /// 经全局限流器发起一次生成调用
    async fn generate(&self, ctx: &SectionCtx, system_prompt: &str, user_prompt: &str, phase: Phase) -> Result<Generation> {
        let _timer = self.monitor.time_phase(&ctx.article_id, phase);
        self.monitor.record_api_call(&ctx.article_id, ApiKind::Generation);
        let max_tokens = ctx.target_words * 2 + 200;

        let generation = self
            .limiter
            .execute(self.generator.generate(system_prompt, user_prompt, max_tokens))
            .await
            .context("生成调用失败")?;

        self.monitor.record_tokens(&ctx.article_id, generation.tokens_used);
        debug!(
            "{} 生成完成: {} tokens, 模型 {}",
            ctx, generation.tokens_used, generation.model
        );
        Ok(generation)
    }

    /// 引用格式化 → 质量评估 → 自动修复
    fn check(&self, ctx: &SectionCtx, content: String, sources: &[Source]) -> Draft {
        let _timer = self.monitor.time_phase(&ctx.article_id, Phase::QualityGate);
        let (content, citations) = format_citations(&content, sources);
        let section_type = ctx.section_type();
        let result = self
            .gate
            .evaluate(&content, ctx.target_words, &ctx.keyword, section_type);

        if !result.auto_fix_available {
            return Draft {
                content,
                citations,
                result,
                auto_fixed: false,
            };
        }

        let fixed = self.gate.auto_fix(&content, &result.minor_issues);
        if fixed == content {
            return Draft {
                content,
                citations,
                result,
                auto_fixed: false,
            };
        }
        debug!("{} 🔧 已自动修复次要问题", ctx);
        let result = self
            .gate
            .evaluate(&fixed, ctx.target_words, &ctx.keyword, section_type);
        Draft {
            content: fixed,
            citations,
            result,
            auto_fixed: true,
        }
    }
}

use anyhow::Result;
/// 日志工具模块
///
/// 提供日志初始化、格式化和输出的辅助函数
use std::fs;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::Config;
use crate::orchestrator::ArticleReport;
use crate::services::{ApiKind, Phase};

/// 初始化 tracing 订阅者
///
/// 优先使用 `RUST_LOG`，否则按 `verbose` 选择 debug / info。
/// 重复调用是安全的（测试中会多次调用）。
pub fn init(verbose: bool) {
    let default_level = if verbose {
        "article_pipeline=debug"
    } else {
        "article_pipeline=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init();
}

/// 初始化日志文件
pub fn init_log_file(log_file_path: &str) -> Result<()> {
    let log_header = format!(
        "{}\n文章生成日志 - {}\n{}\n\n",
        "=".repeat(60),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        "=".repeat(60)
    );
    fs::write(log_file_path, log_header)?;
    Ok(())
}

/// 记录程序启动信息
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 分章节文章生成模式");
    info!("📊 同时处理文章数: {}", config.max_concurrent_articles);
    info!("🚦 全局生成并发: {}", config.global_concurrency);
    info!("🧵 单篇文章并发: {}", config.per_article_concurrency);
    info!("🤖 模型: {}", config.llm_model_name);
    info!("{}", "=".repeat(60));
}

/// 记录任务加载信息
pub fn log_jobs_loaded(total: usize, max_concurrent: usize) {
    info!("✓ 找到 {} 篇待生成的文章", total);
    info!("📋 最多同时处理 {} 篇\n", max_concurrent);
}

/// 记录单篇文章结果
pub fn log_article_result(report: &ArticleReport) {
    let metrics = &report.performance.metrics;
    info!("\n{}", "─".repeat(60));
    info!(
        "[文章 {}] 📄 章节 {} 个，失败 {} 个，耗时 {:?}",
        report.article_id,
        report.sections.len(),
        report.failures.len(),
        report.performance.total_duration
    );
    info!(
        "[文章 {}] 生成调用 {} 次，写入 {} 次，重新生成 {} 次",
        report.article_id,
        metrics.api_calls_of(ApiKind::Generation),
        metrics.api_calls_of(ApiKind::StoreWrite),
        metrics.regenerations
    );
    for phase in [Phase::Research, Phase::Generation, Phase::Regeneration, Phase::Persistence] {
        if let Some(elapsed) = metrics.phase_timings.get(&phase) {
            info!("[文章 {}]   {:?}: {:?}", report.article_id, phase, elapsed);
        }
    }
    for failure in &report.failures {
        warn!(
            "[文章 {}]   ✗ {} {}: {}",
            report.article_id,
            failure.index,
            failure.title,
            truncate_text(&failure.error, 120)
        );
    }
    info!("{}", "─".repeat(60));
}

/// 全部文章的汇总
#[derive(Debug, Default)]
pub struct FinalStats {
    pub total: usize,
    pub complete: usize,
    pub partial: usize,
    pub failed: usize,
    pub sections: usize,
    pub section_failures: usize,
    pub tokens: u64,
}

/// 打印最终统计信息
pub fn print_final_stats(stats: &FinalStats, log_file_path: &str) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 完整: {}/{}", stats.complete, stats.total);
    info!("⚠️ 部分完成: {}", stats.partial);
    info!("❌ 失败: {}", stats.failed);
    info!("📝 章节: {} (失败 {})", stats.sections, stats.section_failures);
    info!("🔢 tokens: {}", stats.tokens);
    info!("{}", "=".repeat(60));
    info!("\n日志已保存至: {}", log_file_path);
}

/// 截断长文本用于日志显示
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}

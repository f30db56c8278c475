//! 批量文章处理器 - 编排层
//!
//! ## 职责
//!
//! 本模块是整个应用的入口，负责批量文章的处理和资源管理。
//!
//! ## 核心功能
//!
//! 1. **应用初始化**：日志文件、LLM / 研究 / 存储客户端
//! 2. **批量加载**：扫描并加载所有待生成的文章任务（`Vec<ArticleJob>`）
//! 3. **并发控制**：使用 Semaphore 限制同时处理的文章数量
//! 4. **后台清理**：研究缓存的定期过期清理
//! 5. **全局统计**：汇总所有文章的生成结果

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::clients::{ArticleStore, HttpResearchClient, JsonFileStore, OpenAiGenerator};
use crate::config::Config;
use crate::models::ArticleJob;
use crate::orchestrator::article_processor::{ArticleProcessor, ArticleReport, Collaborators};
use crate::utils::logging::{init_log_file, log_article_result, log_jobs_loaded, log_startup, print_final_stats, FinalStats};

/// 应用主结构
pub struct App {
    config: Config,
    store: Arc<JsonFileStore>,
    processor: Arc<ArticleProcessor>,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        config.validate()?;
        init_log_file(&config.output_log_file)?;
        log_startup(&config);

        let store = Arc::new(JsonFileStore::new(&config.store_folder));
        let collaborators = Collaborators {
            generator: Arc::new(OpenAiGenerator::new(&config)),
            research: Arc::new(HttpResearchClient::new(&config)?),
            store: Arc::clone(&store) as Arc<dyn ArticleStore>,
        };
        let processor = Arc::new(ArticleProcessor::new(&config, collaborators));

        Ok(Self {
            config,
            store,
            processor,
        })
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> Result<()> {
        info!("\n📁 正在扫描待生成的文章...");
        let jobs = crate::models::load_all_jobs(&self.config.outline_folder).await?;

        if jobs.is_empty() {
            warn!("⚠️ 没有找到待处理的TOML文件，程序结束");
            return Ok(());
        }
        log_jobs_loaded(jobs.len(), self.config.max_concurrent_articles);

        for job in &jobs {
            self.store.ensure_article(&job.initial_state()).await?;
        }

        let sweeper = self
            .processor
            .research_cache()
            .spawn_sweeper(self.config.research_sweep_interval());

        let stats = self.process_all_articles(jobs).await;
        sweeper.abort();

        let limiter = self.processor.limiter().stats();
        info!(
            "🚦 全局并发: 上限 {}，峰值 {}，共放行 {} 次调用",
            limiter.capacity, limiter.peak, limiter.total_admitted
        );
        let cache = self.processor.research_cache().stats();
        info!(
            "🗂️ 研究缓存: {} 条，命中率 {:.0}%，外部调用 {} 次",
            cache.entries,
            cache.hit_rate * 100.0,
            cache.api_calls
        );
        print_final_stats(&stats, &self.config.output_log_file);

        Ok(())
    }

    /// 并发处理所有文章，同时进行的文章数不超过 `max_concurrent_articles`
    async fn process_all_articles(&self, jobs: Vec<ArticleJob>) -> FinalStats {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_articles));
        let mut stats = FinalStats {
            total: jobs.len(),
            ..Default::default()
        };
        let mut handles = JoinSet::new();

        for job in jobs {
            let semaphore = Arc::clone(&semaphore);
            let processor = Arc::clone(&self.processor);
            handles.spawn(async move {
                // Semaphore 不会被关闭
                let _permit = semaphore.acquire_owned().await.ok();
                let result = processor.generate_article(&job.article_id, &job.outline).await;
                (job.article_id, result)
            });
        }

        while let Some(joined) = handles.join_next().await {
            match joined {
                Ok((article_id, Ok(report))) => {
                    log_article_result(&report);
                    tally(&mut stats, &report);
                    if !report.is_complete() {
                        warn!("[文章 {}] 部分章节失败，可重新运行以续跑", article_id);
                    }
                }
                Ok((article_id, Err(e))) => {
                    error!("[文章 {}] ❌ 处理过程中发生错误: {:#}", article_id, e);
                    stats.failed += 1;
                }
                Err(e) => {
                    error!("文章任务执行失败: {}", e);
                    stats.failed += 1;
                }
            }
        }
        stats
    }
}

fn tally(stats: &mut FinalStats, report: &ArticleReport) {
    if report.is_complete() {
        stats.complete += 1;
    } else {
        stats.partial += 1;
    }
    stats.sections += report.sections.len();
    stats.section_failures += report.failures.len();
    stats.tokens += report.performance.metrics.tokens_used;
}

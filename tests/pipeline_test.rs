//! 流水线集成测试（内存中的协作方，无外部服务）

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use article_pipeline::clients::{ArticleStore, ContentGenerator, Generation, ResearchProvider};
use article_pipeline::error::StoreError;
use article_pipeline::models::{
    ArticleState, H2Node, QualityMetrics, SectionIndex, SectionRecord, SectionType, Source,
};
use article_pipeline::services::{ApiKind, Phase};
use article_pipeline::workflow::SectionState;
use article_pipeline::{ArticleProcessor, Collaborators, Config, Outline};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

const KEYWORD: &str = "compost";

// ========== 模拟协作方 ==========

/// 根据提示词中的章节标题与目标字数生成内容
#[derive(Default)]
struct ScriptedGenerator {
    calls: Mutex<HashMap<String, u32>>,
    /// 每个标题最近一次收到的用户提示词
    prompts: Mutex<HashMap<String, String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
    /// (标题, 是否每次都堆砌关键词)
    stuffed: Option<(String, bool)>,
    failing_title: Option<String>,
    /// 只对该标题额外等待
    slow_title: Option<(String, Duration)>,
}

impl ScriptedGenerator {
    fn calls_for(&self, title: &str) -> u32 {
        self.calls.lock().get(title).copied().unwrap_or(0)
    }

    fn last_prompt_for(&self, title: &str) -> String {
        self.prompts.lock().get(title).cloned().unwrap_or_default()
    }

    fn total_calls(&self) -> u32 {
        self.calls.lock().values().sum()
    }
}

fn prompt_field<'a>(prompt: &'a str, prefix: &str) -> Option<&'a str> {
    prompt
        .lines()
        .find_map(|line| line.strip_prefix(prefix))
        .map(str::trim)
}

fn prose(words: usize) -> String {
    let vocabulary = [
        "soil", "microbes", "break", "down", "organic", "matter", "into", "humus", "while",
        "gardeners", "turn", "the", "pile", "weekly", "for", "air",
    ];
    let mut out = String::new();
    for i in 0..words {
        if i > 0 {
            out.push_str(if i % 96 == 0 { "\n\n" } else { " " });
        }
        out.push_str(vocabulary[i % vocabulary.len()]);
        if i % 12 == 11 {
            out.push_str(&format!("{}.", i));
        }
    }
    out
}

#[async_trait]
impl ContentGenerator for ScriptedGenerator {
    async fn generate(&self, _system_prompt: &str, user_prompt: &str, _max_tokens: u32) -> Result<Generation> {
        let title = user_prompt
            .lines()
            .find(|l| l.starts_with("Section ("))
            .and_then(|l| l.split_once("): "))
            .map(|(_, t)| t.trim().to_string())
            .unwrap_or_default();
        let target: usize = prompt_field(user_prompt, "Target length: about ")
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|n| n.parse().ok())
            .unwrap_or(200);
        let section_type = prompt_field(user_prompt, "Section (")
            .and_then(|rest| rest.split_once(')'))
            .map(|(label, _)| label.to_string())
            .unwrap_or_default();
        let regenerating = user_prompt.contains("previous draft was rejected");

        *self.calls.lock().entry(title.clone()).or_default() += 1;
        self.prompts.lock().insert(title.clone(), user_prompt.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if let Some((slow, extra)) = &self.slow_title {
            if *slow == title {
                tokio::time::sleep(*extra).await;
            }
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_title.as_deref() == Some(title.as_str()) {
            anyhow::bail!("content policy rejected the prompt");
        }

        let content = match &self.stuffed {
            Some((stuffed_title, always)) if *stuffed_title == title && (*always || !regenerating) => {
                format!("{}{}", "compost ".repeat(30), prose(target - 30))
            }
            _ => match section_type.as_str() {
                "FAQ" => format!("### How long does it take?\n\n{}", prose(target - 5)),
                "引言" => format!("Compost {}", prose(target - 1)),
                _ if user_prompt.contains("\n[1] ") => format!("{} [1]", prose(target)),
                _ => prose(target),
            },
        };
        Ok(Generation {
            content,
            tokens_used: target as u32,
            model: "scripted".to_string(),
        })
    }
}

struct StaticResearch {
    calls: AtomicU32,
    fail: bool,
}

impl StaticResearch {
    fn new(fail: bool) -> Self {
        Self {
            calls: AtomicU32::new(0),
            fail,
        }
    }
}

#[async_trait]
impl ResearchProvider for StaticResearch {
    async fn search(&self, _query: &str) -> Result<Vec<Source>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("research backend returned 503");
        }
        Ok((0..10)
            .map(|i| Source {
                title: format!("Compost guide {}", i),
                url: format!("https://site{}.org/compost", i),
                excerpt: "How to compost at home".to_string(),
                published_date: None,
                author: None,
            })
            .collect())
    }
}

#[derive(Default)]
struct MemoryStore {
    articles: Mutex<HashMap<String, ArticleState>>,
    /// 拒绝一次写入多个章节
    reject_batches: bool,
    writes: AtomicU32,
    /// 成功写入的章节索引，按写入顺序
    saved_order: Mutex<Vec<SectionIndex>>,
}

impl MemoryStore {
    fn with_article(state: ArticleState) -> Self {
        let store = Self::default();
        store.articles.lock().insert(state.article_id.clone(), state);
        store
    }

    fn sections(&self, article_id: &str) -> Vec<SectionRecord> {
        self.articles
            .lock()
            .get(article_id)
            .map(|a| a.sections.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ArticleStore for MemoryStore {
    async fn load_article(&self, article_id: &str) -> Result<ArticleState> {
        self.articles
            .lock()
            .get(article_id)
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound {
                    article_id: article_id.to_string(),
                }
                .into()
            })
    }

    async fn save_sections(&self, article_id: &str, sections: &[SectionRecord], _last_index: SectionIndex) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.reject_batches && sections.len() > 1 {
            anyhow::bail!("batch write rejected");
        }
        let mut articles = self.articles.lock();
        let article = articles
            .get_mut(article_id)
            .ok_or_else(|| anyhow::anyhow!("unknown article {}", article_id))?;
        article.merge_sections(sections);
        self.saved_order.lock().extend(sections.iter().map(|s| s.index));
        Ok(())
    }
}

// ========== 辅助函数 ==========

fn test_config() -> Config {
    Config {
        task_timeout_secs: 5,
        retry_delay_ms: 10,
        retry_jitter_ms: 5,
        ..Config::default()
    }
}

fn outline(h2_count: usize, h3_per_h2: usize, faq: bool) -> Outline {
    Outline {
        introduction: "Why compost".to_string(),
        sections: (1..=h2_count)
            .map(|i| H2Node {
                title: format!("Topic {}", i),
                subsections: (1..=h3_per_h2).map(|j| format!("Detail {}.{}", i, j)).collect(),
            })
            .collect(),
        conclusion: "Wrapping up".to_string(),
        faq: faq.then(|| "Common questions".to_string()),
    }
}

fn processor(
    config: &Config,
    generator: Arc<ScriptedGenerator>,
    research: Arc<StaticResearch>,
    store: Arc<MemoryStore>,
) -> ArticleProcessor {
    ArticleProcessor::new(
        config,
        Collaborators {
            generator,
            research,
            store,
        },
    )
}

// ========== 测试 ==========

#[tokio::test]
async fn test_five_h2_outline_yields_seven_records_in_order() {
    let config = test_config();
    let generator = Arc::new(ScriptedGenerator::default());
    let research = Arc::new(StaticResearch::new(false));
    let store = Arc::new(MemoryStore::with_article(ArticleState::new("a1", KEYWORD)));
    let processor = processor(&config, generator.clone(), research.clone(), store.clone());

    let report = tokio_test::assert_ok!(processor.generate_article("a1", &outline(5, 0, false)).await);

    assert!(report.is_complete(), "{:?}", report.failures);
    let indices: Vec<String> = report.sections.iter().map(|s| s.index.to_string()).collect();
    assert_eq!(indices, vec!["0", "1", "2", "3", "4", "5", "6"]);
    assert_eq!(report.sections[0].section_type, SectionType::Introduction);
    assert_eq!(report.sections[6].section_type, SectionType::Conclusion);

    let intro_time = report.sections[0].generated_at;
    assert!(report.sections[1..].iter().all(|s| s.generated_at >= intro_time));

    // H2 都带有来源和引用
    for h2 in report.sections.iter().filter(|s| s.section_type == SectionType::H2) {
        assert!(!h2.research_sources.is_empty());
        assert_eq!(h2.citations_included, 1);
        assert!(h2.content.contains("[1](https://"));
    }

    assert_eq!(store.sections("a1").len(), 7);
    assert_eq!(research.calls.load(Ordering::SeqCst), 1);
    assert_eq!(generator.total_calls(), 7);
    assert!(report
        .section_states
        .values()
        .all(|s| *s == SectionState::Persisted));
    assert_eq!(report.performance.metrics.api_calls_of(ApiKind::Generation), 7);
    assert!(report.performance.metrics.phase_timings.contains_key(&Phase::Total));
}

#[tokio::test]
async fn test_h3_and_faq_are_generated() {
    let config = test_config();
    let generator = Arc::new(ScriptedGenerator::default());
    let store = Arc::new(MemoryStore::with_article(ArticleState::new("a1", KEYWORD)));
    let processor = processor(
        &config,
        generator,
        Arc::new(StaticResearch::new(false)),
        store.clone(),
    );
    let outline = outline(2, 2, true);

    let report = processor.generate_article("a1", &outline).await.unwrap();

    assert!(report.is_complete(), "{:?}", report.failures);
    let expected: Vec<SectionIndex> = outline.nodes().iter().map(|n| n.index).collect();
    let actual: Vec<SectionIndex> = report.sections.iter().map(|s| s.index).collect();
    assert_eq!(actual, expected);
    assert_eq!(actual.len(), 1 + 2 + 4 + 1 + 1);
    assert_eq!(actual.last().map(ToString::to_string), Some("4".to_string()));
    assert!(actual.contains(&SectionIndex::child(2, 2)));
    assert_eq!(store.sections("a1").len(), 9);
}

#[tokio::test]
async fn test_h3_sees_parent_beyond_context_window() {
    let config = test_config();
    assert!(config.context_window < 8);
    let generator = Arc::new(ScriptedGenerator::default());
    let store = Arc::new(MemoryStore::with_article(ArticleState::new("a1", KEYWORD)));
    let processor = processor(
        &config,
        generator.clone(),
        Arc::new(StaticResearch::new(false)),
        store,
    );

    let report = processor.generate_article("a1", &outline(8, 1, false)).await.unwrap();
    assert!(report.is_complete());

    // 全部 H2 完成后才生成 H3，此时 Topic 1 早已滑出滚动窗口
    let prompt = generator.last_prompt_for("Detail 1.1");
    assert!(!prompt.contains("- [1] Topic 1"));
    assert!(prompt.contains("Parent section \"Topic 1\""));
    assert!(generator
        .last_prompt_for("Detail 8.1")
        .contains("Parent section \"Topic 8\""));
}

#[tokio::test]
async fn test_research_failure_degrades_to_empty_sources() {
    let config = test_config();
    let research = Arc::new(StaticResearch::new(true));
    let store = Arc::new(MemoryStore::with_article(ArticleState::new("a1", KEYWORD)));
    let processor = processor(
        &config,
        Arc::new(ScriptedGenerator::default()),
        research.clone(),
        store,
    );

    let report = processor.generate_article("a1", &outline(3, 1, false)).await.unwrap();

    assert!(report.is_complete(), "{:?}", report.failures);
    assert_eq!(report.sections.len(), 1 + 3 + 3 + 1);
    for section in &report.sections {
        assert!(section.research_sources.is_empty());
        assert_eq!(section.citations_included, 0);
        assert!(section.quality_metrics.research_degraded);
    }
    // 失败的综合搜索不会触发定向搜索
    assert_eq!(research.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_keyword_stuffing_triggers_one_regeneration() {
    let config = test_config();
    let generator = Arc::new(ScriptedGenerator {
        stuffed: Some(("Topic 2".to_string(), false)),
        ..Default::default()
    });
    let store = Arc::new(MemoryStore::with_article(ArticleState::new("a1", KEYWORD)));
    let processor = processor(
        &config,
        generator.clone(),
        Arc::new(StaticResearch::new(false)),
        store,
    );

    let report = processor.generate_article("a1", &outline(3, 0, false)).await.unwrap();

    let section = report
        .sections
        .iter()
        .find(|s| s.title == "Topic 2")
        .unwrap();
    assert!(section.quality_metrics.passed);
    assert_eq!(section.quality_metrics.regeneration_attempts, 1);
    assert!(!section.content.starts_with("compost compost"));
    assert_eq!(generator.calls_for("Topic 2"), 2);
    assert_eq!(report.performance.metrics.regenerations, 1);
}

#[tokio::test]
async fn test_unfixable_section_is_accepted_with_issues() {
    let config = test_config();
    let generator = Arc::new(ScriptedGenerator {
        stuffed: Some(("Topic 1".to_string(), true)),
        ..Default::default()
    });
    let store = Arc::new(MemoryStore::with_article(ArticleState::new("a1", KEYWORD)));
    let processor = processor(
        &config,
        generator.clone(),
        Arc::new(StaticResearch::new(false)),
        store,
    );

    let report = processor.generate_article("a1", &outline(2, 0, false)).await.unwrap();

    assert!(report.is_complete());
    let section = &report.sections[1];
    assert_eq!(section.title, "Topic 1");
    assert!(!section.quality_metrics.passed);
    assert!(section
        .quality_metrics
        .critical_issues
        .iter()
        .any(|i| i.starts_with("keyword_stuffing")));
    assert_eq!(section.quality_metrics.regeneration_attempts, 1);
    assert_eq!(generator.calls_for("Topic 1"), 2);
}

#[tokio::test]
async fn test_generation_failure_is_isolated() {
    let config = test_config();
    let generator = Arc::new(ScriptedGenerator {
        failing_title: Some("Topic 2".to_string()),
        ..Default::default()
    });
    let store = Arc::new(MemoryStore::with_article(ArticleState::new("a1", KEYWORD)));
    let processor = processor(
        &config,
        generator.clone(),
        Arc::new(StaticResearch::new(false)),
        store.clone(),
    );

    let report = processor.generate_article("a1", &outline(3, 1, false)).await.unwrap();

    assert_eq!(report.failures.len(), 1);
    let failure = &report.failures[0];
    assert_eq!(failure.index, SectionIndex::top(2));
    assert!(!failure.retryable);
    assert!(failure.error.contains("content policy"));
    // 非瞬时错误不重试
    assert_eq!(generator.calls_for("Topic 2"), 1);
    assert_eq!(report.section_states[&SectionIndex::top(2)], SectionState::Failed);

    // 其余章节（包括失败 H2 的子章节）仍然完成
    assert_eq!(report.sections.len(), 1 + 2 + 3 + 1);
    assert!(report.sections.iter().any(|s| s.index == SectionIndex::child(2, 1)));
    assert_eq!(store.sections("a1").len(), 7);
}

#[tokio::test]
async fn test_numeric_article_id_does_not_trigger_retry() {
    let config = test_config();
    let generator = Arc::new(ScriptedGenerator {
        failing_title: Some("Topic 1".to_string()),
        ..Default::default()
    });
    let store = Arc::new(MemoryStore::with_article(ArticleState::new("post-500", KEYWORD)));
    let processor = processor(
        &config,
        generator.clone(),
        Arc::new(StaticResearch::new(false)),
        store.clone(),
    );

    let report = processor.generate_article("post-500", &outline(2, 0, false)).await.unwrap();

    assert_eq!(report.failures.len(), 1);
    assert!(!report.failures[0].retryable);
    assert_eq!(generator.calls_for("Topic 1"), 1);
}

#[tokio::test]
async fn test_resume_reuses_persisted_sections() {
    let config = test_config();
    let mut state = ArticleState::new("a1", KEYWORD);
    state.sections.push(SectionRecord {
        section_type: SectionType::Introduction,
        index: SectionIndex::INTRODUCTION,
        title: "Why compost".to_string(),
        content: "Existing intro about compost.".to_string(),
        word_count: 4,
        research_sources: vec![],
        citations_included: 0,
        tokens_used: 10,
        quality_metrics: QualityMetrics::default(),
        generated_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    });
    let generator = Arc::new(ScriptedGenerator::default());
    let store = Arc::new(MemoryStore::with_article(state));
    let processor = processor(
        &config,
        generator.clone(),
        Arc::new(StaticResearch::new(false)),
        store.clone(),
    );

    let report = processor.generate_article("a1", &outline(2, 0, false)).await.unwrap();

    assert_eq!(report.sections.len(), 4);
    assert_eq!(report.sections[0].content, "Existing intro about compost.");
    assert_eq!(generator.calls_for("Why compost"), 0);
    assert_eq!(generator.total_calls(), 3);

    // 再跑一次：全部复用，研究缓存命中
    let again = processor.generate_article("a1", &outline(2, 0, false)).await.unwrap();
    assert_eq!(again.sections, store.sections("a1"));
    assert_eq!(generator.total_calls(), 3);
    let metrics = processor.monitor().snapshot("a1").unwrap();
    assert!(metrics.cache_hits >= 1);
}

#[tokio::test]
async fn test_second_acquire_within_ttl_skips_research() {
    let config = test_config();
    let research = Arc::new(StaticResearch::new(false));
    let store = Arc::new(MemoryStore::with_article(ArticleState::new("a1", KEYWORD)));
    let processor = processor(
        &config,
        Arc::new(ScriptedGenerator::default()),
        research.clone(),
        store,
    );
    let outline = outline(2, 0, false);

    processor.generate_article("a1", &outline).await.unwrap();
    let after_first = research.calls.load(Ordering::SeqCst);
    processor
        .generate_section("a1", SectionIndex::top(1), &outline)
        .await
        .unwrap();

    assert_eq!(research.calls.load(Ordering::SeqCst), after_first);
    assert_eq!(processor.research_cache().stats().entries, 1);
}

#[tokio::test]
async fn test_batch_write_failure_falls_back_to_single_writes() {
    let config = Config {
        persist_batch_size: 3,
        ..test_config()
    };
    let store = Arc::new(MemoryStore {
        reject_batches: true,
        ..MemoryStore::with_article(ArticleState::new("a1", KEYWORD))
    });
    let processor = processor(
        &config,
        Arc::new(ScriptedGenerator::default()),
        Arc::new(StaticResearch::new(false)),
        store.clone(),
    );

    let report = processor.generate_article("a1", &outline(4, 0, false)).await.unwrap();

    assert!(report.is_complete(), "{:?}", report.failures);
    assert_eq!(store.sections("a1").len(), 6);
    // 引言 1 次；H2 两批（3 + 1），第一批失败后逐条 3 次；结论 1 次
    assert_eq!(store.writes.load(Ordering::SeqCst), 1 + (1 + 3) + 1 + 1);
}

#[tokio::test]
async fn test_sections_persist_as_siblings_complete() {
    let config = Config {
        persist_batch_size: 1,
        ..test_config()
    };
    let generator = Arc::new(ScriptedGenerator {
        slow_title: Some(("Topic 1".to_string(), Duration::from_millis(300))),
        ..Default::default()
    });
    let store = Arc::new(MemoryStore::with_article(ArticleState::new("a1", KEYWORD)));
    let processor = processor(
        &config,
        generator,
        Arc::new(StaticResearch::new(false)),
        store.clone(),
    );

    let report = processor.generate_article("a1", &outline(3, 0, false)).await.unwrap();
    assert!(report.is_complete());

    // 最慢的 Topic 1 不会阻塞同批已完成章节的写入
    let order = store.saved_order.lock().clone();
    let h2_order: Vec<_> = order.into_iter().filter(|i| (1..=3).contains(&i.major())).collect();
    assert_eq!(h2_order.len(), 3);
    assert_eq!(h2_order.last(), Some(&SectionIndex::top(1)));
}

#[tokio::test]
async fn test_generate_section_replaces_single_record() {
    let config = test_config();
    let generator = Arc::new(ScriptedGenerator::default());
    let store = Arc::new(MemoryStore::with_article(ArticleState::new("a1", KEYWORD)));
    let processor = processor(
        &config,
        generator.clone(),
        Arc::new(StaticResearch::new(false)),
        store.clone(),
    );
    let outline = outline(2, 1, false);
    processor.generate_article("a1", &outline).await.unwrap();

    let record = processor
        .generate_section("a1", SectionIndex::child(1, 1), &outline)
        .await
        .unwrap();

    assert_eq!(record.title, "Detail 1.1");
    assert_eq!(generator.calls_for("Detail 1.1"), 2);
    let stored = store.sections("a1");
    assert_eq!(stored.len(), 6);
    assert_eq!(
        stored.iter().find(|s| s.index == SectionIndex::child(1, 1)),
        Some(&record)
    );

    let missing = processor
        .generate_section("a1", SectionIndex::child(9, 9), &outline)
        .await;
    assert!(missing.is_err());
}

#[tokio::test]
async fn test_global_limit_holds_across_articles() {
    let config = Config {
        global_concurrency: 2,
        per_article_concurrency: 4,
        ..test_config()
    };
    let generator = Arc::new(ScriptedGenerator {
        delay: Duration::from_millis(20),
        ..Default::default()
    });
    let store = Arc::new(MemoryStore::default());
    for id in ["a1", "a2"] {
        store
            .articles
            .lock()
            .insert(id.to_string(), ArticleState::new(id, KEYWORD));
    }
    let processor = Arc::new(processor(
        &config,
        generator.clone(),
        Arc::new(StaticResearch::new(false)),
        store.clone(),
    ));
    let outline = outline(5, 0, false);

    let (first, second) = tokio::join!(
        processor.generate_article("a1", &outline),
        processor.generate_article("a2", &outline)
    );

    assert!(first.unwrap().is_complete());
    assert!(second.unwrap().is_complete());
    assert!(generator.peak.load(Ordering::SeqCst) <= 2);
    let limiter = processor.limiter().stats();
    assert!(limiter.peak <= 2);
    assert_eq!(limiter.active, 0);
    assert_eq!(limiter.total_admitted, 14);
}

#[tokio::test]
async fn test_missing_article_is_an_error() {
    let config = test_config();
    let processor = processor(
        &config,
        Arc::new(ScriptedGenerator::default()),
        Arc::new(StaticResearch::new(false)),
        Arc::new(MemoryStore::default()),
    );
    let result = processor.generate_article("nope", &outline(1, 0, false)).await;
    assert!(result.is_err());
}

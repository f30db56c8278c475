//! 研究缓存 - 业务能力层
//!
//! 每篇文章最多两次外部搜索（一次综合、一次可选的定向补充），结果按文章缓存，
//! 各章节从缓存中按相关度取来源。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clients::ResearchProvider;
use crate::config::Config;
use crate::models::{Outline, Source};
use crate::services::performance_monitor::{ApiKind, Phase, PerformanceMonitor};

/// 被认可的机构域名
static AUTHORITY_DOMAINS: phf::Set<&'static str> = phf::phf_set! {
    "wikipedia.org",
    "who.int",
    "cdc.gov",
    "nih.gov",
    "ncbi.nlm.nih.gov",
    "nature.com",
    "sciencedirect.com",
    "harvard.edu",
    "mayoclinic.org",
    "britannica.com",
    "reuters.com",
    "apnews.com",
    "bbc.co.uk",
    "nytimes.com",
    "oecd.org",
    "worldbank.org",
    "europa.eu",
    "un.org",
};

const AUTHORITY_SUFFIXES: [&str; 3] = [".gov", ".edu", ".int"];

const STOPWORDS: [&str; 16] = [
    "the", "and", "for", "with", "from", "that", "this", "your", "what", "when", "how", "why",
    "into", "about", "are", "you",
];

/// 研究缓存条目
///
/// 以 `Arc` 形式存放在缓存中，读者拿到的始终是完整条目。
#[derive(Debug, Clone)]
pub struct ResearchCacheEntry {
    pub article_id: String,
    pub keyword: String,
    pub comprehensive_sources: Vec<Source>,
    /// 章节标题 → 排序后的来源
    pub section_specific_sources: HashMap<String, Vec<Source>>,
    pub generated_at: DateTime<Utc>,
    pub ttl: Duration,
    /// 外部搜索失败时为 true（来源为空但仍然有效）
    pub degraded: bool,
    created: Instant,
}

impl ResearchCacheEntry {
    pub fn is_expired(&self) -> bool {
        self.created.elapsed() >= self.ttl
    }
}

/// 缓存统计
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub api_calls: u64,
    pub hit_rate: f64,
}

/// 研究缓存服务
///
/// 职责：
/// - 按文章缓存外部搜索结果（带 TTL）
/// - 为章节按相关度排序来源
/// - 搜索失败时降级为空来源，不向上抛错
pub struct ResearchCache {
    provider: Arc<dyn ResearchProvider>,
    monitor: Arc<PerformanceMonitor>,
    entries: RwLock<HashMap<String, Arc<ResearchCacheEntry>>>,
    /// 每篇文章一个填充锁，保证并发 acquire 时只有一个写者
    fill_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    ttl: Duration,
    max_sources: usize,
    sparse_threshold: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    api_calls: AtomicU64,
}

impl ResearchCache {
    pub fn new(provider: Arc<dyn ResearchProvider>, monitor: Arc<PerformanceMonitor>, config: &Config) -> Self {
        Self {
            provider,
            monitor,
            entries: RwLock::new(HashMap::new()),
            fill_locks: Mutex::new(HashMap::new()),
            ttl: config.research_cache_ttl(),
            max_sources: config.max_sources_per_section,
            sparse_threshold: config.sparse_source_threshold,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            api_calls: AtomicU64::new(0),
        }
    }

    fn fresh_entry(&self, article_id: &str) -> Option<Arc<ResearchCacheEntry>> {
        self.entries
            .read()
            .get(article_id)
            .filter(|e| !e.is_expired())
            .cloned()
    }

    /// 获取文章的研究结果，未命中时执行外部搜索
    pub async fn acquire(&self, article_id: &str, keyword: &str, outline: &Outline) -> Arc<ResearchCacheEntry> {
        if let Some(entry) = self.fresh_entry(article_id) {
            self.record_hit(article_id);
            return entry;
        }

        let fill_lock = self
            .fill_locks
            .lock()
            .entry(article_id.to_string())
            .or_default()
            .clone();
        let _filling = fill_lock.lock().await;

        // 等锁期间其他任务可能已经填充
        if let Some(entry) = self.fresh_entry(article_id) {
            self.record_hit(article_id);
            return entry;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.monitor.record_cache(article_id, false);
        let _timer = self.monitor.time_phase(article_id, Phase::Research);

        let entry = Arc::new(self.fetch(article_id, keyword, outline).await);
        self.entries
            .write()
            .insert(article_id.to_string(), Arc::clone(&entry));
        entry
    }

    fn record_hit(&self, article_id: &str) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.monitor.record_cache(article_id, true);
        debug!("[文章 {}] 研究缓存命中", article_id);
    }

    async fn search(&self, article_id: &str, query: &str) -> Option<Vec<Source>> {
        self.api_calls.fetch_add(1, Ordering::Relaxed);
        self.monitor.record_api_call(article_id, ApiKind::Research);
        match self.provider.search(query).await {
            Ok(sources) => Some(sources),
            Err(e) => {
                warn!("[文章 {}] ⚠️ 研究搜索失败，降级为无来源: {:#}", article_id, e);
                None
            }
        }
    }

    async fn fetch(&self, article_id: &str, keyword: &str, outline: &Outline) -> ResearchCacheEntry {
        let comprehensive_query = build_comprehensive_query(keyword, outline);
        info!("[文章 {}] 🔍 综合研究搜索: {}", article_id, comprehensive_query);

        let mut degraded = false;
        let mut sources = match self.search(article_id, &comprehensive_query).await {
            Some(sources) => dedupe_sources(sources),
            None => {
                degraded = true;
                Vec::new()
            }
        };

        // 综合结果稀少时，对前几个章节做一次定向补充
        if !degraded && sources.len() < self.sparse_threshold {
            let targeted_query = build_targeted_query(keyword, outline);
            info!(
                "[文章 {}] 综合结果仅 {} 个，定向补充搜索: {}",
                article_id,
                sources.len(),
                targeted_query
            );
            if let Some(extra) = self.search(article_id, &targeted_query).await {
                sources.extend(extra);
                sources = dedupe_sources(sources);
            }
        }

        let year = Utc::now().year();
        let section_specific_sources = outline
            .nodes()
            .into_iter()
            .map(|node| {
                let ranked = rank_sources(&sources, keyword, &node.title, year, self.max_sources);
                (node.title, ranked)
            })
            .collect();

        info!(
            "[文章 {}] ✓ 研究完成，共 {} 个来源{}",
            article_id,
            sources.len(),
            if degraded { "（降级）" } else { "" }
        );

        ResearchCacheEntry {
            article_id: article_id.to_string(),
            keyword: keyword.to_string(),
            comprehensive_sources: sources,
            section_specific_sources,
            generated_at: Utc::now(),
            ttl: self.ttl,
            degraded,
            created: Instant::now(),
        }
    }

    /// 章节可用的来源（最多 `max_sources` 个）
    ///
    /// 条目不存在或已过期时返回空列表。
    pub fn sources_for(&self, article_id: &str, section_title: &str) -> Vec<Source> {
        let Some(entry) = self.fresh_entry(article_id) else {
            return Vec::new();
        };
        if let Some(sources) = entry.section_specific_sources.get(section_title) {
            return sources.clone();
        }
        rank_sources(
            &entry.comprehensive_sources,
            &entry.keyword,
            section_title,
            Utc::now().year(),
            self.max_sources,
        )
    }

    /// 文章的研究是否处于降级状态
    pub fn is_degraded(&self, article_id: &str) -> bool {
        self.fresh_entry(article_id).map_or(true, |e| e.degraded)
    }

    /// 清除过期条目，返回清除数量
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired());
        let removed = before - entries.len();
        drop(entries);

        if removed > 0 {
            let live: HashSet<String> = self.entries.read().keys().cloned().collect();
            self.fill_locks
                .lock()
                .retain(|id, lock| live.contains(id) || Arc::strong_count(lock) > 1);
            info!("🧹 研究缓存清理: 移除 {} 个过期条目", removed);
        }
        removed
    }

    /// 启动周期性清理任务
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match cache.upgrade() {
                    Some(cache) => {
                        cache.purge_expired();
                    }
                    None => break,
                }
            }
        })
    }

    /// 显式清除某篇文章的缓存
    pub fn clear(&self, article_id: &str) {
        self.entries.write().remove(article_id);
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            entries: self.entries.read().len(),
            hits,
            misses,
            api_calls: self.api_calls.load(Ordering::Relaxed),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }
}

fn build_comprehensive_query(keyword: &str, outline: &Outline) -> String {
    let topics: Vec<&str> = outline.h2_titles().take(4).collect();
    if topics.is_empty() {
        keyword.to_string()
    } else {
        format!("{} {}", keyword, topics.join(" "))
    }
}

fn build_targeted_query(keyword: &str, outline: &Outline) -> String {
    let top: Vec<&str> = outline.h2_titles().take(2).collect();
    format!("{} {} statistics research", keyword, top.join(" "))
}

/// 按 URL 去重，保留首次出现的顺序
pub fn dedupe_sources(sources: Vec<Source>) -> Vec<Source> {
    let mut seen = HashSet::new();
    sources
        .into_iter()
        .filter(|s| seen.insert(s.dedup_key()))
        .collect()
}

fn significant_terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|t| t.to_lowercase())
        .filter(|t| t.chars().count() > 3 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

fn is_authority(source: &Source) -> bool {
    let Some(domain) = source.domain() else {
        return false;
    };
    if AUTHORITY_DOMAINS.contains(domain.as_str()) {
        return true;
    }
    // 子域名也算（例如 en.wikipedia.org）
    if AUTHORITY_DOMAINS
        .iter()
        .any(|d| domain.ends_with(&format!(".{}", d)))
    {
        return true;
    }
    AUTHORITY_SUFFIXES.iter().any(|s| domain.ends_with(s))
}

/// 来源与章节的相关度
pub fn relevance_score(source: &Source, keyword: &str, section_title: &str, current_year: i32) -> u32 {
    let title = source.title.to_lowercase();
    let excerpt = source.excerpt.to_lowercase();
    let keyword = keyword.trim().to_lowercase();
    let mut score = 0;

    if !keyword.is_empty() {
        if title.contains(&keyword) {
            score += 10;
        }
        if excerpt.contains(&keyword) {
            score += 5;
        }
    }

    let mut seen = HashSet::new();
    for term in significant_terms(section_title) {
        if !seen.insert(term.clone()) {
            continue;
        }
        if title.contains(&term) {
            score += 3;
        } else if excerpt.contains(&term) {
            score += 1;
        }
    }

    if is_authority(source) {
        score += 4;
    }

    let year = current_year.to_string();
    let fresh = title.contains(&year)
        || excerpt.contains(&year)
        || source.published_date.as_deref().is_some_and(|d| d.contains(&year));
    if fresh {
        score += 2;
    }

    score
}

/// 按相关度降序排列，分数相同保持原始顺序
pub fn rank_sources(sources: &[Source], keyword: &str, section_title: &str, current_year: i32, limit: usize) -> Vec<Source> {
    let mut scored: Vec<(u32, &Source)> = sources
        .iter()
        .map(|s| (relevance_score(s, keyword, section_title, current_year), s))
        .collect();
    // sort_by 是稳定排序
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored
        .into_iter()
        .take(limit)
        .map(|(_, s)| s.clone())
        .collect()
}

//! 上下文构建 - 业务能力层
//!
//! 维护每篇文章已完成章节的滚动摘要，在 token 上限内为下一个章节拼装上下文

use std::collections::{BTreeMap, HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::models::{SectionIndex, SectionRecord, SectionType};

/// 截断标记
pub const TRUNCATION_MARKER: &str = "\n[...context truncated]";

/// 每个压缩摘要保留的句子数
const COMPRESSED_SENTENCES: usize = 2;
/// 压缩摘要的字符上限
const COMPRESSED_MAX_CHARS: usize = 280;

/// 估算 token 数（约 4 个字符一个 token）
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// 单个章节的摘要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionDigest {
    pub index: SectionIndex,
    pub section_type: SectionType,
    pub title: String,
    /// 高保真摘要（仅最近一个章节使用）
    pub detailed: String,
    /// 2~3 句的压缩摘要
    pub compressed: String,
    pub word_count: usize,
}

/// 每篇文章的上下文缓存
#[derive(Debug, Clone, Default)]
pub struct ContextCacheEntry {
    pub article_id: String,
    pub keyword: String,
    /// 按纳入顺序排列，超出窗口时淘汰最早的
    pub rolling_summary: VecDeque<SectionDigest>,
    /// 所有已纳入章节的摘要，不受窗口淘汰影响，文章结束时随条目一起清除
    pub digest_by_index: BTreeMap<SectionIndex, SectionDigest>,
    pub last_section_index: Option<SectionIndex>,
    pub total_word_count: usize,
}

impl ContextCacheEntry {
    pub fn digest(&self, index: SectionIndex) -> Option<&SectionDigest> {
        self.digest_by_index.get(&index)
    }

    pub fn is_incorporated(&self, index: SectionIndex) -> bool {
        self.digest_by_index.contains_key(&index)
    }
}

/// 上下文统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub articles: usize,
    pub digests: usize,
}

/// 上下文构建器
///
/// 职责：
/// - 把新完成的章节压缩进滚动摘要
/// - 按 token 上限拼装上下文，超限时在段落/句子边界截断
/// - 相同输入重复调用返回相同结果
pub struct ContextBuilder {
    entries: Mutex<HashMap<String, ContextCacheEntry>>,
    max_tokens: usize,
    window: usize,
    recent_chars: usize,
}

impl ContextBuilder {
    pub fn new(config: &Config) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_tokens: config.context_max_tokens,
            window: config.context_window.max(1),
            recent_chars: config.recent_digest_chars,
        }
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// 为指定章节构建上下文
    pub fn build_context(
        &self,
        article_id: &str,
        keyword: &str,
        section_index: SectionIndex,
        prior_sections: &[SectionRecord],
        target_word_count: u32,
    ) -> String {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(article_id.to_string())
            .or_insert_with(|| ContextCacheEntry {
                article_id: article_id.to_string(),
                keyword: keyword.to_string(),
                ..Default::default()
            });

        self.incorporate(entry, section_index, prior_sections);

        let header = format!("Keyword focus: {}\n", entry.keyword);
        let footer = format!("\nTarget length: about {} words.", target_word_count);
        let summary = self.render_summary(entry, section_index);

        let context = self.fit_to_budget(&header, &summary, &footer);
        debug!(
            "[文章 {}] 章节 {} 上下文: {} 字符, 约 {} tokens",
            article_id,
            section_index,
            context.chars().count(),
            estimate_tokens(&context)
        );
        context
    }

    fn incorporate(&self, entry: &mut ContextCacheEntry, current: SectionIndex, prior_sections: &[SectionRecord]) {
        let mut fresh: Vec<&SectionRecord> = prior_sections
            .iter()
            .filter(|s| s.index != current && !entry.is_incorporated(s.index))
            .collect();
        fresh.sort_by_key(|s| s.index);

        for section in fresh {
            let digest = SectionDigest {
                index: section.index,
                section_type: section.section_type,
                title: section.title.clone(),
                detailed: digest_text(&section.content, usize::MAX, self.recent_chars),
                compressed: digest_text(&section.content, COMPRESSED_SENTENCES, COMPRESSED_MAX_CHARS),
                word_count: section.word_count,
            };
            entry.digest_by_index.insert(section.index, digest.clone());
            entry.rolling_summary.push_back(digest);
            entry.total_word_count += section.word_count;
            entry.last_section_index = Some(section.index);

            while entry.rolling_summary.len() > self.window {
                entry.rolling_summary.pop_front();
            }
        }
    }

    fn render_summary(&self, entry: &ContextCacheEntry, current: SectionIndex) -> String {
        let digests: Vec<&SectionDigest> = entry
            .rolling_summary
            .iter()
            .filter(|d| d.index != current)
            .collect();
        if digests.is_empty() {
            return "This is the first section of the article.".to_string();
        }

        let mut lines = Vec::new();
        // H3 引用父级 H2，即使父级摘要已滑出窗口；放在最前面，截断时保留
        if let Some(parent) = current.parent() {
            if let Some(digest) = entry.digest(parent) {
                lines.push(format!("Parent section \"{}\": {}", digest.title, digest.compressed));
            }
        }

        lines.push(format!("Already covered ({} words so far):", entry.total_word_count));
        let last = digests.len() - 1;
        for (i, digest) in digests.iter().enumerate() {
            let text = if i == last { &digest.detailed } else { &digest.compressed };
            lines.push(format!("- [{}] {}: {}", digest.index, digest.title, text));
        }

        lines.join("\n")
    }

    /// 保证结果的 token 估算不超过上限
    fn fit_to_budget(&self, header: &str, summary: &str, footer: &str) -> String {
        let budget_chars = self.max_tokens * 4;
        let full = format!("{}{}{}", header, summary, footer);
        if full.chars().count() <= budget_chars {
            return full;
        }

        let fixed = header.chars().count() + footer.chars().count() + TRUNCATION_MARKER.chars().count();
        if fixed < budget_chars {
            let cut = truncate_at_boundary(summary, budget_chars - fixed);
            return format!("{}{}{}{}", header, cut, TRUNCATION_MARKER, footer);
        }

        // 关键词本身就超长：整体截断
        let marker_len = TRUNCATION_MARKER.chars().count();
        let cut = truncate_at_boundary(&full, budget_chars.saturating_sub(marker_len));
        format!("{}{}", cut, TRUNCATION_MARKER)
    }

    pub fn clear(&self, article_id: &str) {
        self.entries.lock().remove(article_id);
    }

    pub fn snapshot(&self, article_id: &str) -> Option<ContextCacheEntry> {
        self.entries.lock().get(article_id).cloned()
    }

    pub fn stats(&self) -> ContextStats {
        let entries = self.entries.lock();
        ContextStats {
            articles: entries.len(),
            digests: entries.values().map(|e| e.rolling_summary.len()).sum(),
        }
    }
}

/// 去掉标题行与引用链接后的纯文本
fn plain_text(content: &str) -> String {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect::<Vec<_>>()
        .join(" ")
}

/// 取前 `max_sentences` 句，且不超过 `max_chars` 个字符
fn digest_text(content: &str, max_sentences: usize, max_chars: usize) -> String {
    let text = plain_text(content);
    let mut out = String::new();
    for sentence in split_sentences(&text).into_iter().take(max_sentences) {
        let candidate_len = out.chars().count() + sentence.chars().count() + 1;
        if candidate_len > max_chars {
            if out.is_empty() {
                return truncate_at_boundary(sentence, max_chars);
            }
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(sentence);
    }
    out
}

/// 按句末标点切句，保留标点
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    for (i, &(pos, c)) in chars.iter().enumerate() {
        let is_end = matches!(c, '.' | '!' | '?' | '。' | '！' | '？');
        let next_is_space = chars.get(i + 1).map_or(true, |&(_, n)| n.is_whitespace());
        if is_end && next_is_space {
            let end = pos + c.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }
    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

/// 在 `max_chars` 以内的最近段落/句子/空白边界处截断，从不截断单词
pub fn truncate_at_boundary(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let byte_limit = text
        .char_indices()
        .nth(max_chars)
        .map_or(text.len(), |(i, _)| i);
    let window = &text[..byte_limit];

    if let Some(pos) = window.rfind("\n\n").filter(|&p| p > 0) {
        return window[..pos].trim_end().to_string();
    }
    let sentence_end = window
        .char_indices()
        .filter(|&(i, c)| {
            matches!(c, '.' | '!' | '?' | '。' | '！' | '？')
                && text[i + c.len_utf8()..]
                    .chars()
                    .next()
                    .map_or(true, char::is_whitespace)
        })
        .map(|(i, c)| i + c.len_utf8())
        .last();
    if let Some(end) = sentence_end {
        return window[..end].to_string();
    }
    // 下一个字符是空白时，窗口末尾本身就是单词边界
    if text[byte_limit..].starts_with(char::is_whitespace) {
        return window.trim_end().to_string();
    }
    match window.rfind(char::is_whitespace) {
        Some(pos) => window[..pos].trim_end().to_string(),
        None => String::new(),
    }
}

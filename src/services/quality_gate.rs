//! 质量门 - 业务能力层
//!
//! 对生成的章节做纯函数式检查，给出严重/次要问题与分数，并对可修复的次要问题做自动修复

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::models::{count_words, QualityMetrics, SectionType};
use crate::services::context_builder::split_sentences;

/// 自动修复后允许的最少单词数
pub const MIN_VIABLE_WORDS: usize = 40;
/// 超过该单词数的段落视为过长
const LONG_PARAGRAPH_WORDS: usize = 150;
/// 拆分段落时每段的目标单词数
const SPLIT_PARAGRAPH_WORDS: usize = 80;
/// 每多少单词期望出现一次引用
const WORDS_PER_CITATION: usize = 200;

static CITATION_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\d+\]").expect("citation regex"));
static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+\S").expect("heading regex"));
static EXCESS_BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("blank line regex"));

/// 检查项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QualityCheck {
    WordCount,
    CitationDensity,
    HeadingHierarchy,
    KeywordStuffing,
    DuplicateSentences,
    Formatting,
    FaqQuestions,
    KeywordPresence,
}

impl QualityCheck {
    pub fn name(self) -> &'static str {
        match self {
            QualityCheck::WordCount => "word_count",
            QualityCheck::CitationDensity => "citation_density",
            QualityCheck::HeadingHierarchy => "heading_hierarchy",
            QualityCheck::KeywordStuffing => "keyword_stuffing",
            QualityCheck::DuplicateSentences => "duplicate_sentences",
            QualityCheck::Formatting => "formatting",
            QualityCheck::FaqQuestions => "faq_questions",
            QualityCheck::KeywordPresence => "keyword_presence",
        }
    }

    /// 能否由 `auto_fix` 处理
    pub fn auto_fixable(self) -> bool {
        matches!(self, QualityCheck::Formatting | QualityCheck::HeadingHierarchy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Critical,
    Minor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityIssue {
    pub check: QualityCheck,
    pub severity: Severity,
    pub message: String,
    /// 标题层级问题所在章节的起始标题层级（H3 章节为 3）
    pub heading_base: Option<usize>,
}

impl QualityIssue {
    fn critical(check: QualityCheck, message: impl Into<String>) -> Self {
        Self {
            check,
            severity: Severity::Critical,
            message: message.into(),
            heading_base: None,
        }
    }

    fn minor(check: QualityCheck, message: impl Into<String>) -> Self {
        Self {
            check,
            severity: Severity::Minor,
            message: message.into(),
            heading_base: None,
        }
    }

    fn with_heading_base(mut self, level: usize) -> Self {
        self.heading_base = Some(level);
        self
    }
}

impl Display for QualityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.check.name(), self.message)
    }
}

/// 一次评估的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityResult {
    pub passed: bool,
    pub critical_issues: Vec<QualityIssue>,
    pub minor_issues: Vec<QualityIssue>,
    pub auto_fix_available: bool,
    pub quality_score: u8,
}

impl QualityResult {
    fn from_issues(issues: Vec<QualityIssue>) -> Self {
        let (critical_issues, minor_issues): (Vec<_>, Vec<_>) = issues
            .into_iter()
            .partition(|i| i.severity == Severity::Critical);
        let penalty = critical_issues.len() * 25 + minor_issues.len() * 5;
        Self {
            passed: critical_issues.is_empty(),
            auto_fix_available: minor_issues.iter().any(|i| i.check.auto_fixable()),
            quality_score: 100usize.saturating_sub(penalty) as u8,
            critical_issues,
            minor_issues,
        }
    }

    /// 严重问题涉及的检查项（去重，保持出现顺序）
    pub fn failing_checks(&self) -> Vec<QualityCheck> {
        let mut checks = Vec::new();
        for issue in &self.critical_issues {
            if !checks.contains(&issue.check) {
                checks.push(issue.check);
            }
        }
        checks
    }

    pub fn to_metrics(&self, auto_fixed: bool, regeneration_attempts: u32, research_degraded: bool) -> QualityMetrics {
        QualityMetrics {
            passed: self.passed,
            quality_score: self.quality_score,
            critical_issues: self.critical_issues.iter().map(ToString::to_string).collect(),
            minor_issues: self.minor_issues.iter().map(ToString::to_string).collect(),
            auto_fixed,
            regeneration_attempts,
            research_degraded,
        }
    }
}

/// 质量门
#[derive(Debug, Clone, Default)]
pub struct QualityGate;

impl QualityGate {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(
        &self,
        content: &str,
        target_word_count: u32,
        keyword: &str,
        section_type: SectionType,
    ) -> QualityResult {
        let words = count_words(content);
        let mut issues = Vec::new();

        check_word_band(words, target_word_count, &mut issues);
        if section_type.expects_citations() {
            check_citations(content, words, &mut issues);
        }
        check_headings(content, section_type, &mut issues);
        check_keyword_density(content, keyword, words, &mut issues);
        check_duplicates(content, &mut issues);
        check_formatting(content, &mut issues);

        match section_type {
            SectionType::Faq if !content.contains('?') => {
                issues.push(QualityIssue::critical(
                    QualityCheck::FaqQuestions,
                    "FAQ 中没有任何问题",
                ));
            }
            SectionType::Introduction if count_keyword(content, keyword) == 0 => {
                issues.push(QualityIssue::minor(
                    QualityCheck::KeywordPresence,
                    format!("引言未提及关键词 \"{}\"", keyword),
                ));
            }
            _ => {}
        }

        QualityResult::from_issues(issues)
    }

    /// 修复次要问题；修复结果不可接受时原样返回
    pub fn auto_fix(&self, content: &str, minor_issues: &[QualityIssue]) -> String {
        let wants = |check| minor_issues.iter().any(|i| i.check == check);
        if !wants(QualityCheck::Formatting) && !wants(QualityCheck::HeadingHierarchy) {
            return content.to_string();
        }

        let mut fixed = normalize_whitespace(content);
        if wants(QualityCheck::Formatting) {
            fixed = split_long_paragraphs(&fixed);
        }
        if wants(QualityCheck::HeadingHierarchy) {
            let base = minor_issues
                .iter()
                .find_map(|i| i.heading_base)
                .unwrap_or(2);
            fixed = repair_headings(&fixed, base);
        }

        let before = count_words(content);
        let after = count_words(&fixed);
        if after < MIN_VIABLE_WORDS.min(before) {
            debug!("自动修复结果过短 ({} 词)，放弃", after);
            return content.to_string();
        }
        if after * 10 < before * 9 {
            debug!("自动修复丢失超过 10% 的单词 ({} -> {})，放弃", before, after);
            return content.to_string();
        }
        if fence_count(&fixed) % 2 != fence_count(content) % 2 {
            debug!("自动修复破坏了代码块，放弃");
            return content.to_string();
        }
        fixed
    }
}

fn check_word_band(words: usize, target: u32, issues: &mut Vec<QualityIssue>) {
    if target == 0 {
        return;
    }
    let ratio = words as f64 / target as f64;
    let message = format!("{} 词，目标 {} 词", words, target);
    if ratio < 0.5 || ratio > 2.5 {
        issues.push(QualityIssue::critical(QualityCheck::WordCount, message));
    } else if ratio < 0.8 || ratio > 1.6 {
        issues.push(QualityIssue::minor(QualityCheck::WordCount, message));
    }
}

fn check_citations(content: &str, words: usize, issues: &mut Vec<QualityIssue>) {
    let citations = CITATION_MARKER.find_iter(content).count();
    let expected = words / WORDS_PER_CITATION;
    if citations == 0 && words >= 80 {
        issues.push(QualityIssue::minor(QualityCheck::CitationDensity, "正文没有引用来源"));
    } else if citations > 0 && citations < expected / 2 {
        issues.push(QualityIssue::minor(
            QualityCheck::CitationDensity,
            format!("{} 词只有 {} 处引用", words, citations),
        ));
    }
}

fn heading_levels(content: &str) -> Vec<usize> {
    let mut in_fence = false;
    let mut levels = Vec::new();
    for line in content.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(caps) = HEADING.captures(line) {
            levels.push(caps[1].len());
        }
    }
    levels
}

fn base_heading_level(section_type: SectionType) -> usize {
    match section_type {
        SectionType::H3 => 3,
        SectionType::Introduction | SectionType::H2 | SectionType::Conclusion | SectionType::Faq => 2,
    }
}

fn check_headings(content: &str, section_type: SectionType, issues: &mut Vec<QualityIssue>) {
    let levels = heading_levels(content);
    if levels.contains(&1) {
        issues.push(QualityIssue::critical(
            QualityCheck::HeadingHierarchy,
            "章节内出现 H1 标题",
        ));
    }
    let base = base_heading_level(section_type);
    let mut previous = base;
    for level in levels.into_iter().filter(|&l| l > 1) {
        if level > previous + 1 {
            issues.push(
                QualityIssue::minor(
                    QualityCheck::HeadingHierarchy,
                    format!("标题层级从 H{} 跳到 H{}", previous, level),
                )
                .with_heading_base(base),
            );
            return;
        }
        previous = level;
    }
}

fn count_keyword(content: &str, keyword: &str) -> usize {
    let keyword = keyword.trim();
    if keyword.is_empty() {
        return 0;
    }
    let pattern = format!(r"(?i)\b{}\b", regex::escape(keyword));
    Regex::new(&pattern)
        .map(|re| re.find_iter(content).count())
        .unwrap_or(0)
}

fn check_keyword_density(content: &str, keyword: &str, words: usize, issues: &mut Vec<QualityIssue>) {
    if words < 20 {
        return;
    }
    let keyword_words = keyword.split_whitespace().count().max(1);
    let density = (count_keyword(content, keyword) * keyword_words) as f64 / words as f64;
    let message = format!("关键词密度 {:.1}%", density * 100.0);
    if density > 0.03 {
        issues.push(QualityIssue::critical(QualityCheck::KeywordStuffing, message));
    } else if density > 0.025 {
        issues.push(QualityIssue::minor(QualityCheck::KeywordStuffing, message));
    }
}

fn normalize_sentence(sentence: &str) -> String {
    sentence
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn check_duplicates(content: &str, issues: &mut Vec<QualityIssue>) {
    let text = content
        .lines()
        .filter(|l| !l.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join(" ");
    let mut seen: HashMap<String, usize> = HashMap::new();
    for sentence in split_sentences(&text) {
        let normalized = normalize_sentence(sentence);
        if normalized.len() >= 20 {
            *seen.entry(normalized).or_default() += 1;
        }
    }
    let worst = seen.values().copied().max().unwrap_or(0);
    if worst >= 3 {
        issues.push(QualityIssue::critical(
            QualityCheck::DuplicateSentences,
            format!("同一句子重复 {} 次", worst),
        ));
    } else if worst == 2 {
        issues.push(QualityIssue::minor(QualityCheck::DuplicateSentences, "存在重复句子"));
    }
}

fn is_prose_paragraph(paragraph: &str) -> bool {
    let first = paragraph.trim_start();
    !(first.starts_with('#')
        || first.starts_with("```")
        || first.starts_with('-')
        || first.starts_with('*')
        || first.starts_with('|')
        || first.starts_with('>')
        || first.starts_with(|c: char| c.is_ascii_digit()))
}

fn check_formatting(content: &str, issues: &mut Vec<QualityIssue>) {
    let long = content
        .split("\n\n")
        .filter(|p| is_prose_paragraph(p) && !p.contains("```"))
        .any(|p| count_words(p) > LONG_PARAGRAPH_WORDS);
    if long {
        issues.push(QualityIssue::minor(
            QualityCheck::Formatting,
            format!("存在超过 {} 词的段落", LONG_PARAGRAPH_WORDS),
        ));
    }
    let messy = EXCESS_BLANK_LINES.is_match(content)
        || content.contains('\t')
        || content.lines().any(|l| l.ends_with(' ') && !l.ends_with("  "))
        || content.starts_with(char::is_whitespace);
    if messy {
        issues.push(QualityIssue::minor(QualityCheck::Formatting, "空白字符不规范"));
    }
}

fn fence_count(content: &str) -> usize {
    content
        .lines()
        .filter(|l| l.trim_start().starts_with("```"))
        .count()
}

fn normalize_whitespace(content: &str) -> String {
    let mut in_fence = false;
    let lines: Vec<String> = content
        .lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
                return line.trim_end().to_string();
            }
            if in_fence {
                line.to_string()
            } else {
                line.replace('\t', " ").trim_end().to_string()
            }
        })
        .collect();
    let joined = lines.join("\n");
    EXCESS_BLANK_LINES
        .replace_all(joined.trim(), "\n\n")
        .into_owned()
}

fn split_long_paragraphs(content: &str) -> String {
    content
        .split("\n\n")
        .map(|paragraph| {
            if !is_prose_paragraph(paragraph)
                || paragraph.contains("```")
                || count_words(paragraph) <= LONG_PARAGRAPH_WORDS
            {
                return paragraph.to_string();
            }
            let flat = paragraph.split_whitespace().collect::<Vec<_>>().join(" ");
            let mut chunks: Vec<String> = Vec::new();
            let mut current = String::new();
            for sentence in split_sentences(&flat) {
                if !current.is_empty() && count_words(&current) >= SPLIT_PARAGRAPH_WORDS {
                    chunks.push(std::mem::take(&mut current));
                }
                if !current.is_empty() {
                    current.push(' ');
                }
                current.push_str(sentence);
            }
            if !current.is_empty() {
                chunks.push(current);
            }
            chunks.join("\n\n")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn repair_headings(content: &str, base: usize) -> String {
    let mut in_fence = false;
    let mut previous = base;
    content
        .lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
            }
            if in_fence {
                return line.to_string();
            }
            let Some(caps) = HEADING.captures(line) else {
                return line.to_string();
            };
            let level = caps[1].len();
            let repaired = level.clamp(2, previous + 1);
            previous = repaired;
            format!("{}{}", "#".repeat(repaired), &line[level..])
        })
        .collect::<Vec<_>>()
        .join("\n")
}

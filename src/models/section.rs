use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::outline::{SectionIndex, SectionType};
use crate::models::source::Source;

/// 质量指标（质量门结果的持久化摘要）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub passed: bool,
    pub quality_score: u8,
    /// 未解决的严重问题
    #[serde(default)]
    pub critical_issues: Vec<String>,
    #[serde(default)]
    pub minor_issues: Vec<String>,
    /// 是否应用了自动修复
    #[serde(default)]
    pub auto_fixed: bool,
    /// 实际执行的重新生成次数
    #[serde(default)]
    pub regeneration_attempts: u32,
    /// 研究服务不可用或无结果
    #[serde(default)]
    pub research_degraded: bool,
}

/// 章节记录
///
/// 生成成功后只会被整体替换，不做原地修改。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionRecord {
    pub section_type: SectionType,
    pub index: SectionIndex,
    pub title: String,
    pub content: String,
    pub word_count: usize,
    #[serde(default)]
    pub research_sources: Vec<Source>,
    pub citations_included: usize,
    pub tokens_used: u32,
    pub quality_metrics: QualityMetrics,
    pub generated_at: DateTime<Utc>,
}

/// 统计 markdown 文本的单词数（忽略标题符号）
pub fn count_words(content: &str) -> usize {
    content
        .split_whitespace()
        .filter(|w| !w.chars().all(|c| matches!(c, '#' | '-' | '*' | '>' | '|')))
        .count()
}

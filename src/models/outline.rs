//! 文章大纲与章节索引
//!
//! 大纲由外部生成器创建，之后只读。章节索引决定排序和断点续跑的主键。

use std::cmp::Ordering;
use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::OutlineError;

/// 章节类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionType {
    Introduction,
    H2,
    H3,
    Conclusion,
    Faq,
}

impl SectionType {
    /// 任务优先级，数值越小越先调度
    pub fn priority(self) -> u8 {
        match self {
            SectionType::Introduction => 0,
            SectionType::H2 => 1,
            SectionType::H3 => 2,
            SectionType::Conclusion => 3,
            SectionType::Faq => 4,
        }
    }

    /// 未指定总字数时的默认目标字数
    pub fn default_target_words(self) -> u32 {
        match self {
            SectionType::Introduction => 180,
            SectionType::H2 => 350,
            SectionType::H3 => 220,
            SectionType::Conclusion => 200,
            SectionType::Faq => 300,
        }
    }

    /// 正文章节需要引用来源
    pub fn expects_citations(self) -> bool {
        match self {
            SectionType::H2 | SectionType::H3 => true,
            SectionType::Introduction | SectionType::Conclusion | SectionType::Faq => false,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SectionType::Introduction => "引言",
            SectionType::H2 => "H2",
            SectionType::H3 => "H3",
            SectionType::Conclusion => "结论",
            SectionType::Faq => "FAQ",
        }
    }
}

/// 章节索引
///
/// 引言/H2/结论/FAQ 使用整数，H3 使用 `h2.h3` 形式。
/// 派生的排序与大纲位置一致：`2 < 2.1 < 2.2 < 3`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SectionIndex {
    major: u32,
    minor: Option<u32>,
}

impl SectionIndex {
    pub const INTRODUCTION: SectionIndex = SectionIndex { major: 0, minor: None };

    pub fn top(major: u32) -> Self {
        Self { major, minor: None }
    }

    pub fn child(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor: Some(minor),
        }
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> Option<u32> {
        self.minor
    }

    /// H3 的父级 H2 索引
    pub fn parent(&self) -> Option<SectionIndex> {
        self.minor.map(|_| SectionIndex::top(self.major))
    }
}

impl Ord for SectionIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then_with(|| self.minor.cmp(&other.minor))
    }
}

impl PartialOrd for SectionIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for SectionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.minor {
            Some(minor) => write!(f, "{}.{}", self.major, minor),
            None => write!(f, "{}", self.major),
        }
    }
}

impl FromStr for SectionIndex {
    type Err = OutlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || OutlineError::InvalidIndex {
            value: s.to_string(),
        };
        let trimmed = s.trim();
        match trimmed.split_once('.') {
            Some((major, minor)) => Ok(SectionIndex::child(
                major.parse().map_err(|_| invalid())?,
                minor.parse().map_err(|_| invalid())?,
            )),
            None => Ok(SectionIndex::top(trimmed.parse().map_err(|_| invalid())?)),
        }
    }
}

impl TryFrom<String> for SectionIndex {
    type Error = OutlineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SectionIndex> for String {
    fn from(index: SectionIndex) -> Self {
        index.to_string()
    }
}

/// H2 节点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct H2Node {
    pub title: String,
    /// 子 H3 标题（按顺序）
    #[serde(default)]
    pub subsections: Vec<String>,
}

/// 文章大纲
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outline {
    pub introduction: String,
    pub sections: Vec<H2Node>,
    pub conclusion: String,
    #[serde(default)]
    pub faq: Option<String>,
}

/// 大纲中的一个节点（已分配索引）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlineNode {
    pub index: SectionIndex,
    pub section_type: SectionType,
    pub title: String,
    /// H3 的父级 H2 标题
    pub parent_title: Option<String>,
}

impl Outline {
    /// 校验大纲不变量：至少一个 H2，所有标题非空
    pub fn validate(&self) -> Result<(), OutlineError> {
        if self.sections.is_empty() {
            return Err(OutlineError::NoSections);
        }
        let empty = |s: &str| s.trim().is_empty();
        if empty(&self.introduction) {
            return Err(OutlineError::EmptyTitle {
                position: "introduction".to_string(),
            });
        }
        if empty(&self.conclusion) {
            return Err(OutlineError::EmptyTitle {
                position: "conclusion".to_string(),
            });
        }
        if self.faq.as_deref().is_some_and(empty) {
            return Err(OutlineError::EmptyTitle {
                position: "faq".to_string(),
            });
        }
        for (i, h2) in self.sections.iter().enumerate() {
            if empty(&h2.title) {
                return Err(OutlineError::EmptyTitle {
                    position: format!("h2 #{}", i + 1),
                });
            }
            if let Some(j) = h2.subsections.iter().position(|t| empty(t)) {
                return Err(OutlineError::EmptyTitle {
                    position: format!("h3 #{}.{}", i + 1, j + 1),
                });
            }
        }
        Ok(())
    }

    pub fn conclusion_index(&self) -> SectionIndex {
        SectionIndex::top(self.sections.len() as u32 + 1)
    }

    pub fn faq_index(&self) -> Option<SectionIndex> {
        self.faq
            .as_ref()
            .map(|_| SectionIndex::top(self.sections.len() as u32 + 2))
    }

    /// 按规范顺序列出全部节点
    pub fn nodes(&self) -> Vec<OutlineNode> {
        let mut nodes = vec![OutlineNode {
            index: SectionIndex::INTRODUCTION,
            section_type: SectionType::Introduction,
            title: self.introduction.clone(),
            parent_title: None,
        }];
        for (i, h2) in self.sections.iter().enumerate() {
            let major = i as u32 + 1;
            nodes.push(OutlineNode {
                index: SectionIndex::top(major),
                section_type: SectionType::H2,
                title: h2.title.clone(),
                parent_title: None,
            });
            for (j, h3) in h2.subsections.iter().enumerate() {
                nodes.push(OutlineNode {
                    index: SectionIndex::child(major, j as u32 + 1),
                    section_type: SectionType::H3,
                    title: h3.clone(),
                    parent_title: Some(h2.title.clone()),
                });
            }
        }
        nodes.push(OutlineNode {
            index: self.conclusion_index(),
            section_type: SectionType::Conclusion,
            title: self.conclusion.clone(),
            parent_title: None,
        });
        if let (Some(faq), Some(index)) = (&self.faq, self.faq_index()) {
            nodes.push(OutlineNode {
                index,
                section_type: SectionType::Faq,
                title: faq.clone(),
                parent_title: None,
            });
        }
        nodes
    }

    /// 按索引查找节点
    pub fn node(&self, index: SectionIndex) -> Option<OutlineNode> {
        self.nodes().into_iter().find(|n| n.index == index)
    }

    /// 用于综合搜索的标题（H2 顺序）
    pub fn h2_titles(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|h| h.title.as_str())
    }

    /// 为节点分配目标字数
    ///
    /// 指定文章总字数时，扣除引言/结论/FAQ 后按 H2:H3 = 1:0.6 的权重分给正文。
    pub fn target_words_for(&self, node: &OutlineNode, article_words: Option<u32>) -> u32 {
        let Some(total) = article_words else {
            return node.section_type.default_target_words();
        };
        match node.section_type {
            SectionType::Introduction | SectionType::Conclusion | SectionType::Faq => {
                node.section_type.default_target_words()
            }
            SectionType::H2 | SectionType::H3 => {
                let reserved = SectionType::Introduction.default_target_words()
                    + SectionType::Conclusion.default_target_words()
                    + self.faq.as_ref().map_or(0, |_| SectionType::Faq.default_target_words());
                let body = total.saturating_sub(reserved).max(200) as f64;
                let h3_count: usize = self.sections.iter().map(|h| h.subsections.len()).sum();
                let weight_total = self.sections.len() as f64 + h3_count as f64 * 0.6;
                let unit = body / weight_total;
                let words = if node.section_type == SectionType::H2 {
                    unit
                } else {
                    unit * 0.6
                };
                (words.round() as u32).max(100)
            }
        }
    }
}

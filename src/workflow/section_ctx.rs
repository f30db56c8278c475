//! 章节处理上下文
//!
//! 封装"我正在生成哪篇文章的哪个章节"这一信息

use std::fmt::Display;

use crate::models::{OutlineNode, SectionIndex, SectionType};

/// 章节处理上下文
#[derive(Debug, Clone)]
pub struct SectionCtx {
    /// 文章ID
    pub article_id: String,

    /// 文章关键词
    pub keyword: String,

    /// 大纲节点（索引、类型、标题）
    pub node: OutlineNode,

    /// 目标字数
    pub target_words: u32,
}

impl SectionCtx {
    pub fn new(article_id: impl Into<String>, keyword: impl Into<String>, node: OutlineNode, target_words: u32) -> Self {
        Self {
            article_id: article_id.into(),
            keyword: keyword.into(),
            node,
            target_words,
        }
    }

    pub fn index(&self) -> SectionIndex {
        self.node.index
    }

    pub fn section_type(&self) -> SectionType {
        self.node.section_type
    }

    /// 调度优先级
    pub fn priority(&self) -> u8 {
        self.node.section_type.priority()
    }
}

impl Display for SectionCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[文章 {} 章节 {} {}]",
            self.article_id,
            self.node.index,
            self.node.section_type.label()
        )
    }
}

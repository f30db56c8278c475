use serde::{Deserialize, Serialize};

use crate::models::section::SectionRecord;

/// 文章生成偏好
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArticlePreferences {
    /// 全文目标字数
    #[serde(default)]
    pub target_word_count: Option<u32>,
    #[serde(default)]
    pub tone: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
}

/// 文章持久化状态（恢复流水线所需的最小结构）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleState {
    pub article_id: String,
    pub keyword: String,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub preferences: ArticlePreferences,
    #[serde(default)]
    pub sections: Vec<SectionRecord>,
}

impl ArticleState {
    pub fn new(article_id: impl Into<String>, keyword: impl Into<String>) -> Self {
        Self {
            article_id: article_id.into(),
            keyword: keyword.into(),
            org_id: None,
            preferences: ArticlePreferences::default(),
            sections: Vec::new(),
        }
    }

    /// 按索引合并章节：同索引整体替换，结果按索引排序
    pub fn merge_sections(&mut self, incoming: &[SectionRecord]) {
        for record in incoming {
            match self.sections.iter_mut().find(|s| s.index == record.index) {
                Some(existing) => *existing = record.clone(),
                None => self.sections.push(record.clone()),
            }
        }
        self.sections.sort_by_key(|s| s.index);
    }
}

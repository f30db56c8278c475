//! 文章存储 - JSON 文件实现
//!
//! 每篇文章一个 JSON 文件，写入时先写临时文件再原子重命名

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::clients::ArticleStore;
use crate::error::StoreError;
use crate::models::{ArticleState, SectionIndex, SectionRecord};

/// JSON 文件存储
///
/// 职责：
/// - 读取 / 创建文章状态
/// - 按索引合并写入章节
/// - 写操作串行化，避免并发覆盖
pub struct JsonFileStore {
    folder: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn article_path(&self, article_id: &str) -> PathBuf {
        self.folder.join(format!("{}.json", encode_file_stem(article_id)))
    }

    /// 文章不存在时写入初始状态；已存在则保留已有章节
    pub async fn ensure_article(&self, initial: &ArticleState) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.article_path(&initial.article_id);
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        self.write_state(initial).await
    }

    async fn read_state(&self, article_id: &str) -> Result<ArticleState, StoreError> {
        let path = self.article_path(article_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    article_id: article_id.to_string(),
                })
            }
            Err(source) => {
                return Err(StoreError::ReadFailed {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        Ok(serde_json::from_str(&content)?)
    }

    async fn write_state(&self, state: &ArticleState) -> Result<()> {
        let path = self.article_path(&state.article_id);
        let write_failed = |source| StoreError::WriteFailed {
            path: path.display().to_string(),
            source,
        };

        fs::create_dir_all(&self.folder).await.map_err(write_failed)?;
        let json = serde_json::to_string_pretty(state).map_err(StoreError::from)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await.map_err(write_failed)?;
        fs::rename(&tmp, &path).await.map_err(write_failed)?;
        Ok(())
    }
}

#[async_trait]
impl ArticleStore for JsonFileStore {
    async fn load_article(&self, article_id: &str) -> Result<ArticleState> {
        Ok(self.read_state(article_id).await?)
    }

    async fn save_sections(&self, article_id: &str, sections: &[SectionRecord], last_index: SectionIndex) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut state = self.read_state(article_id).await?;
        state.merge_sections(sections);
        self.write_state(&state).await?;
        debug!(
            "[文章 {}] 已保存 {} 个章节 (最后索引 {})",
            article_id,
            sections.len(),
            last_index
        );
        Ok(())
    }
}

/// 文章 id 到文件名的单射编码：字母、数字与 `-` 原样保留，其余字节（包括 `_`）写成 `_XX`
fn encode_file_stem(article_id: &str) -> String {
    let mut out = String::with_capacity(article_id.len());
    for byte in article_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("_{:02X}", byte));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QualityMetrics, SectionType};
    use chrono::Utc;

    fn record(index: SectionIndex, content: &str) -> SectionRecord {
        SectionRecord {
            section_type: SectionType::H2,
            index,
            title: format!("Section {}", index),
            content: content.to_string(),
            word_count: content.split_whitespace().count(),
            research_sources: vec![],
            citations_included: 0,
            tokens_used: 10,
            quality_metrics: QualityMetrics::default(),
            generated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_merges_by_index() {
        let dir = std::env::temp_dir().join(format!("store-test-{}", uuid::Uuid::new_v4()));
        let store = JsonFileStore::new(&dir);
        store.ensure_article(&ArticleState::new("a/1", "kw")).await.unwrap();

        store
            .save_sections("a/1", &[record(SectionIndex::top(2), "two"), record(SectionIndex::top(1), "one")], SectionIndex::top(2))
            .await
            .unwrap();
        store
            .save_sections("a/1", &[record(SectionIndex::top(2), "two again")], SectionIndex::top(2))
            .await
            .unwrap();

        let state = store.load_article("a/1").await.unwrap();
        assert_eq!(state.sections.len(), 2);
        assert_eq!(state.sections[0].index, SectionIndex::top(1));
        assert_eq!(state.sections[1].content, "two again");

        // 再次 ensure 不会覆盖已有章节
        store.ensure_article(&ArticleState::new("a/1", "kw")).await.unwrap();
        assert_eq!(store.load_article("a/1").await.unwrap().sections.len(), 2);

        fs::remove_dir_all(&dir).await.unwrap();
    }

    #[test]
    fn test_file_names_do_not_collide() {
        assert_eq!(encode_file_stem("post-1"), "post-1");
        assert_eq!(encode_file_stem("a/b"), "a_2Fb");
        assert_eq!(encode_file_stem("a_b"), "a_5Fb");
        assert_ne!(encode_file_stem("a/b"), encode_file_stem("a_b"));
        assert_ne!(encode_file_stem("a_2Fb"), encode_file_stem("a/b"));
    }

    #[tokio::test]
    async fn test_similar_ids_are_separate_articles() {
        let dir = std::env::temp_dir().join(format!("store-test-{}", uuid::Uuid::new_v4()));
        let store = JsonFileStore::new(&dir);
        store.ensure_article(&ArticleState::new("a/b", "kw")).await.unwrap();
        store.ensure_article(&ArticleState::new("a_b", "kw")).await.unwrap();

        store
            .save_sections("a/b", &[record(SectionIndex::top(1), "one")], SectionIndex::top(1))
            .await
            .unwrap();

        assert_eq!(store.load_article("a/b").await.unwrap().sections.len(), 1);
        let other = store.load_article("a_b").await.unwrap();
        assert_eq!(other.article_id, "a_b");
        assert!(other.sections.is_empty());

        fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_missing_article() {
        let store = JsonFileStore::new(std::env::temp_dir().join("store-missing"));
        let err = store.load_article("nope").await.unwrap_err();
        assert!(err.downcast_ref::<StoreError>().is_some());
    }
}

use crate::models::article::{ArticlePreferences, ArticleState};
use crate::models::outline::Outline;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::fs;

/// 一篇待生成文章的任务描述（来自 TOML 文件）
#[derive(Debug, Clone, Deserialize)]
pub struct ArticleJob {
    pub article_id: String,
    pub keyword: String,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub preferences: ArticlePreferences,
    pub outline: Outline,
    /// 来源文件路径
    #[serde(skip)]
    pub file_path: Option<String>,
}

impl ArticleJob {
    /// 转换为初始文章状态（无章节）
    pub fn initial_state(&self) -> ArticleState {
        ArticleState {
            article_id: self.article_id.clone(),
            keyword: self.keyword.clone(),
            org_id: self.org_id.clone(),
            preferences: self.preferences.clone(),
            sections: Vec::new(),
        }
    }
}

/// 从 TOML 文件加载文章任务
pub async fn load_job(toml_file_path: &Path) -> Result<ArticleJob> {
    let content = fs::read_to_string(toml_file_path)
        .await
        .with_context(|| format!("无法读取TOML文件: {}", toml_file_path.display()))?;

    let mut job: ArticleJob = toml::from_str(&content)
        .with_context(|| format!("无法解析TOML文件: {}", toml_file_path.display()))?;

    job.outline
        .validate()
        .with_context(|| format!("大纲不合法: {}", toml_file_path.display()))?;

    job.file_path = Some(toml_file_path.to_string_lossy().to_string());

    Ok(job)
}

/// 从文件夹中加载所有 TOML 任务，按文件名排序
pub async fn load_all_jobs(folder_path: &str) -> Result<Vec<ArticleJob>> {
    let folder = PathBuf::from(folder_path);

    if !folder.exists() {
        anyhow::bail!("文件夹不存在: {}", folder_path);
    }

    let mut paths = Vec::new();
    let mut entries = fs::read_dir(&folder)
        .await
        .with_context(|| format!("无法读取文件夹: {}", folder_path))?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut jobs = Vec::new();
    for path in paths {
        tracing::info!(
            "正在加载: {}",
            path.file_name().unwrap_or_default().to_string_lossy()
        );

        match load_job(&path).await {
            Ok(job) => {
                tracing::info!(
                    "成功加载文章 {} ({} 个节点)",
                    job.article_id,
                    job.outline.nodes().len()
                );
                jobs.push(job);
            }
            Err(e) => {
                tracing::warn!("加载文件失败 {}: {:#}", path.display(), e);
            }
        }
    }

    Ok(jobs)
}

use serde::{Deserialize, Serialize};

/// 研究来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub excerpt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

impl Source {
    /// 用于去重的 URL 键（忽略大小写、末尾斜杠与片段）
    pub fn dedup_key(&self) -> String {
        let url = self.url.trim();
        let url = url.split('#').next().unwrap_or(url);
        url.trim_end_matches('/').to_ascii_lowercase()
    }

    /// 提取域名（不含 `www.` 前缀）
    pub fn domain(&self) -> Option<String> {
        let rest = self.url.split_once("://").map_or(self.url.as_str(), |(_, r)| r);
        let host = rest.split(['/', '?', '#']).next()?;
        let host = host.split(':').next()?.to_ascii_lowercase();
        if host.is_empty() {
            return None;
        }
        Some(host.trim_start_matches("www.").to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(url: &str) -> Source {
        Source {
            title: "t".into(),
            url: url.into(),
            excerpt: String::new(),
            published_date: None,
            author: None,
        }
    }

    #[test]
    fn test_dedup_key() {
        assert_eq!(
            source("https://Example.com/a/").dedup_key(),
            source("https://example.com/a#top").dedup_key()
        );
    }

    #[test]
    fn test_domain() {
        assert_eq!(source("https://www.nih.gov/health?x=1").domain().as_deref(), Some("nih.gov"));
        assert_eq!(source("http://localhost:8080/a").domain().as_deref(), Some("localhost"));
        assert_eq!(source("").domain(), None);
    }
}

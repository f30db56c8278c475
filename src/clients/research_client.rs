/// 网络研究 API 客户端
///
/// 封装搜索接口的 HTTP 调用与结果解析
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::clients::ResearchProvider;
use crate::config::Config;
use crate::error::{AppError, ResearchError};
use crate::models::Source;

const SEARCH_ENDPOINT: &str = "/search";
const RESULT_LIMIT: usize = 20;

/// 研究 API 客户端
pub struct HttpResearchClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default, alias = "snippet", alias = "content")]
    excerpt: String,
    #[serde(default, alias = "published_date", alias = "publishedDate", alias = "date")]
    published: Option<String>,
    #[serde(default)]
    author: Option<String>,
}

impl From<SearchHit> for Source {
    fn from(hit: SearchHit) -> Self {
        Source {
            title: hit.title,
            url: hit.url,
            excerpt: hit.excerpt,
            published_date: hit.published,
            author: hit.author,
        }
    }
}

impl HttpResearchClient {
    /// 创建新的研究 API 客户端
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: config.research_api_base_url.trim_end_matches('/').to_string(),
            api_key: config.research_api_key.clone(),
        })
    }
}

#[async_trait]
impl ResearchProvider for HttpResearchClient {
    async fn search(&self, query: &str) -> Result<Vec<Source>> {
        let endpoint = format!("{}{}", self.base_url, SEARCH_ENDPOINT);
        debug!("研究搜索: {}", query);

        let limit = RESULT_LIMIT.to_string();
        let mut request = self
            .http
            .get(&endpoint)
            .query(&[("q", query), ("limit", limit.as_str())]);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::research_request_failed(&endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            warn!("研究API返回错误状态: HTTP {}", status.as_u16());
            return Err(AppError::Research(ResearchError::BadStatus {
                endpoint,
                status: status.as_u16(),
            })
            .into());
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| AppError::Research(ResearchError::JsonParseFailed(e)))?;

        let sources: Vec<Source> = body
            .results
            .into_iter()
            .filter(|hit| !hit.url.trim().is_empty())
            .map(Source::from)
            .collect();

        debug!("研究搜索返回 {} 个来源", sources.len());
        Ok(sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_hits_with_aliases() {
        let json = r#"{"results":[
            {"title":"A","url":"https://a.org","snippet":"alpha","publishedDate":"2026-01-02"},
            {"title":"B","url":"https://b.com","content":"beta","author":"Kim"}
        ]}"#;
        let body: SearchResponse = serde_json::from_str(json).unwrap();
        let sources: Vec<Source> = body.results.into_iter().map(Source::from).collect();
        assert_eq!(sources[0].excerpt, "alpha");
        assert_eq!(sources[0].published_date.as_deref(), Some("2026-01-02"));
        assert_eq!(sources[1].author.as_deref(), Some("Kim"));
    }

    #[test]
    fn test_missing_results_field() {
        let body: SearchResponse = serde_json::from_str("{}").unwrap();
        assert!(body.results.is_empty());
    }
}

//! Tavily API 搜索提供方
//!
//! POST /search；429/5xx 按指数退避重试，429 优先尊重 Retry-After。

use std::time::Duration;

use serde_json::json;

use crate::config::SearchSection;
use crate::search::{SearchError, SearchHit, SearchProvider};

/// Tavily 提供方：持有 reqwest Client、API Key 与重试参数
pub struct TavilyProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    search_depth: String,
    max_retries: u32,
    retry_backoff_ms: u64,
    retry_max_backoff_ms: u64,
}

impl TavilyProvider {
    pub fn new(section: &SearchSection, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(section.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key,
            base_url: section.tavily_base_url.trim_end_matches('/').to_string(),
            search_depth: section.search_depth.clone(),
            max_retries: section.max_retries,
            retry_backoff_ms: section.retry_backoff_ms,
            retry_max_backoff_ms: section.retry_max_backoff_ms,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let ms = self
            .retry_backoff_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.retry_max_backoff_ms);
        Duration::from_millis(ms)
    }

    fn parse_hits(data: &serde_json::Value) -> Result<Vec<SearchHit>, SearchError> {
        let raw = data
            .get("results")
            .and_then(|v| v.as_array())
            .ok_or_else(|| SearchError::BadPayload("missing results list".to_string()))?;

        let mut hits = Vec::new();
        for (i, item) in raw.iter().enumerate() {
            let Some(url) = item.get("url").and_then(|v| v.as_str()) else {
                continue;
            };
            hits.push(SearchHit {
                title: item.get("title").and_then(|v| v.as_str()).map(String::from),
                snippet: item
                    .get("content")
                    .or_else(|| item.get("snippet"))
                    .and_then(|v| v.as_str())
                    .map(String::from),
                url: url.to_string(),
                rank: i + 1,
            });
        }
        Ok(hits)
    }
}

#[async_trait::async_trait]
impl SearchProvider for TavilyProvider {
    fn name(&self) -> &str {
        "tavily"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, SearchError> {
        let url = format!("{}/search", self.base_url);
        let payload = json!({
            "api_key": self.api_key,
            "query": query,
            "max_results": max_results,
            "search_depth": self.search_depth,
            "include_answer": false,
            "include_raw_content": false,
            "include_images": false,
        });

        let mut last_err = SearchError::Transport("no attempt made".to_string());
        for attempt in 0..=self.max_retries {
            let resp = match self.client.post(&url).json(&payload).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_err = SearchError::Transport(e.to_string());
                    if attempt < self.max_retries {
                        tokio::time::sleep(self.backoff(attempt)).await;
                        continue;
                    }
                    break;
                }
            };

            let status = resp.status();
            if status.as_u16() == 429 || status.is_server_error() {
                // 限流优先用服务端给出的 Retry-After
                let retry_after = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(Duration::from_secs);
                last_err = SearchError::Http { status: status.as_u16() };
                if attempt < self.max_retries {
                    let wait = retry_after.unwrap_or_else(|| self.backoff(attempt));
                    tracing::warn!(
                        status = status.as_u16(),
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "Tavily transient status, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    continue;
                }
                break;
            }
            if !status.is_success() {
                return Err(SearchError::Http { status: status.as_u16() });
            }

            let data: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| SearchError::BadPayload(e.to_string()))?;
            let hits = Self::parse_hits(&data)?;
            tracing::info!(query_len = query.len(), results = hits.len(), "Tavily search ok");
            return Ok(hits);
        }

        tracing::error!(query_len = query.len(), error = %last_err, "Tavily search failed");
        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hits_skips_urlless_items() {
        let data = json!({
            "results": [
                {"title": "A", "content": "s1", "url": "https://a.example"},
                {"title": "no url"},
                {"title": "B", "snippet": "s2", "url": "https://b.example"},
            ]
        });
        let hits = TavilyProvider::parse_hits(&data).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].rank, 1);
        assert_eq!(hits[1].url, "https://b.example");
        assert_eq!(hits[1].snippet.as_deref(), Some("s2"));
    }

    #[test]
    fn test_parse_hits_rejects_missing_results() {
        let data = json!({"answer": "nope"});
        assert!(matches!(
            TavilyProvider::parse_hits(&data),
            Err(SearchError::BadPayload(_))
        ));
    }
}

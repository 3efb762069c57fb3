//! Web 搜索提供方：Tavily API 与 DuckDuckGo HTML 兜底
//!
//! 提供方只返回 (title, snippet, url)；正文抓取交给 fetch 模块。

pub mod duckduckgo;
pub mod tavily;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::SearchSection;

pub use duckduckgo::DuckDuckGoProvider;
pub use tavily::TavilyProvider;

/// 单条搜索结果
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub title: Option<String>,
    pub snippet: Option<String>,
    pub url: String,
    /// 1 起始的原始排名，URL 过滤时用于回指
    pub rank: usize,
}

/// 搜索调用错误
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("search HTTP status {status}")]
    Http { status: u16 },

    #[error("search transport error: {0}")]
    Transport(String),

    #[error("search response malformed: {0}")]
    BadPayload(String),

    #[error("missing {0} while search provider requires it")]
    MissingApiKey(&'static str),
}

/// 搜索提供方 trait
#[async_trait]
pub trait SearchProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, SearchError>;
}

/// 根据配置与环境变量选择搜索提供方
///
/// tavily 需要 SEARCH_API_KEY；其它取值一律回落到 duckduckgo。
pub fn create_search_provider(section: &SearchSection) -> Result<Arc<dyn SearchProvider>, SearchError> {
    match section.provider.to_lowercase().as_str() {
        "tavily" => {
            let api_key = std::env::var("SEARCH_API_KEY")
                .ok()
                .filter(|s| !s.is_empty())
                .ok_or(SearchError::MissingApiKey("SEARCH_API_KEY"))?;
            tracing::info!("Using Tavily search provider");
            Ok(Arc::new(TavilyProvider::new(section, api_key)))
        }
        other => {
            if other != "duckduckgo" {
                tracing::warn!(provider = %other, "Unknown search provider, falling back to DuckDuckGo");
            } else {
                tracing::info!("Using DuckDuckGo search provider");
            }
            Ok(Arc::new(DuckDuckGoProvider::new(section)))
        }
    }
}

//! DuckDuckGo HTML 搜索提供方（无需 API Key 的兜底）
//!
//! 抓取 html.duckduckgo.com 的精简结果页，用正则提取链接与摘要；
//! 结果质量不如 Tavily，但适合本地开发与无密钥环境。

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::config::SearchSection;
use crate::search::{SearchError, SearchHit, SearchProvider};

pub struct DuckDuckGoProvider {
    client: reqwest::Client,
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<a[^>]+class="result__a"[^>]+href="(?P<url>[^"]+)"[^>]*>(?P<title>.*?)</a>"#)
            .expect("ddg link regex")
    })
}

fn snippet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<a[^>]+class="result__snippet"[^>]*>(?P<snippet>.*?)</a>"#)
            .expect("ddg snippet regex")
    })
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("tag regex"))
}

/// 去除内嵌标签并还原少量常见实体
fn clean_fragment(s: &str) -> String {
    let s = tag_re().replace_all(s, "");
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .trim()
        .to_string()
}

/// DDG 重定向链接形如 //duckduckgo.com/l/?uddg=<encoded>&rut=...
fn decode_redirect(url: &str) -> String {
    if let Some(pos) = url.find("uddg=") {
        let tail = &url[pos + 5..];
        let encoded = tail.split('&').next().unwrap_or(tail);
        if let Some(decoded) = percent_decode(encoded) {
            return decoded;
        }
    }
    url.to_string()
}

fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hi = (bytes[i + 1] as char).to_digit(16)?;
                let lo = (bytes[i + 2] as char).to_digit(16)?;
                out.push((hi * 16 + lo) as u8);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

impl DuckDuckGoProvider {
    pub fn new(section: &SearchSection) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(section.timeout_secs))
            .user_agent("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36")
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// 链接与摘要分两个正则匹配；摘要只在本条与下一条链接之间的窗口内找
    fn parse_page(html: &str, max_results: usize) -> Vec<SearchHit> {
        let anchors: Vec<(usize, usize, String, String)> = link_re()
            .captures_iter(html)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let url = decode_redirect(caps.name("url")?.as_str());
                let title = clean_fragment(caps.name("title")?.as_str());
                Some((whole.start(), whole.end(), url, title))
            })
            .collect();

        let mut hits = Vec::new();
        for (i, (_, end, url, title)) in anchors.iter().enumerate() {
            if hits.len() >= max_results {
                break;
            }
            if !url.starts_with("http") {
                continue;
            }
            let window_end = anchors.get(i + 1).map(|(s, _, _, _)| *s).unwrap_or(html.len());
            let window = &html[*end..window_end.max(*end)];
            let snippet = snippet_re()
                .captures(window)
                .and_then(|c| c.name("snippet").map(|m| clean_fragment(m.as_str())));
            hits.push(SearchHit {
                title: Some(title.clone()).filter(|t| !t.is_empty()),
                snippet: snippet.filter(|s| !s.is_empty()),
                url: url.clone(),
                rank: hits.len() + 1,
            });
        }
        hits
    }
}

#[async_trait::async_trait]
impl SearchProvider for DuckDuckGoProvider {
    fn name(&self) -> &str {
        "duckduckgo"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, SearchError> {
        let resp = self
            .client
            .get("https://html.duckduckgo.com/html/")
            .query(&[("q", query)])
            .send()
            .await
            .map_err(|e| SearchError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SearchError::Http { status: status.as_u16() });
        }
        let html = resp
            .text()
            .await
            .map_err(|e| SearchError::Transport(e.to_string()))?;

        let hits = Self::parse_page(&html, max_results);
        tracing::info!(query_len = query.len(), results = hits.len(), "DuckDuckGo search ok");
        Ok(hits)
    }
}

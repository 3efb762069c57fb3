//! 网页抓取与正文提取
//!
//! GET 请求带超时与 User-Agent；拒绝非文本 MIME 与过短正文；
//! 对 HTML 响应使用 html2text 提取可读文本，失败时退回手写的标签剥离。
//! 正文超过 max_page_chars 时截断并追加 [TRUNCATED] 标记。

use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use reqwest::Client;
use thiserror::Error;

use crate::config::FetchSection;

/// 抓取并解析后的页面
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub title: Option<String>,
    pub text: String,
    pub mime: Option<String>,
}

/// 抓取失败原因；全部可恢复（跳过该 URL 继续）
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("fetch HTTP status {status}")]
    Http { status: u16 },

    #[error("fetch transport error: {0}")]
    Transport(String),

    #[error("unsupported content type: {0}")]
    UnsupportedMime(String),

    #[error("body too short ({chars} chars)")]
    TooShort { chars: usize },
}

/// 简易去除 HTML 标签（html2text 失败时的回退）
fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    let mut prev_whitespace = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => {
                let is_whitespace = c.is_whitespace();
                if is_whitespace && prev_whitespace {
                    continue;
                }
                prev_whitespace = is_whitespace;
                out.push(if is_whitespace { ' ' } else { c });
            }
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ").trim().to_string()
}

/// 判断内容是否像 HTML（需提取可读文本）
fn looks_like_html(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("<!")
        || s.starts_with("<html")
        || s.starts_with("<HTML")
        || (s.len() > 20
            && s.contains('<')
            && (s.contains("</") || s.contains("<meta") || s.contains("<head") || s.contains("<title")))
}

/// 提取 <title> 内容
fn extract_title(html: &str) -> Option<String> {
    let lower = html.to_lowercase();
    let start = lower.find("<title")?;
    let open_end = html[start..].find('>')? + start + 1;
    let close = lower[open_end..].find("</title>")? + open_end;
    let title = html[open_end..close].trim();
    if title.is_empty() {
        None
    } else {
        Some(strip_html_tags(title))
    }
}

/// 页面来源抽象：生产实现是 PageFetcher，测试可注入固定页面
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

/// 页面抓取器：共享 HTTP 客户端与正文门限
pub struct PageFetcher {
    client: Client,
    max_retries: u32,
    min_body_chars: usize,
    max_page_chars: usize,
}

impl PageFetcher {
    pub fn new(section: &FetchSection) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(section.timeout_secs))
            .user_agent(section.user_agent.clone())
            .build()
            .unwrap_or_default();
        Self {
            client,
            max_retries: section.max_retries,
            min_body_chars: section.min_body_chars,
            max_page_chars: section.max_page_chars,
        }
    }

    /// 将 HTML 转为可读文本（去除 script/style 等）
    fn html_to_text(&self, html: &str) -> String {
        let text = from_read(html.as_bytes(), 120);
        if !text.trim().is_empty() {
            text
        } else {
            strip_html_tags(html)
        }
    }

    /// 空行压缩 + 行首尾修剪
    fn normalize_text(text: &str) -> String {
        text.lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn truncate(&self, text: String) -> String {
        if text.chars().count() <= self.max_page_chars {
            return text;
        }
        let head: String = text.chars().take(self.max_page_chars).collect();
        head + "\n\n[TRUNCATED]"
    }

    /// 瞬时失败（超时 / 5xx）按指数退避重试；其余错误立即放弃
    async fn send_with_retry(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let mut last_err = FetchError::Transport("no attempt made".to_string());
        for attempt in 0..=self.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_server_error() && attempt < self.max_retries {
                        last_err = FetchError::Http { status: status.as_u16() };
                    } else if !status.is_success() {
                        return Err(FetchError::Http { status: status.as_u16() });
                    } else {
                        return Ok(resp);
                    }
                }
                Err(e) if e.is_timeout() && attempt < self.max_retries => {
                    last_err = FetchError::Transport(e.to_string());
                }
                Err(e) => return Err(FetchError::Transport(e.to_string())),
            }
            let wait = Duration::from_millis(500u64.saturating_mul(1u64 << attempt.min(8)));
            tracing::debug!(url, attempt, wait_ms = wait.as_millis() as u64, "fetch retry");
            tokio::time::sleep(wait).await;
        }
        Err(last_err)
    }

    async fn fetch_impl(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let resp = self.send_with_retry(url).await?;

        let mime = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(';').next().unwrap_or(s).trim().to_lowercase());
        if let Some(ref m) = mime {
            let textual = m.starts_with("text/")
                || m == "application/xhtml+xml"
                || m == "application/xml"
                || m == "application/json";
            if !textual {
                return Err(FetchError::UnsupportedMime(m.clone()));
            }
        }

        let final_url = resp.url().to_string();
        let mut body = resp
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        // 去除 BOM，避免 HTML 检测失败
        if body.starts_with('\u{FEFF}') {
            body = body[3..].to_string();
        }

        let (title, text) = if looks_like_html(&body) {
            (extract_title(&body), self.html_to_text(&body))
        } else {
            (None, body)
        };
        let text = Self::normalize_text(&text);

        let chars = text.chars().count();
        if chars < self.min_body_chars {
            return Err(FetchError::TooShort { chars });
        }

        tracing::debug!(url = %final_url, chars, "page fetched");
        Ok(FetchedPage {
            url: final_url,
            title,
            text: self.truncate(text),
            mime,
        })
    }
}

#[async_trait]
impl PageSource for PageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.fetch_impl(url).await
    }
}

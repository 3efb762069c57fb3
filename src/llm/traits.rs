//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Scripted）实现 LlmClient：complete 单轮补全。
//! RetryingLlmClient 只对瞬时错误（超时 / 限流 / 5xx）做指数退避重试。

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use thiserror::Error;

use crate::config::LlmSection;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// 单条消息
#[derive(Clone, Debug)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// LLM 调用错误；is_transient 决定是否进入退避重试
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("LLM request timed out")]
    Timeout,

    #[error("LLM rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("LLM HTTP status {status}")]
    Http { status: u16 },

    #[error("LLM transport error: {0}")]
    Transport(String),

    #[error("LLM returned empty response")]
    EmptyResponse,
}

impl LlmError {
    /// 超时 / 限流 / 5xx 视为瞬时错误
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Timeout | LlmError::RateLimited { .. } => true,
            LlmError::Http { status } => *status >= 500,
            LlmError::Transport(_) => true,
            LlmError::EmptyResponse => false,
        }
    }
}

/// LLM 客户端 trait：单轮补全 + 可选流式
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 流式完成，返回 Token 流；流式是客户端内部优化，智能体循环不感知，
    /// 默认实现退化为一次性返回完整补全
    async fn complete_stream(
        &self,
        messages: &[Message],
    ) -> Result<Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>, LlmError> {
        let content = self.complete(messages).await?;
        Ok(Box::pin(stream::iter(vec![Ok(content)])))
    }

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 重试参数：指数退避，封顶 max_backoff
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    pub fn from_section(section: &LlmSection) -> Self {
        Self {
            max_retries: section.max_retries,
            base_backoff_ms: section.retry_backoff_ms,
            max_backoff_ms: section.retry_max_backoff_ms,
        }
    }

    /// 第 attempt 次失败后的退避时长；RateLimited 自带 retry_after 时优先用它
    fn backoff(&self, attempt: u32, err: &LlmError) -> Duration {
        if let LlmError::RateLimited { retry_after_ms } = err {
            return Duration::from_millis(*retry_after_ms);
        }
        let exp = self
            .base_backoff_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.max_backoff_ms);
        Duration::from_millis(exp)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 750,
            max_backoff_ms: 8_000,
        }
    }
}

/// 装饰器：包裹任意 LlmClient，对瞬时错误做指数退避重试
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let mut attempt: u32 = 0;
        loop {
            match self.inner.complete(messages).await {
                Ok(out) => return Ok(out),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let wait = self.config.backoff(attempt, &e);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "LLM transient error, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyClient {
        fail_times: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmClient for FlakyClient {
        async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(LlmError::Http { status: 503 })
            } else {
                Ok("ok".to_string())
            }
        }
    }

    #[tokio::test]
    async fn test_retrying_client_recovers_from_transient() {
        let inner = Arc::new(FlakyClient {
            fail_times: 2,
            calls: AtomicU32::new(0),
        });
        let client = RetryingLlmClient::new(
            inner.clone(),
            RetryConfig {
                max_retries: 3,
                base_backoff_ms: 1,
                max_backoff_ms: 2,
            },
        );
        let out = client.complete(&[Message::user("hi")]).await.unwrap();
        assert_eq!(out, "ok");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retrying_client_gives_up_on_non_transient() {
        struct AlwaysBad;

        #[async_trait]
        impl LlmClient for AlwaysBad {
            async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
                Err(LlmError::Http { status: 401 })
            }
        }

        let client = RetryingLlmClient::new(Arc::new(AlwaysBad), RetryConfig::default());
        let err = client.complete(&[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, LlmError::Http { status: 401 }));
    }

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::Timeout.is_transient());
        assert!(LlmError::RateLimited { retry_after_ms: 100 }.is_transient());
        assert!(LlmError::Http { status: 502 }.is_transient());
        assert!(!LlmError::Http { status: 400 }.is_transient());
        assert!(!LlmError::EmptyResponse.is_transient());
    }
}

//! Scripted LLM 客户端（用于测试，无需 API）
//!
//! 按入队顺序弹出预置回复，队列耗尽后返回固定的 <terminate>；
//! 便于把 Planner / Writer 循环跑成确定性脚本。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, Message};

/// Scripted 客户端：依次返回预置的回复
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    responses: Mutex<VecDeque<String>>,
    /// 队列耗尽后的兜底回复
    exhausted_response: String,
}

impl ScriptedLlmClient {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            exhausted_response: "<terminate>script exhausted</terminate>".to_string(),
        }
    }

    pub fn with_exhausted_response(mut self, response: impl Into<String>) -> Self {
        self.exhausted_response = response.into();
        self
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
        let mut q = self.responses.lock().unwrap();
        Ok(q.pop_front().unwrap_or_else(|| self.exhausted_response.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_order_and_exhaustion() {
        let client = ScriptedLlmClient::new(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(client.complete(&[]).await.unwrap(), "a");
        assert_eq!(client.complete(&[]).await.unwrap(), "b");
        assert!(client.complete(&[]).await.unwrap().contains("terminate"));
    }
}

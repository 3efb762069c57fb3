//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Scripted 测试桩）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::ScriptedLlmClient;
pub use openai::{create_llm_from_config, OpenAiClient, TokenUsage};
pub use traits::{LlmClient, LlmError, Message, RetryConfig, RetryingLlmClient, Role};

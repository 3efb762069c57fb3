//! 引擎错误分类与运行结局
//!
//! 瞬时外部错误在各自组件内重试后以 Result 浮出；编排器据此决定：
//! 跳过子任务（可恢复）、降级为部分报告（Partial）还是中止（Fatal）。

use thiserror::Error;

use crate::bank::BankError;
use crate::fetch::FetchError;
use crate::journal::JournalError;
use crate::llm::LlmError;
use crate::outline::OutlineError;
use crate::protocol::ProtocolError;
use crate::search::SearchError;

/// 引擎统一错误
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 单步内纠正重试用尽；运行失败但可 continue 恢复
    #[error("agent exhausted protocol retries: {0}")]
    ProtocolExhausted(String),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Bank(#[from] BankError),

    #[error("outline error: {0}")]
    Outline(#[from] OutlineError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error("budget exceeded: {0}")]
    Budget(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("fatal: {0}")]
    Fatal(String),
}

/// 运行结局 -> 进程退出码
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    Partial,
    Fatal,
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Complete => 0,
            RunStatus::Partial => 2,
            RunStatus::Fatal => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Complete => "complete",
            RunStatus::Partial => "partial",
            RunStatus::Fatal => "fatal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunStatus::Complete.exit_code(), 0);
        assert_eq!(RunStatus::Partial.exit_code(), 2);
        assert_eq!(RunStatus::Fatal.exit_code(), 1);
    }

    #[test]
    fn test_error_messages_carry_context() {
        let e = EngineError::ProtocolExhausted("planner step 2".into());
        assert!(e.to_string().contains("planner step 2"));
        let e: EngineError = ProtocolError::NoAction.into();
        assert!(e.to_string().contains("protocol"));
    }
}

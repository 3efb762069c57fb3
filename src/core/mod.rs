//! 核心编排层：错误分类、运行状态重建、主控流程
//!
//! 组件间用带类型的 Result 传错，不跨 I/O 边界抛异常；编排器把错误映射为
//! 日志事件并决定可恢复性。

pub mod error;
pub mod orchestrator;
pub mod state;

pub use error::{EngineError, RunStatus};
pub use orchestrator::{Orchestrator, RunContext, RunOutcome, RunPaths};
pub use state::{RunState, WrittenSection};

//! 智能体层：Planner（证据收集 + 大纲迭代）与 Writer（按节写作）
//!
//! 两个循环都是纯状态机：prompt -> LLM 回复 -> 解析动作 -> 执行副作用 -> 下一轮 prompt。
//! 流式输出是 LLM 客户端内部的优化，循环不感知。

pub mod planner;
pub mod writer;

pub use planner::{Planner, PlannerOutcome};
pub use writer::{render_references, SectionRecord, Writer, WriterOutcome};

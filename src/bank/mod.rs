//! 证据库（Memory Bank）：本次运行内所有来源证据的权威存储
//!
//! 追加式 JSONL 持久化 + 内容哈希去重；证据 ID `ev_0001` 形式、稠密单调、
//! 终身稳定，被大纲与报告作为引用锚点直接使用。

pub mod evidence;
pub mod store;

pub use evidence::{Evidence, EvidenceDraft, EvidenceItem, EvidenceKind, SourceMeta};
pub use store::{AddOutcome, BankError, BankStats, EvidenceBank};

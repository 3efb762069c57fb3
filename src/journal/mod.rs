//! 事件日志：追加式 JSONL，重放与续跑的基础
//!
//! 单写者；每条事件 append + fsync，step 单调递增。重放时未知 kind 保留为
//! Unknown（向前兼容），损坏行（崩溃截断）丢弃并记日志。

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 事件类型（闭集）；重放遇到未知值归入 Unknown 并忽略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    PlannerStep,
    SearchIssued,
    EvidenceAdded,
    OutlineUpdated,
    PlannerTerminated,
    WriterStep,
    SectionRetrieved,
    SectionWritten,
    WriterTerminated,
    Error,
    RunFinished,
    #[serde(other)]
    Unknown,
}

/// 单条事件（events.jsonl 的一行）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub ts: DateTime<Utc>,
    pub run_id: String,
    pub step: u64,
    pub kind: EventKind,
    pub payload: Value,
}

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("journal io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// 事件日志写入端：单写者持有，append 即落盘
pub struct EventJournal {
    path: PathBuf,
    run_id: String,
    next_step: u64,
}

impl EventJournal {
    /// 打开（或创建）日志；已有文件时从末尾恢复 step 计数
    pub fn open(path: impl AsRef<Path>, run_id: impl Into<String>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut next_step = 1;
        if path.exists() {
            for ev in replay(&path)? {
                next_step = next_step.max(ev.step + 1);
            }
        }
        Ok(Self {
            path,
            run_id: run_id.into(),
            next_step,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// 追加一条事件并 fsync，返回其 step
    pub fn append(&mut self, kind: EventKind, payload: Value) -> Result<u64, JournalError> {
        let step = self.next_step;
        let event = RunEvent {
            ts: Utc::now(),
            run_id: self.run_id.clone(),
            step,
            kind,
            payload,
        };
        let line = serde_json::to_string(&event)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_data()?;
        self.next_step += 1;
        Ok(step)
    }

    /// 记录一条 error 事件；自身失败只打日志，不向上传播
    pub fn record_error(&mut self, stage: &str, detail: &str) {
        let payload = serde_json::json!({"stage": stage, "detail": detail});
        if let Err(e) = self.append(EventKind::Error, payload) {
            tracing::error!(error = %e, stage, "failed to journal error event");
        }
    }
}

/// 读取并解析全部事件；损坏行丢弃（崩溃最多截断一条尾行）
pub fn replay(path: impl AsRef<Path>) -> Result<Vec<RunEvent>, JournalError> {
    let path = path.as_ref();
    let mut events = Vec::new();
    if !path.exists() {
        return Ok(events);
    }
    let data = std::fs::read_to_string(path)?;
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RunEvent>(line) {
            Ok(ev) => events.push(ev),
            Err(e) => {
                tracing::warn!(error = %e, "discarding corrupt journal line");
            }
        }
    }
    Ok(events)
}

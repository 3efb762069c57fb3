//! 运行状态重建：从 events.jsonl 重放出续跑所需的全部进度
//!
//! 证据库本身由 evidence.jsonl 重建；这里只从事件流恢复：大纲（最后一次
//! outline_updated）、Planner 是否已终止、已写完的章节与全局已消费的证据 ID。
//! 旧事件不会被重发，新事件接在最后一条有效行之后。

use std::collections::HashMap;

use crate::journal::{EventKind, RunEvent};
use crate::outline::Outline;

/// 已写完章节的重放视图
#[derive(Debug, Clone)]
pub struct WrittenSection {
    pub title: String,
    pub body: String,
    pub used_ids: Vec<String>,
}

/// 从事件流重建出的运行进度
#[derive(Debug, Default)]
pub struct RunState {
    pub run_started: bool,
    /// run_started 事件携带的原始问题
    pub query: Option<String>,
    pub planner_terminated: bool,
    /// 最后一次提交的大纲
    pub outline: Option<Outline>,
    pub sections_written: HashMap<String, WrittenSection>,
    /// 全报告首次使用顺序的证据 ID（跨章节累计）
    pub used_ids: Vec<String>,
    pub run_finished: bool,
    pub final_status: Option<String>,
    pub last_step: u64,
}

impl RunState {
    pub fn replay(events: &[RunEvent]) -> Self {
        let mut state = RunState::default();
        let mut used_seen = std::collections::HashSet::new();

        for ev in events {
            state.last_step = state.last_step.max(ev.step);
            match ev.kind {
                EventKind::RunStarted => {
                    state.run_started = true;
                    if let Some(q) = ev.payload.get("query").and_then(|v| v.as_str()) {
                        state.query = Some(q.to_string());
                    }
                }
                EventKind::OutlineUpdated => {
                    let version = ev
                        .payload
                        .get("version")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(1) as u32;
                    if let Some(md) = ev.payload.get("markdown").and_then(|v| v.as_str()) {
                        match Outline::parse(md, version) {
                            Ok(outline) => state.outline = Some(outline),
                            Err(e) => {
                                tracing::warn!(error = %e, "discarding unparseable outline_updated event")
                            }
                        }
                    }
                }
                EventKind::PlannerTerminated => {
                    state.planner_terminated = true;
                }
                EventKind::SectionWritten => {
                    let Some(node_id) = ev.payload.get("node_id").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    let title = ev
                        .payload
                        .get("title")
                        .and_then(|v| v.as_str())
                        .unwrap_or("Section")
                        .to_string();
                    let body = ev
                        .payload
                        .get("body")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let used: Vec<String> = ev
                        .payload
                        .get("used_ids")
                        .and_then(|v| v.as_array())
                        .map(|arr| {
                            arr.iter()
                                .filter_map(|v| v.as_str())
                                .map(String::from)
                                .collect()
                        })
                        .unwrap_or_default();
                    for id in &used {
                        if used_seen.insert(id.clone()) {
                            state.used_ids.push(id.clone());
                        }
                    }
                    state
                        .sections_written
                        .insert(node_id.to_string(), WrittenSection { title, body, used_ids: used });
                }
                EventKind::RunFinished => {
                    state.run_finished = true;
                    state.final_status = ev
                        .payload
                        .get("status")
                        .and_then(|v| v.as_str())
                        .map(String::from);
                }
                // 其余事件（含 Unknown）对进度重建无贡献
                _ => {}
            }
        }
        state
    }
}

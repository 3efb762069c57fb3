//! 运行编排器：分配运行目录、顺序驱动 Planner -> 评审 -> Writer、落盘产物
//!
//! 所有组件从一个不可变 AppConfig 构建并通过 RunContext 传递，不设进程级
//! 单例。不可恢复错误被翻译为部分报告（已完成章节 + incomplete 标记）；
//! 取消与崩溃后的运行都可以用 resume 从日志续跑。

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::agents::{render_references, Planner, SectionRecord, Writer};
use crate::bank::EvidenceBank;
use crate::config::AppConfig;
use crate::core::{EngineError, RunState, RunStatus};
use crate::fetch::{PageFetcher, PageSource};
use crate::journal::{self, EventJournal, EventKind, RunEvent};
use crate::judge::OutlineJudge;
use crate::llm::{LlmClient, Message};
use crate::outline::Outline;
use crate::search::SearchProvider;

/// 运行目录布局（位坐标固定，见 events/evidence_bank/outline/report）
#[derive(Debug, Clone)]
pub struct RunPaths {
    root: PathBuf,
}

impl RunPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn events_path(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    pub fn evidence_root(&self) -> PathBuf {
        self.root.join("evidence_bank")
    }

    pub fn outline_path(&self) -> PathBuf {
        self.root.join("outline.md")
    }

    pub fn report_path(&self) -> PathBuf {
        self.root.join("report.md")
    }

    pub fn judgement_path(&self) -> PathBuf {
        self.root.join("outline_judgement.json")
    }
}

/// 一次运行的共享上下文；智能体只看它，不碰全局状态
pub struct RunContext {
    pub config: AppConfig,
    pub llm: Arc<dyn LlmClient>,
    pub search: Arc<dyn SearchProvider>,
    pub fetcher: Arc<dyn PageSource>,
    pub bank: Arc<Mutex<EvidenceBank>>,
    pub journal: Arc<Mutex<EventJournal>>,
    pub paths: RunPaths,
    pub cancel: CancellationToken,
}

/// 运行结果
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub report_path: PathBuf,
    pub status: RunStatus,
}

pub struct Orchestrator {
    config: AppConfig,
    llm: Arc<dyn LlmClient>,
    search: Arc<dyn SearchProvider>,
    fetcher: Option<Arc<dyn PageSource>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: AppConfig, llm: Arc<dyn LlmClient>, search: Arc<dyn SearchProvider>) -> Self {
        Self {
            config,
            llm,
            search,
            fetcher: None,
            cancel: CancellationToken::new(),
        }
    }

    /// 覆盖页面来源（测试注入固定页面）
    pub fn with_page_source(mut self, fetcher: Arc<dyn PageSource>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// 从配置与环境变量构建真实后端（LLM 端点 + 搜索提供方）
    pub fn from_env(config: AppConfig) -> Result<Self, EngineError> {
        let llm = crate::llm::create_llm_from_config(&config.llm);
        let search = crate::search::create_search_provider(&config.search)?;
        Ok(Self::new(config, llm, search))
    }

    /// 取消令牌（供 Ctrl-C 等外部信号触发）
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 开新一次运行
    pub async fn run(&self, query: &str) -> Result<RunOutcome, EngineError> {
        let run_id = allocate_run_id();
        let root = self.config.run.artifacts_dir.join(format!("run_{}", run_id));
        std::fs::create_dir_all(&root)
            .map_err(|e| EngineError::Fatal(format!("run directory unwritable: {}", e)))?;
        tracing::info!(run_id = %run_id, root = %root.display(), "run started");
        println!("{}", run_id);

        let ctx = self.build_context(run_id.clone(), RunPaths::new(root))?;
        self.drive(ctx, query.to_string(), RunState::default()).await
    }

    /// 续跑既有运行：重放日志重建进度，从断点继续
    pub async fn resume(&self, run_id: &str) -> Result<RunOutcome, EngineError> {
        let root = self.config.run.artifacts_dir.join(format!("run_{}", run_id));
        if !root.exists() {
            return Err(EngineError::Fatal(format!("run {} not found under {}", run_id, self.config.run.artifacts_dir.display())));
        }
        let paths = RunPaths::new(root);
        let events = journal::replay(paths.events_path())?;
        let state = RunState::replay(&events);

        if state.run_finished {
            // 已完成的运行 continue 是 no-op：不追加任何事件
            let status = match state.final_status.as_deref() {
                Some("partial") => RunStatus::Partial,
                Some("fatal") => RunStatus::Fatal,
                _ => RunStatus::Complete,
            };
            tracing::info!(run_id, status = status.as_str(), "run already finished, nothing to do");
            return Ok(RunOutcome {
                run_id: run_id.to_string(),
                report_path: paths.report_path(),
                status,
            });
        }

        let query = state
            .query
            .clone()
            .ok_or_else(|| EngineError::Fatal("journal carries no run_started query".to_string()))?;
        tracing::info!(run_id, planner_done = state.planner_terminated, sections_done = state.sections_written.len(), "resuming run");

        let ctx = self.build_context(run_id.to_string(), paths)?;
        self.drive(ctx, query, state).await
    }

    /// 读取一次运行的全部事件（CLI replay 用）
    pub fn replay_events(config: &AppConfig, run_id: &str) -> Result<Vec<RunEvent>, EngineError> {
        let root = config.run.artifacts_dir.join(format!("run_{}", run_id));
        let paths = RunPaths::new(root);
        Ok(journal::replay(paths.events_path())?)
    }

    fn build_context(&self, run_id: String, paths: RunPaths) -> Result<Arc<RunContext>, EngineError> {
        let bank = EvidenceBank::open(paths.evidence_root())?;
        let journal = EventJournal::open(paths.events_path(), run_id)?;
        Ok(Arc::new(RunContext {
            config: self.config.clone(),
            llm: self.llm.clone(),
            search: self.search.clone(),
            fetcher: self
                .fetcher
                .clone()
                .unwrap_or_else(|| Arc::new(PageFetcher::new(&self.config.fetch))),
            bank: Arc::new(Mutex::new(bank)),
            journal: Arc::new(Mutex::new(journal)),
            paths,
            cancel: self.cancel.clone(),
        }))
    }

    /// 主流程：Planner -> 大纲兜底 -> 评审 -> Writer -> 报告组装
    async fn drive(
        &self,
        ctx: Arc<RunContext>,
        query: String,
        state: RunState,
    ) -> Result<RunOutcome, EngineError> {
        let run_id = ctx.journal.lock().await.run_id().to_string();
        let deadline = match self.config.run.wall_clock_secs {
            0 => None,
            secs => Some(tokio::time::Instant::now() + std::time::Duration::from_secs(secs)),
        };

        if !state.run_started {
            let mut journal = ctx.journal.lock().await;
            journal.append(EventKind::RunStarted, json!({ "query": &query }))?;
        }

        let mut status = RunStatus::Complete;
        let mut outline = state.outline.clone();

        // -------- Planner --------
        if !state.planner_terminated {
            let planner = Planner::new(ctx.clone());
            match with_deadline(deadline, planner.run(&query, outline.take())).await {
                Ok(outcome) => {
                    tracing::info!(reason = %outcome.reason, "planner finished");
                    outline = outcome.outline;
                }
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(EngineError::Budget(msg)) => {
                    ctx.journal.lock().await.record_error("planner_budget", &msg);
                    status = RunStatus::Partial;
                }
                Err(e) => {
                    // ProtocolExhausted / LLM 全挂等：不写 run_finished，留给 resume
                    ctx.journal.lock().await.record_error("planner", &e.to_string());
                    return Err(e);
                }
            }
        }

        // -------- 空证据短路 --------
        let (evidence_count, stats) = {
            let bank = ctx.bank.lock().await;
            (bank.count(), bank.stats())
        };
        tracing::info!(
            evidence = stats.count,
            summary_chars = stats.total_summary_chars,
            domains = stats.distinct_domains,
            "evidence bank after planning"
        );
        if outline.is_none() && evidence_count == 0 {
            let report = "# Report\n\n## Findings\n\nInsufficient evidence gathered.\n\n<!-- incomplete -->\n";
            std::fs::write(ctx.paths.report_path(), report)
                .map_err(|e| EngineError::Fatal(format!("cannot write report.md: {}", e)))?;
            let mut journal = ctx.journal.lock().await;
            journal.append(EventKind::RunFinished, json!({ "status": RunStatus::Partial.as_str() }))?;
            return Ok(RunOutcome {
                run_id,
                report_path: ctx.paths.report_path(),
                status: RunStatus::Partial,
            });
        }

        // -------- 大纲兜底 --------
        let outline = match outline {
            Some(o) => o,
            None => self.fallback_outline(&ctx, &query).await?,
        };
        // 确保外部形式与内存一致（续跑时 outline.md 可能落后于日志）
        std::fs::write(ctx.paths.outline_path(), outline.to_markdown())
            .map_err(|e| EngineError::Fatal(format!("cannot write outline.md: {}", e)))?;

        // -------- 大纲评审（尽力而为）--------
        self.judge_outline(&ctx, &query, &outline).await;

        // -------- Writer --------
        let writer = Writer::new(ctx.clone());
        let sections: Vec<SectionRecord>;
        let used_ids: Vec<String>;
        match with_deadline(deadline, writer.run(&query, &outline, &state)).await {
            Ok(out) => {
                if !out.complete {
                    status = RunStatus::Partial;
                }
                sections = out.sections;
                used_ids = out.used_ids;
            }
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(e) => {
                // 超时或中途失败：从日志里捞已写完的章节，发部分报告
                ctx.journal.lock().await.record_error("writer", &e.to_string());
                status = RunStatus::Partial;
                let events = journal::replay(ctx.paths.events_path())?;
                let st = RunState::replay(&events);
                let mut recovered = Vec::new();
                for view in outline.sections_at(self.config.writer.write_level) {
                    if let Some(done) = st.sections_written.get(&view.node_id) {
                        recovered.push(SectionRecord {
                            node_id: view.node_id.clone(),
                            title: done.title.clone(),
                            level: view.level,
                            body: done.body.clone(),
                            used_ids: done.used_ids.clone(),
                        });
                    }
                }
                sections = recovered;
                used_ids = st.used_ids;
            }
        }

        // -------- 报告组装 --------
        let report = self.assemble_report(&ctx, &sections, &used_ids, status).await;
        std::fs::write(ctx.paths.report_path(), report)
            .map_err(|e| EngineError::Fatal(format!("cannot write report.md: {}", e)))?;
        tracing::info!(report = %ctx.paths.report_path().display(), status = status.as_str(), "report written");

        {
            let mut journal = ctx.journal.lock().await;
            journal.append(EventKind::RunFinished, json!({ "status": status.as_str() }))?;
        }

        Ok(RunOutcome {
            run_id,
            report_path: ctx.paths.report_path(),
            status,
        })
    }

    /// Planner 未产出大纲时：先尝试一次 LLM 直接生成，再退到最小外壳大纲
    async fn fallback_outline(&self, ctx: &Arc<RunContext>, query: &str) -> Result<Outline, EngineError> {
        let summaries = ctx.bank.lock().await.summaries(None);
        let mut context_lines: Vec<String> = Vec::new();
        for (id, url, summary) in summaries.iter().take(10) {
            context_lines.push(format!("- {} | {}", id, url));
            let trimmed: String = summary.chars().take(400).collect();
            context_lines.push(format!("  Summary: {}", trimmed));
        }
        let context_block = if context_lines.is_empty() {
            "<no structured evidence available>".to_string()
        } else {
            context_lines.join("\n")
        };

        let messages = [
            Message::system(
                "The planning phase ended without an outline. Produce one complete report outline now. \
                Output exactly one <write_outline>...</write_outline> block containing markdown headings \
                and bullets; attach <citation>ev_NNNN</citation> tags only for ids listed below.",
            ),
            Message::user(format!(
                "Research query:\n{}\n\nEvidence summaries:\n{}\n\nEmit the outline now.",
                query, context_block
            )),
        ];

        let parsed = match ctx.llm.complete(&messages).await {
            Ok(raw) => {
                let body = crate::protocol::parse_planner_action(&raw)
                    .ok()
                    .and_then(|a| match a {
                        crate::protocol::PlannerAction::WriteOutline { text } => Some(text),
                        _ => None,
                    })
                    .unwrap_or(raw);
                match Outline::parse(&body, 1) {
                    Ok(o) => {
                        let bank = ctx.bank.lock().await;
                        if o.validate_citations(&bank).is_ok() {
                            Some(o)
                        } else {
                            None
                        }
                    }
                    Err(_) => None,
                }
            }
            Err(e) => {
                ctx.journal.lock().await.record_error("outline_fallback", &e.to_string());
                None
            }
        };

        let outline = match parsed {
            Some(o) => o,
            None => {
                tracing::warn!("fallback outline generation failed; using minimal shell outline");
                Outline::parse("# Report\n## Findings\n- summarize the gathered evidence\n", 1)
                    .expect("shell outline parses")
            }
        };

        std::fs::write(ctx.paths.outline_path(), outline.to_markdown())
            .map_err(|e| EngineError::Fatal(format!("cannot write outline.md: {}", e)))?;
        {
            let mut journal = ctx.journal.lock().await;
            journal.append(
                EventKind::OutlineUpdated,
                json!({ "version": outline.version, "markdown": outline.to_markdown(), "fallback": true }),
            )?;
        }
        Ok(outline)
    }

    /// 大纲评审：失败写 {"error": ...}，从不影响运行
    async fn judge_outline(&self, ctx: &Arc<RunContext>, query: &str, outline: &Outline) {
        let path = ctx.paths.judgement_path();
        if path.exists() {
            return;
        }
        let judge = OutlineJudge::new(ctx.llm.clone());
        let report = judge.judge(query, &outline.to_markdown()).await;
        let payload = if report.results.is_empty() {
            json!({ "error": "outline judgement produced no parseable criteria" })
        } else {
            serde_json::to_value(&report).unwrap_or_else(|e| json!({ "error": e.to_string() }))
        };
        if let Err(e) = std::fs::write(&path, serde_json::to_string_pretty(&payload).unwrap_or_default()) {
            tracing::warn!(error = %e, "failed to write outline judgement");
        }
    }

    /// 章节按大纲顺序拼接 + References；部分完成时附 incomplete 标记
    async fn assemble_report(
        &self,
        ctx: &Arc<RunContext>,
        sections: &[SectionRecord],
        used_ids: &[String],
        status: RunStatus,
    ) -> String {
        let mut parts: Vec<String> = Vec::new();
        for section in sections {
            let body = section.body.trim();
            if body.trim_start().starts_with('#') {
                parts.push(body.to_string());
            } else {
                parts.push(format!(
                    "{} {}\n\n{}",
                    "#".repeat(section.level as usize),
                    section.title,
                    body
                ));
            }
        }

        let evidences: Vec<(String, crate::bank::Evidence)> = {
            let bank = ctx.bank.lock().await;
            bank.list_all().iter().map(|ev| (ev.id.clone(), ev.clone())).collect()
        };
        let refs = render_references(used_ids, &evidences);

        let mut report = format!("{}\n\n{}", parts.join("\n\n"), refs);
        if status == RunStatus::Partial {
            report.push_str("\n\n<!-- incomplete -->");
        }
        report.push('\n');
        report
    }
}

/// run_id = <utc 时间戳>_<uuid 前 8 位>
fn allocate_run_id() -> String {
    let ts = Utc::now().format("%Y%m%dT%H%M%SZ");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", ts, &suffix[..8])
}

/// 全局墙钟预算：超时映射为 Budget 错误
async fn with_deadline<T>(
    deadline: Option<tokio::time::Instant>,
    fut: impl std::future::Future<Output = Result<T, EngineError>>,
) -> Result<T, EngineError> {
    match deadline {
        Some(at) => match tokio::time::timeout_at(at, fut).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Budget("global wall clock budget exceeded".to_string())),
        },
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_shape() {
        let id = allocate_run_id();
        let (ts, suffix) = id.split_once('_').unwrap();
        assert!(ts.ends_with('Z'));
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_run_paths_layout() {
        let paths = RunPaths::new(PathBuf::from("/tmp/run_x"));
        assert!(paths.events_path().ends_with("events.jsonl"));
        assert!(paths.evidence_root().ends_with("evidence_bank"));
        assert!(paths.outline_path().ends_with("outline.md"));
        assert!(paths.report_path().ends_with("report.md"));
        assert!(paths.judgement_path().ends_with("outline_judgement.json"));
    }
}

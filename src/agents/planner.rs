//! Planner 智能体：search / write_outline / terminate 三动作的 ReAct 循环
//!
//! 每步把「用户问题 + 轮次状态 + 当前大纲 + 证据摘要」拼成 prompt（绝不包含原文页面），
//! 解析恰好一个动作并分发。Search 走两级 URL 过滤（LLM 选 + 抓取端淘汰），
//! 抓到的每页再各调一次 LLM 做摘要与结构化抽取，最后入证据库。
//! 单个子调用失败只记 error 事件并跳过，绝不中止整次运行。

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::bank::{EvidenceDraft, EvidenceItem, SourceMeta};
use crate::core::{EngineError, RunContext};
use crate::fetch::PageSource as _;
use crate::journal::EventKind;
use crate::llm::{LlmClient, Message};
use crate::outline::Outline;
use crate::protocol::{extract_json_object, parse_planner_action, PlannerAction};
use crate::search::{SearchHit, SearchProvider as _};

const PLANNER_SYSTEM_PROMPT: &str = "\
You are the Planner of a deep-research system. Your job is to gather web evidence \
and iteratively refine a structured report outline for the user's query.

Each turn you must emit exactly ONE action:
1. <tool_call>{\"name\": \"search\", \"arguments\": {\"query\": [\"...\"], \"goal\": \"...\"}}</tool_call> \
- issue new web searches (avoid repeating past queries).
2. <write_outline>markdown outline</write_outline> - write or update the outline. \
Use markdown headings (#, ##, ###) and bullets. Attach evidence with inline \
<citation>ev_0001,ev_0002</citation> tags; only cite ids that appear in the evidence summaries.
3. <terminate>reason</terminate> - finish planning once the outline is complete and well-cited.

Write an initial outline early and refine it as evidence accumulates. \
Do not wait for perfect coverage before outlining.";

/// Planner 循环结果
#[derive(Debug)]
pub struct PlannerOutcome {
    /// 最后一次成功提交的大纲（可能为 None：从未产出）
    pub outline: Option<Outline>,
    /// 终止原因（terminate / stagnation / step_limit / evidence_budget）
    pub reason: String,
}

pub struct Planner {
    ctx: Arc<RunContext>,
}

impl Planner {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx }
    }

    /// 运行规划循环直至终止；resume_outline 为续跑时重放出的大纲
    pub async fn run(
        &self,
        query: &str,
        resume_outline: Option<Outline>,
    ) -> Result<PlannerOutcome, EngineError> {
        let cfg = self.ctx.config.planner.clone();
        let mut outline = resume_outline;
        let mut past_queries: HashSet<String> = HashSet::new();
        let mut stagnant_steps = 0usize;
        let mut converted_early_terminate = false;

        for step_idx in 0..cfg.max_steps {
            if self.ctx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let (evidence_before, summaries) = {
                let bank = self.ctx.bank.lock().await;
                (bank.count(), bank.summaries(None))
            };

            if evidence_before >= cfg.max_evidence {
                self.terminate_event("evidence_budget").await?;
                return Ok(PlannerOutcome {
                    outline,
                    reason: "evidence_budget".to_string(),
                });
            }

            let prompt = build_prompt(
                &cfg,
                query,
                outline.as_ref(),
                &summaries,
                step_idx,
                evidence_before,
                &past_queries,
            );
            let outline_version_before = outline.as_ref().map(|o| o.version);

            let action = self
                .next_action(&prompt, &mut outline, step_idx)
                .await?;

            {
                let mut journal = self.ctx.journal.lock().await;
                journal.append(
                    EventKind::PlannerStep,
                    json!({
                        "step": step_idx + 1,
                        "max_steps": cfg.max_steps,
                        "action": action_name(&action),
                        "evidence_count": evidence_before,
                    }),
                )?;
            }

            match action {
                PlannerAction::Terminate { reason } => {
                    // 尚无大纲就终止属于异常；转为一次保守搜索，只豁免一次
                    if outline.is_none() && !converted_early_terminate {
                        tracing::warn!(reason = %reason, "planner requested early terminate without outline; converting to search");
                        converted_early_terminate = true;
                        self.handle_search(query, vec![query.to_string()], &mut past_queries)
                            .await;
                    } else {
                        self.terminate_event(&reason).await?;
                        return Ok(PlannerOutcome { outline, reason });
                    }
                }
                PlannerAction::Search { queries, goal } => {
                    tracing::info!(count = queries.len(), goal = %goal, "planner search action");
                    let capped: Vec<String> =
                        queries.into_iter().take(cfg.max_queries_per_step).collect();
                    self.handle_search(query, capped, &mut past_queries).await;
                }
                PlannerAction::WriteOutline { .. } => {
                    // 提交在 next_action 内完成（含引用校验与重试），此处无事可做
                }
            }

            let evidence_after = self.ctx.bank.lock().await.count();
            let outline_changed = outline.as_ref().map(|o| o.version) != outline_version_before;
            if evidence_after == evidence_before && !outline_changed {
                stagnant_steps += 1;
            } else {
                stagnant_steps = 0;
            }
            if stagnant_steps >= cfg.stagnation_limit {
                self.terminate_event("stagnation").await?;
                return Ok(PlannerOutcome {
                    outline,
                    reason: "stagnation".to_string(),
                });
            }
        }

        self.terminate_event("step_limit").await?;
        Ok(PlannerOutcome {
            outline,
            reason: "step_limit".to_string(),
        })
    }

    async fn terminate_event(&self, reason: &str) -> Result<(), EngineError> {
        let mut journal = self.ctx.journal.lock().await;
        journal.append(EventKind::PlannerTerminated, json!({ "reason": reason }))?;
        tracing::info!(reason, "planner terminated");
        Ok(())
    }

    /// 调 LLM 并解析动作；解析失败与大纲校验失败都在本步内用纠正提示重试。
    /// WriteOutline 在这里就地提交（写 outline.md + outline_updated 事件）。
    async fn next_action(
        &self,
        prompt: &str,
        outline: &mut Option<Outline>,
        step_idx: usize,
    ) -> Result<PlannerAction, EngineError> {
        let cfg = &self.ctx.config.planner;
        let mut messages = vec![
            Message::system(PLANNER_SYSTEM_PROMPT),
            Message::user(prompt),
        ];

        for attempt in 0..=cfg.max_retries {
            let raw = self.ctx.llm.complete(&messages).await?;

            let err = match parse_planner_action(&raw) {
                Ok(PlannerAction::WriteOutline { text }) => {
                    match self.try_commit_outline(&text, outline).await? {
                        Ok(()) => return Ok(PlannerAction::WriteOutline { text }),
                        Err(correction) => correction,
                    }
                }
                Ok(action) => return Ok(action),
                Err(e) => e.correction(),
            };

            tracing::warn!(step = step_idx + 1, attempt, "planner output rejected, sending correction");
            {
                let mut journal = self.ctx.journal.lock().await;
                journal.record_error("planner_protocol", &err);
            }
            messages.push(Message::assistant(raw));
            messages.push(Message::user(err));
        }

        Err(EngineError::ProtocolExhausted(format!(
            "planner step {} exceeded {} retries",
            step_idx + 1,
            cfg.max_retries
        )))
    }

    /// 解析 + 引用校验通过才提交；失败返回给智能体的纠正文本
    async fn try_commit_outline(
        &self,
        text: &str,
        outline: &mut Option<Outline>,
    ) -> Result<Result<(), String>, EngineError> {
        let version = outline.as_ref().map(|o| o.version + 1).unwrap_or(1);
        let parsed = match Outline::parse(text, version) {
            Ok(o) => o,
            Err(e) => return Ok(Err(format!("Outline rejected: {}. Re-emit <write_outline> with valid markdown headings.", e))),
        };
        {
            let bank = self.ctx.bank.lock().await;
            if let Err(e) = parsed.validate_citations(&bank) {
                return Ok(Err(e.correction()));
            }
        }

        let markdown = parsed.to_markdown();
        std::fs::write(&self.ctx.paths.outline_path(), &markdown)
            .map_err(|e| EngineError::Fatal(format!("cannot write outline.md: {}", e)))?;
        {
            let mut journal = self.ctx.journal.lock().await;
            journal.append(
                EventKind::OutlineUpdated,
                json!({ "version": version, "markdown": markdown }),
            )?;
        }
        tracing::info!(version, "outline updated");
        *outline = Some(parsed);
        Ok(Ok(()))
    }

    /// Search 动作的证据采集管线；任何子失败都只降级为 error 事件
    async fn handle_search(
        &self,
        user_query: &str,
        queries: Vec<String>,
        past_queries: &mut HashSet<String>,
    ) {
        let cfg = self.ctx.config.clone();
        for q in queries {
            let key = q.trim().to_lowercase();
            if key.is_empty() || !past_queries.insert(key) {
                tracing::debug!(query = %q, "skipping duplicate search query");
                continue;
            }
            {
                let mut journal = self.ctx.journal.lock().await;
                if let Err(e) = journal.append(EventKind::SearchIssued, json!({ "query": &q })) {
                    tracing::error!(error = %e, "failed to journal search_issued");
                }
            }

            let hits = match self.ctx.search.search(&q, cfg.search.max_results).await {
                Ok(hits) => hits,
                Err(e) => {
                    let mut journal = self.ctx.journal.lock().await;
                    journal.record_error("web_search", &e.to_string());
                    continue;
                }
            };
            tracing::info!(query = %q, results = hits.len(), "search results");
            if hits.is_empty() {
                continue;
            }

            let selected = self
                .filter_urls(&q, hits, cfg.planner.max_urls_per_query)
                .await;
            if selected.is_empty() {
                continue;
            }

            // 有界并发处理每个 URL：抓取 -> 摘要 -> 抽取 -> 入库
            let semaphore = Arc::new(Semaphore::new(cfg.fetch.concurrency.max(1)));
            let mut set = JoinSet::new();
            for hit in selected {
                let permit_sem = semaphore.clone();
                let ctx = self.ctx.clone();
                let user_query = user_query.to_string();
                let search_query = q.clone();
                set.spawn(async move {
                    let _permit = permit_sem.acquire_owned().await;
                    process_url(ctx, user_query, search_query, hit).await;
                });
            }
            while let Some(res) = set.join_next().await {
                if let Err(e) = res {
                    tracing::error!(error = %e, "url worker panicked");
                }
            }
        }
    }

    /// 第一级过滤：LLM 只看 (title, snippet) 选出至多 max_urls 条
    async fn filter_urls(
        &self,
        query: &str,
        hits: Vec<SearchHit>,
        max_urls: usize,
    ) -> Vec<SearchHit> {
        if hits.len() <= max_urls {
            return hits;
        }

        let mut lines = vec![format!("Query: {}", query), String::new(), "Search results:".to_string()];
        for hit in &hits {
            lines.push(format!("[{}] {}", hit.rank, hit.title.as_deref().unwrap_or("")));
            if let Some(snippet) = &hit.snippet {
                lines.push(format!("Snippet: {}", snippet));
            }
            lines.push(format!("URL: {}", hit.url));
            lines.push(String::new());
        }
        lines.push(format!(
            "Select up to {} results most useful for answering the query. \
            Return STRICT JSON: {{\"selected_ranks\": [int], \"rationale\": string}}. No other text.",
            max_urls
        ));

        let messages = [
            Message::system("You select which search results deserve a full fetch."),
            Message::user(lines.join("\n")),
        ];
        let ranks: Option<Vec<usize>> = match self.ctx.llm.complete(&messages).await {
            Ok(raw) => extract_json_object(&raw).and_then(|obj| {
                obj.get("selected_ranks")?.as_array().map(|arr| {
                    arr.iter().filter_map(|v| v.as_u64().map(|n| n as usize)).collect()
                })
            }),
            Err(e) => {
                let mut journal = self.ctx.journal.lock().await;
                journal.record_error("url_filter", &e.to_string());
                None
            }
        };

        match ranks {
            Some(ranks) if !ranks.is_empty() => {
                let mut selected: Vec<SearchHit> = Vec::new();
                for rank in ranks {
                    if let Some(hit) = hits.iter().find(|h| h.rank == rank) {
                        selected.push(hit.clone());
                    }
                    if selected.len() >= max_urls {
                        break;
                    }
                }
                if selected.is_empty() {
                    hits.into_iter().take(max_urls).collect()
                } else {
                    selected
                }
            }
            _ => {
                tracing::warn!("url filter produced no usable ranks; falling back to top results");
                hits.into_iter().take(max_urls).collect()
            }
        }
    }
}

fn action_name(action: &PlannerAction) -> &'static str {
    match action {
        PlannerAction::Search { .. } => "search",
        PlannerAction::WriteOutline { .. } => "write_outline",
        PlannerAction::Terminate { .. } => "terminate",
    }
}

/// 提示词只带最近这么多条证据摘要，更早的只报数量
const SUMMARY_WINDOW: usize = 20;
/// 单条摘要进提示词前的截断长度
const SUMMARY_PREVIEW_CHARS: usize = 400;

/// 组装单步提示词。大纲用紧凑目录（仅标题）、摘要取末尾窗口，
/// 保证提示词长度不随大纲规模与证据总量无界增长。
#[allow(clippy::too_many_arguments)]
fn build_prompt(
    cfg: &crate::config::PlannerSection,
    query: &str,
    outline: Option<&Outline>,
    summaries: &[(String, String, String)],
    step_idx: usize,
    evidence_count: usize,
    past_queries: &HashSet<String>,
) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push(format!("User Query: {}", query));
    lines.push(format!(
        "Planning Step: {}/{} | Evidence in bank: {}",
        step_idx + 1,
        cfg.max_steps,
        evidence_count
    ));
    lines.push(String::new());

    match outline {
        None => lines.push("Current Outline: <none>".to_string()),
        Some(o) => {
            lines.push("Current Outline (section map, titles only):".to_string());
            lines.push(o.compact_map());
        }
    }
    lines.push(String::new());

    lines.push("Evidence Bank Summaries (id, url, summary):".to_string());
    if summaries.is_empty() {
        lines.push("<empty>".to_string());
    } else {
        let omitted = summaries.len().saturating_sub(SUMMARY_WINDOW);
        if omitted > 0 {
            lines.push(format!("({} earlier evidences omitted)", omitted));
        }
        for (id, url, summary) in &summaries[omitted..] {
            lines.push(format!("- {} | {}", id, url));
            let trimmed: String = summary.chars().take(SUMMARY_PREVIEW_CHARS).collect();
            lines.push(format!("  Summary: {}", trimmed));
        }
    }
    lines.push(String::new());

    if !past_queries.is_empty() {
        let mut seen: Vec<&str> = past_queries.iter().map(|s| s.as_str()).collect();
        seen.sort_unstable();
        lines.push(format!("Already searched (do not repeat): {}", seen.join("; ")));
        lines.push(String::new());
    }

    // 决策指导：渐进式大纲策略 + 就绪提示
    let ready = outline
        .map(|o| o.every_leaf_cited() && evidence_count >= cfg.min_evidence)
        .unwrap_or(false);
    if outline.is_none() && (step_idx + 1 >= 4 || evidence_count >= 3) {
        lines.push(
            "Guidance: you have enough material for a first draft. Emit <write_outline> now \
            with the major sections, even if coverage is incomplete."
                .to_string(),
        );
    } else if ready {
        lines.push(
            "Guidance: the outline exists, every leaf section is cited, and the evidence bank \
            is sufficient. If no important gap remains, emit <terminate>."
                .to_string(),
        );
    } else if step_idx + 2 >= cfg.max_steps {
        lines.push(
            "Guidance: you are near the step limit. Finalize the outline with <write_outline> \
            or emit <terminate> if it is already complete."
                .to_string(),
        );
    }
    lines.push("Decide your single next action.".to_string());
    lines.join("\n")
}

/// 单 URL 的采集工序：抓取 -> 查询相关摘要 -> 证据抽取 -> 入库（去重）
async fn process_url(ctx: Arc<RunContext>, user_query: String, search_query: String, hit: SearchHit) {
    let page = match ctx.fetcher.fetch(&hit.url).await {
        Ok(page) => page,
        Err(e) => {
            tracing::info!(url = %hit.url, error = %e, "page rejected");
            let mut journal = ctx.journal.lock().await;
            journal.record_error("fetch", &format!("{}: {}", hit.url, e));
            return;
        }
    };

    let summary = match summarize(&ctx.llm, &user_query, &page.text).await {
        Ok(s) => s,
        Err(e) => {
            let mut journal = ctx.journal.lock().await;
            journal.record_error("summarize", &format!("{}: {}", hit.url, e));
            return;
        }
    };
    if summary.trim().to_uppercase().starts_with("NOT RELEVANT") {
        tracing::info!(url = %page.url, "page not relevant");
        return;
    }

    let items = match extract_items(&ctx.llm, &user_query, &page.text).await {
        Ok(items) => items,
        Err(e) => {
            let mut journal = ctx.journal.lock().await;
            journal.record_error("extract", &format!("{}: {}", hit.url, e));
            Vec::new()
        }
    };

    let title = page.title.clone().or(hit.title.clone());
    let draft = EvidenceDraft {
        query: search_query,
        source: SourceMeta::new(page.url.clone(), title),
        summary,
        items,
        raw_text: Some(page.text),
        tags: Vec::new(),
    };

    let outcome = {
        let mut bank = ctx.bank.lock().await;
        bank.add(draft)
    };
    match outcome {
        Ok(out) if out.fresh => {
            tracing::info!(evidence_id = %out.id, url = %page.url, "evidence added");
            let mut journal = ctx.journal.lock().await;
            if let Err(e) = journal.append(
                EventKind::EvidenceAdded,
                json!({ "evidence_id": &out.id, "url": &page.url }),
            ) {
                tracing::error!(error = %e, "failed to journal evidence_added");
            }
        }
        Ok(out) => {
            tracing::info!(evidence_id = %out.id, url = %page.url, "duplicate page, reusing evidence");
        }
        Err(e) => {
            let mut journal = ctx.journal.lock().await;
            journal.record_error("bank_add", &e.to_string());
        }
    }
}

/// 查询相关摘要；不相关时模型应答 NOT RELEVANT
async fn summarize(
    llm: &Arc<dyn LlmClient>,
    query: &str,
    text: &str,
) -> Result<String, crate::llm::LlmError> {
    let messages = [
        Message::system(
            "You summarize one web document for a research query. \
            If the document is irrelevant to the query, reply exactly NOT RELEVANT.",
        ),
        Message::user(format!(
            "Query: {}\n\nDocument:\n{}\n\nReturn a concise query-relevant summary (150-250 words).",
            query, text
        )),
    ];
    Ok(llm.complete(&messages).await?.trim().to_string())
}

/// 结构化证据抽取：{"items": [{type, content, location?, confidence?}]}
async fn extract_items(
    llm: &Arc<dyn LlmClient>,
    query: &str,
    text: &str,
) -> Result<Vec<EvidenceItem>, crate::llm::LlmError> {
    let messages = [
        Message::system(
            "You extract verifiable evidence items (quotes, data points, definitions, claims, cases) \
            from one document, for later citation.",
        ),
        Message::user(format!(
            "Query: {}\n\nDocument:\n{}\n\nExtract up to 8 evidence items. Return STRICT JSON: \
            {{\"items\": [{{\"type\": \"quote|data|definition|claim|case\", \"content\": string, \
            \"location\": string|null, \"confidence\": number|null}}]}}. No other text.",
            query, text
        )),
    ];
    let raw = llm.complete(&messages).await?;
    let items = extract_json_object(&raw)
        .and_then(|obj| obj.get("items").cloned())
        .and_then(|items| serde_json::from_value::<Vec<EvidenceItem>>(items).ok())
        .unwrap_or_default();
    Ok(items.into_iter().take(8).collect())
}

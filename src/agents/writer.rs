//! Writer 智能体：按节写作的 ReAct 循环
//!
//! 深度优先遍历 write_level 层的大纲节点；每节开一个全新上下文（不带之前
//! 章节的正文），候选证据 = 本节点及后代的引用并集。证据默认全报告只用一次，
//! 显式按 ID 重取时放行并打标。每节受 max_steps 与 max_chars 双预算约束，
//! 超限截断并强制封节。

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;

use crate::bank::Evidence;
use crate::core::{EngineError, RunContext, RunState};
use crate::journal::EventKind;
use crate::llm::{LlmClient as _, Message};
use crate::outline::{Outline, SectionView};
use crate::protocol::{extract_footnote_ids, parse_writer_action, WriterAction};

const WRITER_SYSTEM_PROMPT: &str = "\
You are the Writer of a deep-research system. You compose one report section at a time, \
grounded in retrieved evidence.

Each turn you must emit exactly ONE action:
1. <tool_call>{\"name\": \"retrieve\", \"arguments\": {\"query\": \"...\", \"top_k\": 8}}</tool_call> \
or {\"citation_ids\": [\"ev_0001\"]} - fetch full evidence content before writing.
2. <write>markdown for this section</write> - append prose to the section draft. \
Support factual claims with footnote references like [^ev_0001] using only retrieved ids.
3. <terminate>reason</terminate> - seal the section when it is complete.

Retrieve before you write. Keep the section focused on its heading; other sections \
are written separately.";

const OMITTED_BODY: &str = "<section omitted: no content generated>";
const NO_SOURCE_NOTE: &str = "no external source supports this section";

/// 单节产出
#[derive(Debug, Clone)]
pub struct SectionRecord {
    pub node_id: String,
    pub title: String,
    pub level: u8,
    pub body: String,
    pub used_ids: Vec<String>,
}

/// Writer 总结果；complete=false 表示有章节中途失败
#[derive(Debug)]
pub struct WriterOutcome {
    pub sections: Vec<SectionRecord>,
    /// 全报告首次使用顺序的证据 ID
    pub used_ids: Vec<String>,
    pub complete: bool,
}

pub struct Writer {
    ctx: Arc<RunContext>,
}

impl Writer {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx }
    }

    /// 写完整个大纲；prior 携带续跑时已写完的章节与已消费的证据 ID
    pub async fn run(
        &self,
        query: &str,
        outline: &Outline,
        prior: &RunState,
    ) -> Result<WriterOutcome, EngineError> {
        let cfg = self.ctx.config.writer.clone();
        let sections = outline.sections_at(cfg.write_level);
        let compact_map = outline.compact_map();

        let mut used_global: Vec<String> = prior.used_ids.clone();
        let mut used_set: HashSet<String> = used_global.iter().cloned().collect();
        let mut records: Vec<SectionRecord> = Vec::new();
        let mut complete = true;

        for section in &sections {
            if let Some(done) = prior.sections_written.get(&section.node_id) {
                // 续跑：该节已有 section_written 事件，不重写也不重发事件
                records.push(SectionRecord {
                    node_id: section.node_id.clone(),
                    title: section.title.clone(),
                    level: section.level,
                    body: done.body.clone(),
                    used_ids: done.used_ids.clone(),
                });
                continue;
            }
            if self.ctx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            match self
                .write_section(query, &compact_map, section, &mut used_global, &mut used_set)
                .await
            {
                Ok(record) => records.push(record),
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => {
                    // 单节失败不拖垮整个报告
                    tracing::error!(section = %section.node_id, error = %e, "section failed");
                    let mut journal = self.ctx.journal.lock().await;
                    journal.record_error("writer_section", &format!("{}: {}", section.node_id, e));
                    complete = false;
                }
            }
        }

        {
            let mut journal = self.ctx.journal.lock().await;
            journal.append(
                EventKind::WriterTerminated,
                json!({
                    "reason": if complete { "all_sections" } else { "partial" },
                    "sections": records.len(),
                }),
            )?;
        }

        Ok(WriterOutcome {
            sections: records,
            used_ids: used_global,
            complete,
        })
    }

    /// 单节循环：retrieve / write / terminate，步数与字符双预算
    async fn write_section(
        &self,
        query: &str,
        compact_map: &str,
        section: &SectionView,
        used_global: &mut Vec<String>,
        used_set: &mut HashSet<String>,
    ) -> Result<SectionRecord, EngineError> {
        let cfg = self.ctx.config.writer.clone();
        let candidate_summaries = {
            let bank = self.ctx.bank.lock().await;
            section
                .candidate_ids
                .iter()
                .filter_map(|id| bank.get(id).ok().map(|ev| {
                    let one_line: String = ev.summary.chars().take(160).collect();
                    format!("- {} | {} | {}", ev.id, ev.source.url, one_line)
                }))
                .collect::<Vec<_>>()
        };

        let mut draft = String::new();
        let mut tool_response: Option<String> = None;
        let mut seal_reason: Option<String> = None;

        'steps: for step in 0..cfg.max_steps_per_section {
            if self.ctx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            {
                let mut journal = self.ctx.journal.lock().await;
                journal.append(
                    EventKind::WriterStep,
                    json!({ "node_id": &section.node_id, "step": step + 1 }),
                )?;
            }

            let prompt = self.build_prompt(
                query,
                compact_map,
                section,
                &candidate_summaries,
                &draft,
                tool_response.take(),
            );
            let mut messages = vec![Message::system(WRITER_SYSTEM_PROMPT), Message::user(prompt)];

            // 动作解析的本步内重试
            let mut action = None;
            for _attempt in 0..=cfg.max_retries {
                let raw = self.ctx.llm.complete(&messages).await?;
                match parse_writer_action(&raw) {
                    Ok(a) => {
                        action = Some(a);
                        break;
                    }
                    Err(e) => {
                        let correction = e.correction();
                        {
                            let mut journal = self.ctx.journal.lock().await;
                            journal.record_error("writer_protocol", &correction);
                        }
                        messages.push(Message::assistant(raw));
                        messages.push(Message::user(correction));
                    }
                }
            }
            let Some(action) = action else {
                tracing::warn!(section = %section.node_id, "writer exhausted protocol retries");
                break 'steps;
            };

            match action {
                WriterAction::Retrieve { query: rq, top_k, citation_ids } => {
                    tool_response = Some(
                        self.handle_retrieve(section, rq, top_k, citation_ids, used_set)
                            .await?,
                    );
                }
                WriterAction::Write { markdown } => {
                    let piece = markdown.trim();
                    if !piece.is_empty() {
                        if !draft.is_empty() {
                            draft.push_str("\n\n");
                        }
                        draft.push_str(piece);
                    }
                    if draft.chars().count() > cfg.section_max_chars {
                        draft = draft.chars().take(cfg.section_max_chars).collect();
                        seal_reason = Some("char_limit".to_string());
                        break 'steps;
                    }
                }
                WriterAction::Terminate { reason } => {
                    seal_reason = Some(reason);
                    break 'steps;
                }
            }
        }

        if seal_reason.is_none() && !draft.is_empty() {
            seal_reason = Some("step_limit".to_string());
        }

        // 整节兜底：循环没产出任何正文时，一次性生成
        if draft.is_empty() {
            draft = self.fallback_generate(query, section).await;
            if draft.is_empty() {
                draft = OMITTED_BODY.to_string();
                let mut journal = self.ctx.journal.lock().await;
                journal.record_error(
                    "writer_fallback",
                    &format!("{}: no content generated", section.node_id),
                );
            }
            seal_reason.get_or_insert_with(|| "fallback".to_string());
        }

        let body = self.seal_body(section, draft).await;
        let used_ids = extract_footnote_ids(&body);
        for id in &used_ids {
            if used_set.insert(id.clone()) {
                used_global.push(id.clone());
            }
        }

        {
            let mut journal = self.ctx.journal.lock().await;
            journal.append(
                EventKind::SectionWritten,
                json!({
                    "node_id": &section.node_id,
                    "title": &section.title,
                    "level": section.level,
                    "chars": body.chars().count(),
                    "reason": seal_reason.unwrap_or_else(|| "terminated".to_string()),
                    "used_ids": &used_ids,
                    "body": &body,
                }),
            )?;
        }
        tracing::info!(section = %section.node_id, chars = body.chars().count(), "section written");

        Ok(SectionRecord {
            node_id: section.node_id.clone(),
            title: section.title.clone(),
            level: section.level,
            body,
            used_ids,
        })
    }

    /// 封节清理：去掉工具噪音与未入库的脚注引用，补零引用提示
    async fn seal_body(&self, section: &SectionView, draft: String) -> String {
        let mut body = clean_report_text(&draft);

        let bank = self.ctx.bank.lock().await;
        for id in extract_footnote_ids(&body) {
            if !bank.contains(&id) {
                tracing::warn!(section = %section.node_id, id = %id, "stripping footnote ref to unknown evidence");
                body = body.replace(&format!("[^{}]", id), "");
            }
        }
        drop(bank);

        if section.candidate_ids.is_empty() && !body.contains(NO_SOURCE_NOTE) && body != OMITTED_BODY {
            body.push_str(&format!("\n\n> {}", NO_SOURCE_NOTE));
        }
        body
    }

    /// Retrieve 动作：显式 ID 可越过一次性消费约束（打 reused 标记），
    /// 查询模式只在候选集内做词元检索且过滤已消费 ID
    async fn handle_retrieve(
        &self,
        section: &SectionView,
        query: Option<String>,
        top_k: Option<usize>,
        citation_ids: Vec<String>,
        used_set: &HashSet<String>,
    ) -> Result<String, EngineError> {
        let cfg = &self.ctx.config.writer;
        let top_k = top_k.unwrap_or(cfg.retrieve_top_k);

        let bank = self.ctx.bank.lock().await;
        let mut reused: Vec<String> = Vec::new();
        let selected: Vec<Evidence> = if !citation_ids.is_empty() {
            let mut out = Vec::new();
            for id in citation_ids.iter().take(top_k) {
                match bank.get(id) {
                    Ok(ev) => {
                        if used_set.contains(id) {
                            if !cfg.allow_reuse {
                                continue;
                            }
                            reused.push(id.clone());
                        }
                        out.push(ev.clone());
                    }
                    Err(_) => {
                        tracing::warn!(id = %id, "retrieve requested unknown evidence id");
                    }
                }
            }
            out
        } else {
            let q = query.unwrap_or_default();
            bank.retrieve_scored(&q, top_k * 2, Some(&section.candidate_ids))
                .into_iter()
                .map(|(ev, _score)| ev.clone())
                .filter(|ev| !used_set.contains(&ev.id))
                .take(top_k)
                .collect()
        };
        drop(bank);

        let pruned = prune_retrieved(
            selected,
            cfg.section_max_evidences,
            cfg.items_per_evidence,
            cfg.tool_response_max_chars,
        );
        let ids: Vec<String> = pruned.iter().map(|ev| ev.id.clone()).collect();

        {
            let mut journal = self.ctx.journal.lock().await;
            journal.append(
                EventKind::SectionRetrieved,
                json!({
                    "node_id": &section.node_id,
                    "evidence_ids": &ids,
                    "reused": &reused,
                }),
            )?;
        }

        if pruned.is_empty() {
            return Ok("<tool_response><material>NO_NEW_EVIDENCE</material></tool_response>".to_string());
        }
        Ok(format_tool_response(&pruned, cfg.items_per_evidence))
    }

    fn build_prompt(
        &self,
        query: &str,
        compact_map: &str,
        section: &SectionView,
        candidate_summaries: &[String],
        draft: &str,
        tool_response: Option<String>,
    ) -> String {
        let mut lines: Vec<String> = Vec::new();
        lines.push(format!("User Query: {}", query));
        lines.push(String::new());
        lines.push("Full report map (for context only, do not write other sections):".to_string());
        lines.push(compact_map.to_string());
        lines.push("Current section outline:".to_string());
        lines.push(section.block.clone());
        lines.push(String::new());

        lines.push("Candidate evidence (id, url, one-line summary):".to_string());
        if candidate_summaries.is_empty() {
            lines.push("<none: no evidence is cited for this section>".to_string());
        } else {
            lines.extend(candidate_summaries.iter().cloned());
        }
        lines.push(String::new());

        lines.push("Current draft of this section (may be empty):".to_string());
        lines.push(if draft.is_empty() { "<empty>".to_string() } else { draft.to_string() });
        lines.push(String::new());

        if let Some(resp) = tool_response {
            lines.push("Latest <tool_response>:".to_string());
            lines.push(resp);
            lines.push(String::new());
        }
        lines.push("Decide your single next action.".to_string());
        lines.join("\n")
    }

    /// 循环零产出时的一次性兜底生成
    async fn fallback_generate(&self, query: &str, section: &SectionView) -> String {
        let evidence_block = {
            let bank = self.ctx.bank.lock().await;
            match bank.bulk_get(&section.candidate_ids) {
                Ok(evs) => {
                    let owned: Vec<Evidence> = evs.into_iter().cloned().collect();
                    format_evidence_block(&owned, self.ctx.config.writer.items_per_evidence)
                }
                Err(_) => "<no evidence cited>".to_string(),
            }
        };
        let messages = [
            Message::system(WRITER_SYSTEM_PROMPT),
            Message::user(format!(
                "User Query: {}\n\nSection Title: {}\n\nOutline Notes:\n{}\n\nEvidence (citeable):\n{}\n\n\
                Write this entire section in one turn as markdown, factual claims supported by \
                [^ev_NNNN] footnotes. Output only the section body, no action tags.",
                query, section.title, section.block, evidence_block
            )),
        ];
        match self.ctx.llm.complete(&messages).await {
            Ok(raw) => {
                // 模型偶尔仍会套 <write> 标签，剥掉
                let raw = raw.trim();
                match parse_writer_action(raw) {
                    Ok(WriterAction::Write { markdown }) => markdown,
                    _ => raw.to_string(),
                }
            }
            Err(e) => {
                tracing::error!(section = %section.node_id, error = %e, "fallback generation failed");
                String::new()
            }
        }
    }
}

/// 裁剪检索结果：逐条限 items 数、跨条目去重内容、总字符预算
fn prune_retrieved(
    evidences: Vec<Evidence>,
    max_evidences: usize,
    items_per_evidence: usize,
    max_chars: usize,
) -> Vec<Evidence> {
    let mut out: Vec<Evidence> = Vec::new();
    let mut seen_item_text: HashSet<String> = HashSet::new();
    let mut budget = max_chars as i64;

    for mut ev in evidences.into_iter().take(max_evidences) {
        let mut kept = Vec::new();
        for item in ev.items.iter().take(items_per_evidence * 3) {
            let key = item.content.trim().to_lowercase();
            if key.is_empty() || !seen_item_text.insert(key) {
                continue;
            }
            kept.push(item.clone());
            if kept.len() >= items_per_evidence {
                break;
            }
        }
        let approx = ev.summary.chars().count() as i64
            + kept.iter().map(|it| it.content.chars().count() as i64).sum::<i64>()
            + 200;
        if budget - approx <= 0 {
            break;
        }
        budget -= approx;
        ev.items = kept;
        out.push(ev);
    }
    out
}

/// 检索结果的 tool_response 物料块
fn format_tool_response(evidences: &[Evidence], max_items: usize) -> String {
    let mut parts = vec!["<tool_response>".to_string(), "<material>".to_string()];
    for ev in evidences {
        parts.push(format!("<{}>", ev.id));
        parts.push(format!("Summary: {}", ev.summary));
        for item in ev.items.iter().take(max_items) {
            parts.push(format!("- {}: {}", item.kind.as_str(), item.content));
        }
        parts.push(format!("URL: {}", ev.source.url));
        parts.push(format!("</{}>", ev.id));
    }
    parts.push("</material>".to_string());
    parts.push("</tool_response>".to_string());
    parts.join("\n")
}

/// 兜底生成的证据上下文
fn format_evidence_block(evidences: &[Evidence], max_items: usize) -> String {
    if evidences.is_empty() {
        return "<no evidence cited>".to_string();
    }
    let mut blocks: Vec<String> = Vec::new();
    for ev in evidences {
        blocks.push(format!(
            "[{}] {} | {}",
            ev.id,
            ev.source.title.as_deref().unwrap_or(""),
            ev.source.url
        ));
        blocks.push(format!("Summary: {}", ev.summary));
        for item in ev.items.iter().take(max_items) {
            blocks.push(format!("- {}: {}", item.kind.as_str(), item.content));
        }
        blocks.push(String::new());
    }
    blocks.join("\n").trim().to_string()
}

/// 清理泄漏进正文的工具噪音：裸 retrieve 行与纯 JSON 行
pub fn clean_report_text(text: &str) -> String {
    let mut cleaned: Vec<&str> = Vec::new();
    for line in text.lines() {
        let stripped = line.trim();
        if stripped.eq_ignore_ascii_case("retrieve") {
            continue;
        }
        if stripped.starts_with('{')
            && stripped.ends_with('}')
            && serde_json::from_str::<serde_json::Value>(stripped).is_ok()
        {
            continue;
        }
        cleaned.push(line);
    }
    cleaned.join("\n").trim().to_string()
}

/// 渲染 References 节：首次使用顺序，`[^id]: 标题 — 出版方 (日期). URL`
pub fn render_references(used_ids: &[String], evidences: &[(String, Evidence)]) -> String {
    let by_id: std::collections::HashMap<&str, &Evidence> =
        evidences.iter().map(|(id, ev)| (id.as_str(), ev)).collect();
    let mut lines = vec!["## References".to_string()];
    for id in used_ids {
        let Some(ev) = by_id.get(id.as_str()) else { continue };
        let title = ev.source.title.as_deref().unwrap_or("Untitled");
        let mut entry = format!("[^{}]: {}", id, title);
        if let Some(publisher) = &ev.source.publisher {
            entry.push_str(&format!(" — {}", publisher));
        }
        if let Some(date) = &ev.source.published_at {
            entry.push_str(&format!(" ({})", date));
        }
        entry.push_str(&format!(". {}", ev.source.url));
        lines.push(entry);
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::{EvidenceItem, EvidenceKind, SourceMeta};

    fn evidence(id: &str, summary: &str) -> Evidence {
        Evidence {
            id: id.to_string(),
            query: "q".into(),
            source: SourceMeta::new(format!("https://{}.example", id), Some(format!("Title {}", id))),
            summary: summary.to_string(),
            items: vec![
                EvidenceItem {
                    kind: EvidenceKind::Data,
                    content: format!("datum for {}", id),
                    location: None,
                    confidence: Some(0.7),
                },
                EvidenceItem {
                    kind: EvidenceKind::Quote,
                    content: "shared duplicate line".into(),
                    location: None,
                    confidence: None,
                },
            ],
            raw_ref: None,
            hash: None,
            tags: vec![],
        }
    }

    #[test]
    fn test_prune_dedups_items_across_evidences() {
        let pruned = prune_retrieved(
            vec![evidence("ev_0001", "s1"), evidence("ev_0002", "s2")],
            10,
            8,
            100_000,
        );
        assert_eq!(pruned.len(), 2);
        assert_eq!(pruned[0].items.len(), 2);
        // 第二条证据中的重复内容被跨条目去重
        assert_eq!(pruned[1].items.len(), 1);
    }

    #[test]
    fn test_prune_respects_char_budget() {
        let evs: Vec<Evidence> = (1..=5)
            .map(|i| evidence(&format!("ev_000{}", i), &"x".repeat(400)))
            .collect();
        let pruned = prune_retrieved(evs, 10, 8, 1_400);
        assert!(pruned.len() < 5);
        assert!(!pruned.is_empty());
    }

    #[test]
    fn test_tool_response_wraps_each_evidence_in_id_tags() {
        let resp = format_tool_response(&[evidence("ev_0003", "summary text")], 8);
        assert!(resp.contains("<ev_0003>"));
        assert!(resp.contains("</ev_0003>"));
        assert!(resp.contains("Summary: summary text"));
        assert!(resp.starts_with("<tool_response>"));
    }

    #[test]
    fn test_clean_report_text_strips_tool_noise() {
        let text = "Good paragraph.\nretrieve\n{\"name\": \"retrieve\"}\nAnother paragraph.";
        let cleaned = clean_report_text(text);
        assert!(cleaned.contains("Good paragraph."));
        assert!(cleaned.contains("Another paragraph."));
        assert!(!cleaned.contains("retrieve\n"));
        assert!(!cleaned.contains("{\"name\""));
    }

    #[test]
    fn test_render_references_first_use_order_with_metadata() {
        let mut ev = evidence("ev_0002", "s");
        ev.source.publisher = Some("Example Press".into());
        ev.source.published_at = Some("2024-11-02".into());
        let evidences = vec![
            ("ev_0002".to_string(), ev),
            ("ev_0001".to_string(), evidence("ev_0001", "s")),
        ];
        let refs = render_references(&["ev_0002".to_string(), "ev_0001".to_string()], &evidences);
        let lines: Vec<&str> = refs.lines().collect();
        assert_eq!(lines[0], "## References");
        assert!(lines[1].starts_with("[^ev_0002]: Title ev_0002 — Example Press (2024-11-02)."));
        assert!(lines[2].starts_with("[^ev_0001]: Title ev_0001."));
    }
}

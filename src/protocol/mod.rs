//! 智能体动作协议：标签语法的解析与序列化
//!
//! 每轮回复必须恰好包含一个顶层动作标签；同时出现多个时按字节位置取最先出现的
//! 有效标签。标签外的自由文本一律丢弃。解析失败返回 ProtocolError，
//! 由调用方作为下一轮 observation 返还给智能体自我纠正。
//!
//! 语法（大小写敏感，互不嵌套）：
//! - `<tool_call>{"name": ..., "arguments": {...}}</tool_call>`
//! - `<write_outline>Markdown + <citation>id,id</citation></write_outline>`（仅 Planner）
//! - `<write>Markdown + [^ev_NNNN]</write>`（仅 Writer）
//! - `<terminate>reason</terminate>`

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Planner 可发出的动作
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerAction {
    Search { queries: Vec<String>, goal: String },
    WriteOutline { text: String },
    Terminate { reason: String },
}

/// Writer 可发出的动作
#[derive(Debug, Clone, PartialEq)]
pub enum WriterAction {
    Retrieve {
        query: Option<String>,
        top_k: Option<usize>,
        citation_ids: Vec<String>,
    },
    Write { markdown: String },
    Terminate { reason: String },
}

/// 协议错误；correction() 生成返还给智能体的纠正提示
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("no action tag found in output")]
    NoAction,

    #[error("tool_call JSON malformed: {0}")]
    BadJson(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("search action carried no usable queries")]
    EmptyQueries,

    #[error("unresolved citation ids: {0:?}")]
    UnresolvedCitation(Vec<String>),
}

impl ProtocolError {
    /// 面向 LLM 的下一轮纠正 observation
    pub fn correction(&self) -> String {
        match self {
            ProtocolError::NoAction => "Your previous output contained no valid action tag. \
                Emit exactly one of: <tool_call>{\"name\": ..., \"arguments\": {...}}</tool_call>, \
                <write_outline>...</write_outline>, <write>...</write>, or <terminate>reason</terminate>."
                .to_string(),
            ProtocolError::BadJson(detail) => format!(
                "Your <tool_call> payload was not valid JSON ({}). \
                Emit a single JSON object: {{\"name\": \"...\", \"arguments\": {{...}}}}.",
                detail
            ),
            ProtocolError::UnknownTool(name) => format!(
                "Tool '{}' does not exist. Planner may only call 'search'; Writer may only call 'retrieve'.",
                name
            ),
            ProtocolError::EmptyQueries => "Your search action carried no usable queries. \
                Provide arguments.query as a non-empty string or list of strings."
                .to_string(),
            ProtocolError::UnresolvedCitation(ids) => format!(
                "The outline references evidence ids that do not exist in the bank: {}. \
                Only cite ids listed in the evidence summaries.",
                ids.join(", ")
            ),
        }
    }
}

fn citation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<citation>([^<]*)</citation>").expect("citation regex"))
}

fn footnote_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\^(ev_\d{4})\]").expect("footnote regex"))
}

/// 从文本中提取 `<citation>id,id</citation>` 的全部 ID（保序去重）
pub fn extract_citation_ids(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for caps in citation_re().captures_iter(text) {
        for part in caps[1].split(',') {
            let id = part.trim();
            if !id.is_empty() && seen.insert(id.to_string()) {
                out.push(id.to_string());
            }
        }
    }
    out
}

/// 去除 citation 标签，保留正文
pub fn strip_citation_tags(text: &str) -> String {
    citation_re().replace_all(text, "").trim_end().to_string()
}

/// 提取正文中的 `[^ev_NNNN]` 脚注引用（保序去重）
pub fn extract_footnote_ids(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for caps in footnote_re().captures_iter(text) {
        let id = caps[1].to_string();
        if seen.insert(id.clone()) {
            out.push(id);
        }
    }
    out
}

/// 在文本中定位第一个完整的 `<tag>...</tag>` 区块，返回 (起始偏移, 内部内容)
fn find_tag_block<'a>(text: &'a str, tag: &str) -> Option<(usize, &'a str)> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = text.find(&open)?;
    let body_start = start + open.len();
    let end = text[body_start..].find(&close)? + body_start;
    Some((start, &text[body_start..end]))
}

/// 从文本中尽可能提取一个 JSON 对象（```json 围栏 / 整体 / 内嵌片段）
pub fn extract_json_object(text: &str) -> Option<Value> {
    let cleaned = text.trim();

    if let Some(fence_start) = cleaned.find("```") {
        let rest = &cleaned[fence_start + 3..];
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        if let Some(fence_end) = rest.find("```") {
            let inner = rest[..fence_end].trim();
            if inner.starts_with('{') {
                if let Ok(v) = serde_json::from_str(inner) {
                    return Some(v);
                }
            }
        }
    }

    if cleaned.starts_with('{') && cleaned.ends_with('}') {
        if let Ok(v) = serde_json::from_str(cleaned) {
            return Some(v);
        }
    }

    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end > start {
        serde_json::from_str(&cleaned[start..=end]).ok()
    } else {
        None
    }
}

/// 动作标签的中间表示：最先出现的有效顶层标签
enum RawAction<'a> {
    ToolCall(&'a str),
    WriteOutline(&'a str),
    Write(&'a str),
    Terminate(&'a str),
}

/// 找到位置最靠前的顶层标签；tags 列出该智能体的合法标签名
fn first_tag<'a>(text: &'a str, tags: &[&str]) -> Option<RawAction<'a>> {
    let mut best: Option<(usize, RawAction<'a>)> = None;
    for &tag in tags {
        if let Some((pos, body)) = find_tag_block(text, tag) {
            let raw = match tag {
                "tool_call" => RawAction::ToolCall(body),
                "write_outline" => RawAction::WriteOutline(body),
                "write" => RawAction::Write(body),
                "terminate" => RawAction::Terminate(body),
                _ => continue,
            };
            if best.as_ref().map(|(p, _)| pos < *p).unwrap_or(true) {
                best = Some((pos, raw));
            }
        }
    }
    best.map(|(_, raw)| raw)
}

fn parse_tool_call(body: &str) -> Result<(String, Value), ProtocolError> {
    let obj = extract_json_object(body)
        .ok_or_else(|| ProtocolError::BadJson("no JSON object found".to_string()))?;
    let name = obj
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProtocolError::BadJson("missing 'name'".to_string()))?
        .to_string();
    let arguments = obj.get("arguments").cloned().unwrap_or(Value::Null);
    Ok((name, arguments))
}

/// 解析 Planner 输出为一个动作
pub fn parse_planner_action(raw: &str) -> Result<PlannerAction, ProtocolError> {
    // <write> 标签不在 Planner 的语法内，出现时按无动作处理
    match first_tag(raw, &["tool_call", "write_outline", "terminate"]) {
        Some(RawAction::WriteOutline(body)) => Ok(PlannerAction::WriteOutline {
            text: body.trim().to_string(),
        }),
        Some(RawAction::Terminate(body)) => {
            let reason = body.trim();
            Ok(PlannerAction::Terminate {
                reason: if reason.is_empty() { "terminated".to_string() } else { reason.to_string() },
            })
        }
        Some(RawAction::ToolCall(body)) => {
            let (name, args) = parse_tool_call(body)?;
            if name != "search" {
                return Err(ProtocolError::UnknownTool(name));
            }
            let queries = match args.get("query") {
                Some(Value::String(s)) => vec![s.clone()],
                Some(Value::Array(arr)) => arr
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect(),
                _ => Vec::new(),
            };
            let queries: Vec<String> = queries
                .into_iter()
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty())
                .collect();
            if queries.is_empty() {
                return Err(ProtocolError::EmptyQueries);
            }
            let goal = args
                .get("goal")
                .and_then(|v| v.as_str())
                .unwrap_or("collect evidence")
                .to_string();
            Ok(PlannerAction::Search { queries, goal })
        }
        Some(RawAction::Write(_)) | None => Err(ProtocolError::NoAction),
    }
}

/// 解析 Writer 输出为一个动作
pub fn parse_writer_action(raw: &str) -> Result<WriterAction, ProtocolError> {
    match first_tag(raw, &["tool_call", "write", "terminate"]) {
        Some(RawAction::Write(body)) => Ok(WriterAction::Write {
            markdown: body.trim().to_string(),
        }),
        Some(RawAction::Terminate(body)) => {
            let reason = body.trim();
            Ok(WriterAction::Terminate {
                reason: if reason.is_empty() { "terminated".to_string() } else { reason.to_string() },
            })
        }
        Some(RawAction::ToolCall(body)) => {
            let (name, args) = parse_tool_call(body)?;
            if name != "retrieve" {
                return Err(ProtocolError::UnknownTool(name));
            }
            let query = args.get("query").and_then(|v| v.as_str()).map(String::from);
            let top_k = args
                .get("top_k")
                .and_then(|v| v.as_u64())
                .map(|n| n as usize);
            let citation_ids: Vec<String> = match args.get("citation_ids") {
                Some(Value::Array(arr)) => arr
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect(),
                Some(Value::String(s)) => vec![s.clone()],
                _ => Vec::new(),
            };
            Ok(WriterAction::Retrieve { query, top_k, citation_ids })
        }
        Some(RawAction::WriteOutline(_)) | None => Err(ProtocolError::NoAction),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planner_search_with_query_list() {
        let raw = r#"I will search now.
<tool_call>{"name": "search", "arguments": {"query": ["rust async", " tokio "], "goal": "runtime basics"}}</tool_call>"#;
        let action = parse_planner_action(raw).unwrap();
        assert_eq!(
            action,
            PlannerAction::Search {
                queries: vec!["rust async".into(), "tokio".into()],
                goal: "runtime basics".into(),
            }
        );
    }

    #[test]
    fn test_planner_first_tag_wins_by_position() {
        // terminate 在前即生效，即使后面还有 write_outline
        let raw = "<terminate>done</terminate>\n<write_outline># x</write_outline>";
        assert_eq!(
            parse_planner_action(raw).unwrap(),
            PlannerAction::Terminate { reason: "done".into() }
        );

        let raw = "<write_outline># x</write_outline>\n<terminate>done</terminate>";
        assert!(matches!(
            parse_planner_action(raw).unwrap(),
            PlannerAction::WriteOutline { .. }
        ));
    }

    #[test]
    fn test_planner_rejects_bad_json_and_unknown_tool() {
        let raw = "<tool_call>not json at all</tool_call>";
        assert!(matches!(parse_planner_action(raw), Err(ProtocolError::BadJson(_))));

        let raw = r#"<tool_call>{"name": "shell", "arguments": {}}</tool_call>"#;
        assert!(matches!(
            parse_planner_action(raw),
            Err(ProtocolError::UnknownTool(_))
        ));

        let raw = r#"<tool_call>{"name": "search", "arguments": {"query": []}}</tool_call>"#;
        assert!(matches!(parse_planner_action(raw), Err(ProtocolError::EmptyQueries)));
    }

    #[test]
    fn test_planner_prose_only_is_no_action() {
        assert!(matches!(
            parse_planner_action("just some thinking, no tags"),
            Err(ProtocolError::NoAction)
        ));
        // Writer 专属标签对 Planner 无效
        assert!(matches!(
            parse_planner_action("<write>body</write>"),
            Err(ProtocolError::NoAction)
        ));
    }

    #[test]
    fn test_writer_retrieve_variants() {
        let raw = r#"<tool_call>{"name": "retrieve", "arguments": {"citation_ids": ["ev_0001", "ev_0002"]}}</tool_call>"#;
        let action = parse_writer_action(raw).unwrap();
        assert_eq!(
            action,
            WriterAction::Retrieve {
                query: None,
                top_k: None,
                citation_ids: vec!["ev_0001".into(), "ev_0002".into()],
            }
        );

        let raw = r#"<tool_call>{"name": "retrieve", "arguments": {"query": "background", "top_k": 5}}</tool_call>"#;
        let action = parse_writer_action(raw).unwrap();
        assert_eq!(
            action,
            WriterAction::Retrieve {
                query: Some("background".into()),
                top_k: Some(5),
                citation_ids: vec![],
            }
        );
    }

    #[test]
    fn test_writer_write_and_terminate() {
        let action = parse_writer_action("<write>## Section\n\nBody [^ev_0001].</write>").unwrap();
        assert!(matches!(action, WriterAction::Write { .. }));

        let action = parse_writer_action("<terminate></terminate>").unwrap();
        assert_eq!(action, WriterAction::Terminate { reason: "terminated".into() });
    }

    #[test]
    fn test_extract_json_from_fence() {
        let raw = "prefix\n```json\n{\"name\": \"search\", \"arguments\": {}}\n```\nsuffix";
        let obj = extract_json_object(raw).unwrap();
        assert_eq!(obj["name"], "search");
    }

    #[test]
    fn test_citation_extraction_keeps_order_and_dedups() {
        let text = "## A <citation>ev_0002,ev_0001</citation>\n- b <citation>ev_0001, ev_0003</citation>";
        assert_eq!(
            extract_citation_ids(text),
            vec!["ev_0002", "ev_0001", "ev_0003"]
        );
        assert!(!strip_citation_tags(text).contains("<citation>"));
    }

    #[test]
    fn test_footnote_extraction() {
        let body = "Claim one.[^ev_0001] Claim two.[^ev_0003] Repeat.[^ev_0001]";
        assert_eq!(extract_footnote_ids(body), vec!["ev_0001", "ev_0003"]);
    }

    #[test]
    fn test_correction_messages_name_the_problem() {
        assert!(ProtocolError::NoAction.correction().contains("<terminate>"));
        assert!(ProtocolError::UnresolvedCitation(vec!["ev_9999".into()])
            .correction()
            .contains("ev_9999"));
    }
}

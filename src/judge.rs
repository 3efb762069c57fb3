//! 大纲质量评审（外部协作者，尽力而为）
//!
//! 对固定标准集逐项调用 LLM 打分（0-10 + 理由）；任一标准解析失败仅跳过该项，
//! 整体失败写入 {"error": ...}，绝不影响运行结果。

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::llm::{LlmClient, Message};
use crate::protocol::extract_json_object;

/// 固定评审标准集
const CRITERIA: &[(&str, &str)] = &[
    ("InstructionFollowing", "Does the outline directly address the user's query and respect its constraints?"),
    ("Depth", "Does the outline go beyond surface-level enumeration into mechanisms, trade-offs and analysis?"),
    ("Balance", "Are the sections proportioned sensibly, with no single aspect dominating or missing?"),
    ("Breadth", "Does the outline cover the major perspectives and subtopics a thorough report would need?"),
    ("Support", "Are claims and sections grounded in cited evidence rather than speculation?"),
    ("Insightfulness", "Does the outline promise non-obvious synthesis rather than a list of facts?"),
];

/// 单项评审结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionResult {
    pub rating: u8,
    pub justification: String,
}

/// 整体评审结果（outline_judgement.json 的内容）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JudgeReport {
    pub results: BTreeMap<String, CriterionResult>,
}

/// 大纲评审器
pub struct OutlineJudge {
    llm: Arc<dyn LlmClient>,
}

impl OutlineJudge {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn judge(&self, query: &str, outline_markdown: &str) -> JudgeReport {
        let mut report = JudgeReport::default();
        for (name, description) in CRITERIA {
            let prompt = format!(
                "You are a strict evaluator of research outlines.\n\n\
                Criterion: {name}\n{description}\n\n\
                Research question:\n{query}\n\n\
                Outline:\n{outline_markdown}\n\n\
                Rate the outline on this criterion from 0 to 10. \
                Return STRICT JSON: {{\"rating\": int, \"justification\": string}}. No other text."
            );
            let messages = [Message::system("You are a strict evaluator."), Message::user(prompt)];
            let raw = match self.llm.complete(&messages).await {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(criterion = name, error = %e, "outline judge call failed");
                    continue;
                }
            };
            match Self::parse_item(&raw) {
                Some(item) => {
                    tracing::info!(criterion = name, rating = item.rating, "outline judged");
                    report.results.insert((*name).to_string(), item);
                }
                None => {
                    tracing::warn!(criterion = name, "outline judge parse failed");
                }
            }
        }
        report
    }

    fn parse_item(raw: &str) -> Option<CriterionResult> {
        let obj = extract_json_object(raw)?;
        let rating = obj.get("rating")?.as_u64()?.min(10) as u8;
        let justification = obj
            .get("justification")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Some(CriterionResult { rating, justification })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    #[tokio::test]
    async fn test_judge_collects_all_criteria() {
        let responses: Vec<String> = (0..CRITERIA.len())
            .map(|i| format!("{{\"rating\": {}, \"justification\": \"ok\"}}", i + 3))
            .collect();
        let judge = OutlineJudge::new(Arc::new(ScriptedLlmClient::new(responses)));
        let report = judge.judge("q", "# Outline").await;
        assert_eq!(report.results.len(), CRITERIA.len());
        assert!(report.results.contains_key("Depth"));
    }

    #[tokio::test]
    async fn test_judge_skips_unparseable_items() {
        let mut responses = vec!["not json".to_string()];
        responses.extend(
            (1..CRITERIA.len()).map(|_| "{\"rating\": 7, \"justification\": \"fine\"}".to_string()),
        );
        let judge = OutlineJudge::new(Arc::new(ScriptedLlmClient::new(responses)));
        let report = judge.judge("q", "# Outline").await;
        assert_eq!(report.results.len(), CRITERIA.len() - 1);
    }

    #[test]
    fn test_parse_item_clamps_rating() {
        let item = OutlineJudge::parse_item("{\"rating\": 99, \"justification\": \"x\"}").unwrap();
        assert_eq!(item.rating, 10);
    }
}

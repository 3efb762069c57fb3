//! 证据记录模型
//!
//! Evidence 一经写入不可变；summary / items 均派生自 raw 正文。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 证据来源元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMeta {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// 原文发表时间（如可得），ISO8601 字符串
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
    pub retrieved_at: DateTime<Utc>,
}

impl SourceMeta {
    pub fn new(url: impl Into<String>, title: Option<String>) -> Self {
        Self {
            url: url.into(),
            title,
            publisher: None,
            author: None,
            published_at: None,
            retrieved_at: Utc::now(),
        }
    }
}

/// 可核验的证据单元类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceKind {
    Quote,
    Data,
    Definition,
    Claim,
    Case,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceKind::Quote => "quote",
            EvidenceKind::Data => "data",
            EvidenceKind::Definition => "definition",
            EvidenceKind::Claim => "claim",
            EvidenceKind::Case => "case",
        }
    }
}

/// 从来源正文中抽取出的单条证据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    #[serde(rename = "type")]
    pub kind: EvidenceKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// 0.0 ~ 1.0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// 入库前的证据草稿；id / hash / raw_ref 由 EvidenceBank 填充
#[derive(Debug, Clone)]
pub struct EvidenceDraft {
    pub query: String,
    pub source: SourceMeta,
    pub summary: String,
    pub items: Vec<EvidenceItem>,
    pub raw_text: Option<String>,
    pub tags: Vec<String>,
}

/// 库内证据记录（evidence.jsonl 的一行）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub id: String,
    pub query: String,
    pub source: SourceMeta,
    pub summary: String,
    #[serde(default)]
    pub items: Vec<EvidenceItem>,
    /// raw/<hash>.txt 相对路径；正文永不内联
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Evidence {
    /// 来源域名（统计用）
    pub fn domain(&self) -> Option<String> {
        let url = self.source.url.trim();
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))?;
        let host = rest.split('/').next()?.split(':').next()?;
        Some(host.to_lowercase())
    }
}

/// 数字计数 -> `ev_0001` 形式的证据 ID
pub fn format_evidence_id(n: u64) -> String {
    format!("ev_{:04}", n)
}

/// `ev_0001` -> 1；非法格式返回 None
pub fn parse_evidence_id(id: &str) -> Option<u64> {
    id.strip_prefix("ev_")?.parse().ok()
}

//! 证据库存储：追加式 JSONL + 内容哈希去重
//!
//! 写入顺序保证崩溃安全：先写 raw 侧文件，再追加 JSONL 行并 fsync，
//! 最后才推进内存计数器；崩溃最多留下一条截断的尾行，重放时丢弃。
//! 重启后计数器取 max(现存 ID) + 1，ID 稠密单调、永不复用。

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::bank::evidence::{format_evidence_id, parse_evidence_id, Evidence, EvidenceDraft};

#[derive(Error, Debug)]
pub enum BankError {
    #[error("evidence bank io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("evidence {id} not found")]
    MissingEvidence { id: String },

    #[error("evidence record malformed: {0}")]
    Corrupt(String),
}

/// add 的结果：写入或去重命中
#[derive(Debug, Clone)]
pub struct AddOutcome {
    pub id: String,
    /// true 表示本次调用实际新增了记录
    pub fresh: bool,
}

/// 基本统计
#[derive(Debug, Clone, serde::Serialize)]
pub struct BankStats {
    pub count: usize,
    pub total_summary_chars: usize,
    pub distinct_domains: usize,
}

/// 证据库：内存索引 + 磁盘 JSONL
pub struct EvidenceBank {
    root: PathBuf,
    evidences: Vec<Evidence>,
    index: HashMap<String, usize>,
    hash_to_id: HashMap<String, String>,
    next_id: u64,
}

impl EvidenceBank {
    /// 打开或创建 root 下的证据库；已有 evidence.jsonl 时重建索引
    pub fn open(root: impl AsRef<Path>) -> Result<Self, BankError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("raw"))?;

        let mut bank = Self {
            root,
            evidences: Vec::new(),
            index: HashMap::new(),
            hash_to_id: HashMap::new(),
            next_id: 1,
        };
        bank.load_existing()?;
        Ok(bank)
    }

    fn jsonl_path(&self) -> PathBuf {
        self.root.join("evidence.jsonl")
    }

    fn load_existing(&mut self) -> Result<(), BankError> {
        let path = self.jsonl_path();
        if !path.exists() {
            return Ok(());
        }
        let data = std::fs::read_to_string(&path)?;
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let ev: Evidence = match serde_json::from_str(line) {
                Ok(ev) => ev,
                Err(e) => {
                    // 崩溃可能留下一条截断尾行，丢弃并继续
                    tracing::warn!(error = %e, "discarding corrupt evidence line");
                    continue;
                }
            };
            if let Some(n) = parse_evidence_id(&ev.id) {
                self.next_id = self.next_id.max(n + 1);
            }
            if let Some(h) = ev.hash.clone() {
                self.hash_to_id.insert(h, ev.id.clone());
            }
            self.index.insert(ev.id.clone(), self.evidences.len());
            self.evidences.push(ev);
        }
        tracing::info!(count = self.evidences.len(), "evidence bank loaded");
        Ok(())
    }

    /// 新增一条证据；同内容（normalized url + body 哈希）已存在时返回既有 ID
    pub fn add(&mut self, draft: EvidenceDraft) -> Result<AddOutcome, BankError> {
        let mut hash = None;
        if let Some(ref raw) = draft.raw_text {
            let h = content_hash(&draft.source.url, raw);
            if let Some(existing) = self.hash_to_id.get(&h) {
                return Ok(AddOutcome {
                    id: existing.clone(),
                    fresh: false,
                });
            }
            hash = Some(h);
        }

        let id = format_evidence_id(self.next_id);
        let mut raw_ref = None;
        if let (Some(ref h), Some(ref raw)) = (&hash, &draft.raw_text) {
            let rel = format!("raw/{}.txt", h);
            std::fs::write(self.root.join(&rel), raw)?;
            raw_ref = Some(rel);
        }

        let ev = Evidence {
            id: id.clone(),
            query: draft.query,
            source: draft.source,
            summary: draft.summary,
            items: draft.items,
            raw_ref,
            hash: hash.clone(),
            tags: draft.tags,
        };

        // 先落盘再推进计数器
        self.append_jsonl(&ev)?;
        self.next_id += 1;

        if let Some(h) = hash {
            self.hash_to_id.insert(h, id.clone());
        }
        self.index.insert(id.clone(), self.evidences.len());
        self.evidences.push(ev);

        Ok(AddOutcome { id, fresh: true })
    }

    fn append_jsonl(&self, ev: &Evidence) -> Result<(), BankError> {
        let line = serde_json::to_string(ev).map_err(|e| BankError::Corrupt(e.to_string()))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.jsonl_path())?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_data()?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<&Evidence, BankError> {
        self.index
            .get(id)
            .map(|&i| &self.evidences[i])
            .ok_or_else(|| BankError::MissingEvidence { id: id.to_string() })
    }

    /// 按输入顺序取回；任一 ID 缺失即返回 MissingEvidence
    pub fn bulk_get(&self, ids: &[String]) -> Result<Vec<&Evidence>, BankError> {
        ids.iter().map(|id| self.get(id)).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.evidences.len()
    }

    pub fn list_all(&self) -> &[Evidence] {
        &self.evidences
    }

    /// (id, url, summary) 三元组；ids 为 None 时取全库。Planner 提示词只用它，不含原文
    pub fn summaries(&self, ids: Option<&[String]>) -> Vec<(String, String, String)> {
        match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.index.get(id).map(|&i| &self.evidences[i]))
                .map(|ev| (ev.id.clone(), ev.source.url.clone(), ev.summary.clone()))
                .collect(),
            None => self
                .evidences
                .iter()
                .map(|ev| (ev.id.clone(), ev.source.url.clone(), ev.summary.clone()))
                .collect(),
        }
    }

    pub fn stats(&self) -> BankStats {
        let mut domains = std::collections::HashSet::new();
        for ev in &self.evidences {
            if let Some(d) = ev.domain() {
                domains.insert(d);
            }
        }
        BankStats {
            count: self.evidences.len(),
            total_summary_chars: self.evidences.iter().map(|e| e.summary.chars().count()).sum(),
            distinct_domains: domains.len(),
        }
    }

    /// 词元重叠打分检索；candidate_ids 限定候选集（Writer 的按节约束）
    pub fn retrieve_scored(
        &self,
        query: &str,
        top_k: usize,
        candidate_ids: Option<&[String]>,
    ) -> Vec<(&Evidence, usize)> {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Vec::new();
        }

        let candidates: Vec<&Evidence> = match candidate_ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.index.get(id).map(|&i| &self.evidences[i]))
                .collect(),
            None => self.evidences.iter().collect(),
        };

        let mut scored: Vec<(usize, &Evidence)> = Vec::new();
        for ev in candidates {
            let hay = format!(
                "{} {} {} {} {}",
                ev.query,
                ev.source.title.as_deref().unwrap_or(""),
                ev.source.publisher.as_deref().unwrap_or(""),
                ev.summary,
                ev.items.iter().map(|it| it.content.as_str()).collect::<Vec<_>>().join(" "),
            )
            .to_lowercase();
            let score = tokens.iter().filter(|t| hay.contains(t.as_str())).count();
            if score > 0 {
                scored.push((score, ev));
            }
        }

        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().take(top_k).map(|(s, ev)| (ev, s)).collect()
    }
}

/// sha256(normalized url + "\n" + trimmed body)
fn content_hash(url: &str, text: &str) -> String {
    let mut h = Sha256::new();
    h.update(normalize_url(url).as_bytes());
    h.update(b"\n");
    h.update(text.trim().as_bytes());
    format!("{:x}", h.finalize())
}

/// 吸收常见的 URL 规范化差异：scheme、大小写、www. 前缀、fragment、结尾斜杠
fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    let rest = rest.split('#').next().unwrap_or(rest);
    let (host, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    let host = host.to_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    let path = path.trim_end_matches('/');
    format!("{}{}", host, path)
}

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9_一-鿿]+").expect("word regex"))
}

fn tokenize(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for m in word_re().find_iter(text) {
        let t = m.as_str().to_lowercase();
        if t.chars().count() >= 2 && seen.insert(t.clone()) {
            out.push(t);
        }
    }
    out
}

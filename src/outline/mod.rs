//! 大纲模型：类型化 AST 与 Markdown 外部形式的无损往返
//!
//! 外部形式是带 `<citation>` 标签的 Markdown（outline.md）；内存形式是
//! OutlineNode 树。节点 ID 按路径生成（sec_1_2_3），解析时校验层级
//! 不跳级，提交前校验全部引用可在证据库中解析。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bank::EvidenceBank;
use crate::protocol::{extract_citation_ids, strip_citation_tags, ProtocolError};

/// 大纲树节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlineNode {
    /// 路径式稳定 ID，如 sec_1_2_3
    pub id: String,
    pub title: String,
    /// 1..=6，对应 Markdown 标题层级
    pub level: u8,
    #[serde(default)]
    pub bullets: Vec<String>,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub children: Vec<OutlineNode>,
}

/// 大纲：根节点列表 + 提交版本号
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outline {
    pub nodes: Vec<OutlineNode>,
    pub version: u32,
}

/// Writer 消费的章节视图：目标节点 + 其子树的引用并集
#[derive(Debug, Clone)]
pub struct SectionView {
    pub node_id: String,
    pub title: String,
    pub level: u8,
    pub bullets: Vec<String>,
    /// 本节点及全部后代的引用（保序去重）
    pub candidate_ids: Vec<String>,
    /// 该子树渲染回的 Markdown，用于 Writer 提示词
    pub block: String,
}

#[derive(Error, Debug)]
pub enum OutlineError {
    #[error("outline has no headings")]
    NoHeadings,

    #[error("heading level skips from {from} to {to}: {title}")]
    LevelSkip { from: u8, to: u8, title: String },
}

/// 解析 `^#{1,6} ` 标题行，返回 (层级, 标题正文)
fn parse_heading(line: &str) -> Option<(u8, &str)> {
    let trimmed = line.trim_start();
    let hashes = trimmed.bytes().take_while(|&b| b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !rest.starts_with(' ') {
        return None;
    }
    Some((hashes as u8, rest.trim()))
}

impl Outline {
    /// 解析带 citation 标签的 Markdown 为 AST
    ///
    /// 规则：标题行建节点；`- ` 行与其它非空行作为当前节点的 bullet；
    /// 行内 `<citation>` 的 ID 归属当前节点；层级跳级即拒绝。
    pub fn parse(markdown: &str, version: u32) -> Result<Self, OutlineError> {
        struct Flat {
            level: u8,
            title: String,
            bullets: Vec<String>,
            citations: Vec<String>,
        }

        let mut flats: Vec<Flat> = Vec::new();
        let mut prev_level: Option<u8> = None;

        for line in markdown.lines() {
            let line = line.trim_end();
            if line.trim().is_empty() {
                continue;
            }
            if let Some((level, rest)) = parse_heading(line) {
                if let Some(prev) = prev_level {
                    if level > prev + 1 {
                        return Err(OutlineError::LevelSkip {
                            from: prev,
                            to: level,
                            title: strip_citation_tags(rest),
                        });
                    }
                }
                prev_level = Some(level);
                let citations = extract_citation_ids(rest);
                flats.push(Flat {
                    level,
                    title: strip_citation_tags(rest).trim().to_string(),
                    bullets: Vec::new(),
                    citations,
                });
            } else {
                let Some(current) = flats.last_mut() else {
                    // 首个标题之前的游离文本丢弃
                    continue;
                };
                let text = line.trim().trim_start_matches("- ").trim_start_matches("* ");
                for id in extract_citation_ids(text) {
                    if !current.citations.contains(&id) {
                        current.citations.push(id);
                    }
                }
                let bullet = strip_citation_tags(text).trim().to_string();
                if !bullet.is_empty() {
                    current.bullets.push(bullet);
                }
            }
        }

        if flats.is_empty() {
            return Err(OutlineError::NoHeadings);
        }

        // 层级栈建树
        let mut roots: Vec<OutlineNode> = Vec::new();
        let mut stack: Vec<(u8, OutlineNode)> = Vec::new();

        fn attach(roots: &mut Vec<OutlineNode>, stack: &mut Vec<(u8, OutlineNode)>, done: OutlineNode) {
            if let Some((_, parent)) = stack.last_mut() {
                parent.children.push(done);
            } else {
                roots.push(done);
            }
        }

        for flat in flats {
            while stack.last().map(|(l, _)| *l >= flat.level).unwrap_or(false) {
                let (_, done) = stack.pop().expect("stack non-empty");
                attach(&mut roots, &mut stack, done);
            }
            stack.push((
                flat.level,
                OutlineNode {
                    id: String::new(),
                    title: flat.title,
                    level: flat.level,
                    bullets: flat.bullets,
                    citations: flat.citations,
                    children: Vec::new(),
                },
            ));
        }
        while let Some((_, done)) = stack.pop() {
            attach(&mut roots, &mut stack, done);
        }

        let mut outline = Outline { nodes: roots, version };
        outline.assign_ids();
        Ok(outline)
    }

    /// 按路径重排节点 ID（sec_1、sec_1_2、…）
    fn assign_ids(&mut self) {
        fn walk(nodes: &mut [OutlineNode], prefix: &str) {
            for (i, node) in nodes.iter_mut().enumerate() {
                let id = if prefix.is_empty() {
                    format!("sec_{}", i + 1)
                } else {
                    format!("{}_{}", prefix, i + 1)
                };
                node.id = id.clone();
                walk(&mut node.children, &id);
            }
        }
        walk(&mut self.nodes, "");
    }

    /// 渲染回带 citation 标签的 Markdown（与 parse 无损往返）
    pub fn to_markdown(&self) -> String {
        fn walk(node: &OutlineNode, out: &mut String) {
            let hashes = "#".repeat(node.level as usize);
            if node.citations.is_empty() {
                out.push_str(&format!("{} {}\n", hashes, node.title));
            } else {
                out.push_str(&format!(
                    "{} {} <citation>{}</citation>\n",
                    hashes,
                    node.title,
                    node.citations.join(",")
                ));
            }
            for bullet in &node.bullets {
                out.push_str(&format!("- {}\n", bullet));
            }
            for child in &node.children {
                walk(child, out);
            }
        }

        let mut out = String::new();
        for node in &self.nodes {
            walk(node, &mut out);
        }
        out
    }

    /// 全树引用 ID（保序去重）
    pub fn all_citation_ids(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        fn walk(node: &OutlineNode, seen: &mut std::collections::HashSet<String>, out: &mut Vec<String>) {
            for id in &node.citations {
                if seen.insert(id.clone()) {
                    out.push(id.clone());
                }
            }
            for child in &node.children {
                walk(child, seen, out);
            }
        }
        for node in &self.nodes {
            walk(node, &mut seen, &mut out);
        }
        out
    }

    /// 校验全部引用可在证据库解析；失败返回 UnresolvedCitation
    pub fn validate_citations(&self, bank: &EvidenceBank) -> Result<(), ProtocolError> {
        let missing: Vec<String> = self
            .all_citation_ids()
            .into_iter()
            .filter(|id| !bank.contains(id))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::UnresolvedCitation(missing))
        }
    }

    /// 深度优先取 write_level 层的章节视图；该层无节点时退回根节点列表
    pub fn sections_at(&self, write_level: u8) -> Vec<SectionView> {
        fn collect<'a>(node: &'a OutlineNode, level: u8, out: &mut Vec<&'a OutlineNode>) {
            if node.level == level {
                out.push(node);
                return;
            }
            for child in &node.children {
                collect(child, level, out);
            }
        }

        let mut targets: Vec<&OutlineNode> = Vec::new();
        for node in &self.nodes {
            collect(node, write_level, &mut targets);
        }
        if targets.is_empty() {
            targets = self.nodes.iter().collect();
        }

        targets
            .into_iter()
            .map(|node| {
                let sub = Outline {
                    nodes: vec![node.clone()],
                    version: self.version,
                };
                SectionView {
                    node_id: node.id.clone(),
                    title: node.title.clone(),
                    level: node.level,
                    bullets: node.bullets.clone(),
                    candidate_ids: sub.all_citation_ids(),
                    block: sub.to_markdown(),
                }
            })
            .collect()
    }

    /// 紧凑目录（仅标题，不含 bullet），用于 Writer 的全局上下文
    pub fn compact_map(&self) -> String {
        fn walk(node: &OutlineNode, out: &mut String) {
            let indent = "  ".repeat(node.level.saturating_sub(1) as usize);
            out.push_str(&format!("{}- {}\n", indent, node.title));
            for child in &node.children {
                walk(child, out);
            }
        }
        let mut out = String::new();
        for node in &self.nodes {
            walk(node, &mut out);
        }
        out
    }

    /// 叶子节点是否全部带引用（就绪判定输入之一）
    pub fn every_leaf_cited(&self) -> bool {
        fn walk(node: &OutlineNode) -> bool {
            if node.children.is_empty() {
                !node.citations.is_empty()
            } else {
                node.children.iter().all(walk)
            }
        }
        self.nodes.iter().all(walk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Quantum Networking Report <citation>ev_0001</citation>
## Background <citation>ev_0001,ev_0002</citation>
- definition of entanglement <citation>ev_0003</citation>
- historical context
### Early experiments <citation>ev_0002</citation>
## Protocols
- teleportation steps
";

    #[test]
    fn test_parse_builds_tree_with_path_ids() {
        let outline = Outline::parse(SAMPLE, 1).unwrap();
        assert_eq!(outline.nodes.len(), 1);
        let root = &outline.nodes[0];
        assert_eq!(root.id, "sec_1");
        assert_eq!(root.children.len(), 2);
        assert_eq!(root.children[0].id, "sec_1_1");
        assert_eq!(root.children[0].children[0].id, "sec_1_1_1");
        assert_eq!(root.children[1].title, "Protocols");
    }

    #[test]
    fn test_bullet_citations_lift_to_node() {
        let outline = Outline::parse(SAMPLE, 1).unwrap();
        let background = &outline.nodes[0].children[0];
        assert_eq!(background.citations, vec!["ev_0001", "ev_0002", "ev_0003"]);
        assert_eq!(background.bullets[0], "definition of entanglement");
    }

    #[test]
    fn test_round_trip_is_structurally_lossless() {
        let outline = Outline::parse(SAMPLE, 3).unwrap();
        let rendered = outline.to_markdown();
        let reparsed = Outline::parse(&rendered, 3).unwrap();
        assert_eq!(outline, reparsed);
    }

    #[test]
    fn test_level_skip_rejected() {
        let bad = "# Root\n### Skipped\n";
        assert!(matches!(
            Outline::parse(bad, 1),
            Err(OutlineError::LevelSkip { from: 1, to: 3, .. })
        ));
    }

    #[test]
    fn test_empty_outline_rejected() {
        assert!(matches!(Outline::parse("no headings here", 1), Err(OutlineError::NoHeadings)));
    }

    #[test]
    fn test_sections_at_level_two_with_descendant_citations() {
        let outline = Outline::parse(SAMPLE, 1).unwrap();
        let sections = outline.sections_at(2);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].title, "Background");
        // 自身 + 后代的引用并集
        assert_eq!(sections[0].candidate_ids, vec!["ev_0001", "ev_0002", "ev_0003"]);
        assert!(sections[1].candidate_ids.is_empty());
        assert!(sections[0].block.starts_with("## Background"));
    }

    #[test]
    fn test_sections_fallback_to_roots_when_level_absent() {
        let outline = Outline::parse("# Only Root\n- one bullet\n", 1).unwrap();
        let sections = outline.sections_at(2);
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].node_id, "sec_1");
    }

    #[test]
    fn test_every_leaf_cited() {
        let cited = Outline::parse("# R\n## A <citation>ev_0001</citation>\n", 1).unwrap();
        assert!(cited.every_leaf_cited());
        let uncited = Outline::parse("# R\n## A\n", 1).unwrap();
        assert!(!uncited.every_leaf_cited());
    }

    #[test]
    fn test_compact_map_lists_titles_only() {
        let outline = Outline::parse(SAMPLE, 1).unwrap();
        let map = outline.compact_map();
        assert!(map.contains("- Quantum Networking Report"));
        assert!(map.contains("  - Background"));
        assert!(!map.contains("definition of entanglement"));
    }
}

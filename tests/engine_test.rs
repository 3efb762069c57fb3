//! 引擎端到端测试
//!
//! 用可路由的 LLM 桩（按 system 提示词分流）+ 固定搜索/页面桩，
//! 把 Planner -> Writer 全链路跑成确定性脚本，覆盖：完整运行、停滞终止、
//! 步数上限、引用校验纠正、内容去重、崩溃续跑、完结后 continue 幂等、
//! 并发抓取的集合等价性。

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use std::sync::Arc;

use weaver::config::AppConfig;
use weaver::core::{EngineError, Orchestrator, RunStatus};
use weaver::fetch::{FetchError, FetchedPage, PageSource};
use weaver::journal::{self, EventKind};
use weaver::llm::{LlmClient, LlmError, Message};
use weaver::search::{SearchError, SearchHit, SearchProvider};

/// 按 system 提示词分流的 LLM 桩：Planner / Writer 吃各自的动作队列，
/// 摘要、抽取、URL 过滤、评审走固定应答，对并发调用顺序不敏感。
struct RoutedLlm {
    planner: Mutex<VecDeque<String>>,
    writer: Mutex<VecDeque<String>>,
}

impl RoutedLlm {
    fn new(planner: Vec<&str>, writer: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            planner: Mutex::new(planner.into_iter().map(String::from).collect()),
            writer: Mutex::new(writer.into_iter().map(String::from).collect()),
        })
    }
}

#[async_trait]
impl LlmClient for RoutedLlm {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let system = messages.first().map(|m| m.content.as_str()).unwrap_or("");
        let user = messages.get(1).map(|m| m.content.as_str()).unwrap_or("");

        if system.contains("You are the Planner") {
            return Ok(self
                .planner
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "<terminate>planner script exhausted</terminate>".to_string()));
        }
        if system.contains("You are the Writer") {
            if user.contains("Write this entire section in one turn") {
                return Ok("Fallback section body.".to_string());
            }
            return Ok(self
                .writer
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "<terminate>writer script exhausted</terminate>".to_string()));
        }
        if system.contains("You summarize one web document") {
            return Ok("Query-relevant summary of the fetched page.".to_string());
        }
        if system.contains("You extract verifiable evidence items") {
            return Ok(
                r#"{"items": [{"type": "claim", "content": "a verifiable claim from the page", "location": null, "confidence": 0.8}]}"#
                    .to_string(),
            );
        }
        if system.contains("You select which search results") {
            return Ok(
                r#"{"selected_ranks": [1,2,3,4,5,6,7,8,9,10], "rationale": "keep everything"}"#
                    .to_string(),
            );
        }
        if system.contains("strict evaluator") {
            return Ok(r#"{"rating": 7, "justification": "solid structure"}"#.to_string());
        }
        if system.contains("The planning phase ended without an outline") {
            return Ok("<write_outline># Report\n## Findings\n- observed evidence\n</write_outline>".to_string());
        }
        Err(LlmError::EmptyResponse)
    }
}

/// 对任意查询都返回同一组结果的搜索桩
struct StubSearch {
    hits: Vec<SearchHit>,
}

#[async_trait]
impl SearchProvider for StubSearch {
    fn name(&self) -> &str {
        "stub"
    }

    async fn search(&self, _query: &str, max_results: usize) -> Result<Vec<SearchHit>, SearchError> {
        Ok(self.hits.iter().take(max_results).cloned().collect())
    }
}

/// 固定页面桩：未知 URL 一律 404
struct StubPages {
    pages: HashMap<String, String>,
}

#[async_trait]
impl PageSource for StubPages {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        match self.pages.get(url) {
            Some(body) => Ok(FetchedPage {
                url: url.to_string(),
                title: Some(format!("Title of {}", url)),
                text: body.clone(),
                mime: Some("text/html".to_string()),
            }),
            None => Err(FetchError::Http { status: 404 }),
        }
    }
}

fn hit(rank: usize, url: &str) -> SearchHit {
    SearchHit {
        title: Some(format!("Result {}", rank)),
        snippet: Some("snippet".to_string()),
        url: url.to_string(),
        rank,
    }
}

fn test_config(artifacts: &Path) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.run.artifacts_dir = artifacts.to_path_buf();
    cfg.fetch.concurrency = 1;
    cfg.fetch.min_body_chars = 10;
    cfg
}

fn event_kinds(events: &[journal::RunEvent]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

fn events_of(artifacts: &Path, run_id: &str) -> Vec<journal::RunEvent> {
    journal::replay(artifacts.join(format!("run_{}", run_id)).join("events.jsonl")).unwrap()
}

#[tokio::test]
async fn test_full_run_produces_cited_report() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path());

    let llm = RoutedLlm::new(
        vec![
            r#"<tool_call>{"name": "search", "arguments": {"query": ["quantum teleportation protocols"], "goal": "collect basics"}}</tool_call>"#,
            "<write_outline># Quantum Teleportation\n## Background <citation>ev_0001</citation>\n- core definitions\n## Protocols <citation>ev_0002</citation>\n- protocol steps\n</write_outline>",
            "<terminate>outline complete</terminate>",
        ],
        vec![
            r#"<tool_call>{"name": "retrieve", "arguments": {"citation_ids": ["ev_0001"]}}</tool_call>"#,
            "<write>Entanglement background prose.[^ev_0001]</write>",
            "<terminate>section done</terminate>",
            r#"<tool_call>{"name": "retrieve", "arguments": {"query": "protocol steps", "top_k": 4}}</tool_call>"#,
            "<write>Protocol walkthrough prose.[^ev_0002]</write>",
            "<terminate>section done</terminate>",
        ],
    );
    let search = Arc::new(StubSearch {
        hits: vec![hit(1, "https://alpha.example/a"), hit(2, "https://beta.example/b")],
    });
    let pages = Arc::new(StubPages {
        pages: HashMap::from([
            ("https://alpha.example/a".to_string(), "Long body about entanglement basics and teleportation.".to_string()),
            ("https://beta.example/b".to_string(), "Long body describing the teleportation protocol steps in order.".to_string()),
        ]),
    });

    let orchestrator = Orchestrator::new(cfg, llm, search).with_page_source(pages);
    let outcome = orchestrator.run("quantum teleportation protocols").await.unwrap();
    assert_eq!(outcome.status, RunStatus::Complete);

    let run_root = dir.path().join(format!("run_{}", outcome.run_id));
    let report = std::fs::read_to_string(run_root.join("report.md")).unwrap();
    assert!(report.contains("## Background"));
    assert!(report.contains("## Protocols"));
    assert!(report.contains("[^ev_0001]"));
    assert!(report.contains("## References"));
    // References 按首次使用顺序列出两条证据
    let ref_a = report.find("[^ev_0001]: ").unwrap();
    let ref_b = report.find("[^ev_0002]: ").unwrap();
    assert!(ref_a < ref_b);
    assert!(!report.contains("<!-- incomplete -->"));

    let outline_md = std::fs::read_to_string(run_root.join("outline.md")).unwrap();
    assert!(outline_md.contains("<citation>ev_0001</citation>"));

    let evidence_lines = std::fs::read_to_string(run_root.join("evidence_bank/evidence.jsonl")).unwrap();
    assert_eq!(evidence_lines.lines().count(), 2);

    let judgement: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(run_root.join("outline_judgement.json")).unwrap()).unwrap();
    assert_eq!(judgement["results"].as_object().unwrap().len(), 6);

    let events = events_of(dir.path(), &outcome.run_id);
    let kinds = event_kinds(&events);
    assert_eq!(kinds.first(), Some(&EventKind::RunStarted));
    assert_eq!(kinds.last(), Some(&EventKind::RunFinished));
    assert!(kinds.contains(&EventKind::SearchIssued));
    assert_eq!(kinds.iter().filter(|k| **k == EventKind::EvidenceAdded).count(), 2);
    assert_eq!(kinds.iter().filter(|k| **k == EventKind::SectionWritten).count(), 2);
    // step 严格单调
    let steps: Vec<u64> = events.iter().map(|e| e.step).collect();
    assert!(steps.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_stagnation_forces_terminate_on_empty_results() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.planner.stagnation_limit = 3;

    let llm = RoutedLlm::new(
        vec![
            r#"<tool_call>{"name": "search", "arguments": {"query": ["q one"], "goal": "g"}}</tool_call>"#,
            r#"<tool_call>{"name": "search", "arguments": {"query": ["q two"], "goal": "g"}}</tool_call>"#,
            r#"<tool_call>{"name": "search", "arguments": {"query": ["q three"], "goal": "g"}}</tool_call>"#,
        ],
        vec![],
    );
    let search = Arc::new(StubSearch { hits: vec![] });
    let pages = Arc::new(StubPages { pages: HashMap::new() });

    let orchestrator = Orchestrator::new(cfg, llm, search).with_page_source(pages);
    let outcome = orchestrator.run("quantum teleportation protocols").await.unwrap();
    assert_eq!(outcome.status, RunStatus::Partial);

    let report = std::fs::read_to_string(&outcome.report_path).unwrap();
    assert!(report.contains("Insufficient evidence gathered."));

    let events = events_of(dir.path(), &outcome.run_id);
    let terminated = events
        .iter()
        .find(|e| e.kind == EventKind::PlannerTerminated)
        .expect("planner_terminated event");
    assert_eq!(terminated.payload["reason"], "stagnation");
}

#[tokio::test]
async fn test_step_limit_forces_terminate() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.planner.max_steps = 3;
    cfg.planner.stagnation_limit = 99;

    let llm = RoutedLlm::new(
        vec![
            r#"<tool_call>{"name": "search", "arguments": {"query": ["q one"], "goal": "g"}}</tool_call>"#,
            r#"<tool_call>{"name": "search", "arguments": {"query": ["q two"], "goal": "g"}}</tool_call>"#,
            r#"<tool_call>{"name": "search", "arguments": {"query": ["q three"], "goal": "g"}}</tool_call>"#,
        ],
        vec![],
    );
    let search = Arc::new(StubSearch { hits: vec![] });
    let pages = Arc::new(StubPages { pages: HashMap::new() });

    let orchestrator = Orchestrator::new(cfg, llm, search).with_page_source(pages);
    let outcome = orchestrator.run("budget test").await.unwrap();
    assert_eq!(outcome.status, RunStatus::Partial);

    let events = events_of(dir.path(), &outcome.run_id);
    let terminated = events
        .iter()
        .find(|e| e.kind == EventKind::PlannerTerminated)
        .expect("planner_terminated event");
    assert_eq!(terminated.payload["reason"], "step_limit");
    let planner_steps = events.iter().filter(|e| e.kind == EventKind::PlannerStep).count();
    assert_eq!(planner_steps, 3);
}

#[tokio::test]
async fn test_unresolved_citation_rejected_then_corrected_within_step() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path());

    let llm = RoutedLlm::new(
        vec![
            // 第一次引用了不存在的证据，必须在同一步内被纠正
            "<write_outline># Report\n## Analysis <citation>ev_9999</citation>\n- a point\n</write_outline>",
            "<write_outline># Report\n## Analysis\n- a point\n</write_outline>",
            "<terminate>done</terminate>",
        ],
        vec![
            "<write>Careful reasoning without sources.</write>",
            "<terminate>section done</terminate>",
        ],
    );
    let search = Arc::new(StubSearch { hits: vec![] });
    let pages = Arc::new(StubPages { pages: HashMap::new() });

    let orchestrator = Orchestrator::new(cfg, llm, search).with_page_source(pages);
    let outcome = orchestrator.run("citation integrity").await.unwrap();
    assert_eq!(outcome.status, RunStatus::Complete);

    let events = events_of(dir.path(), &outcome.run_id);
    // 无效大纲没有产生 outline_updated；纠正后恰好一次
    let outline_updates: Vec<_> = events.iter().filter(|e| e.kind == EventKind::OutlineUpdated).collect();
    assert_eq!(outline_updates.len(), 1);
    assert!(!outline_updates[0].payload["markdown"].as_str().unwrap().contains("ev_9999"));
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::Error && e.payload["detail"].as_str().unwrap_or("").contains("ev_9999")));

    // 零引用章节要带显式说明
    let report = std::fs::read_to_string(&outcome.report_path).unwrap();
    assert!(report.contains("no external source supports this section"));
}

#[tokio::test]
async fn test_dedup_two_urls_same_canonical_page() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path());

    let body = "Identical page body served from two url spellings, long enough to keep.";
    let llm = RoutedLlm::new(
        vec![
            r#"<tool_call>{"name": "search", "arguments": {"query": ["dedup case"], "goal": "g"}}</tool_call>"#,
            "<write_outline># Report\n## Findings <citation>ev_0001</citation>\n- the page\n</write_outline>",
            "<terminate>done</terminate>",
        ],
        vec![
            "<write>Single-source finding.[^ev_0001]</write>",
            "<terminate>section done</terminate>",
        ],
    );
    let search = Arc::new(StubSearch {
        hits: vec![
            hit(1, "https://www.example.com/page/"),
            hit(2, "http://example.com/page"),
        ],
    });
    let pages = Arc::new(StubPages {
        pages: HashMap::from([
            ("https://www.example.com/page/".to_string(), body.to_string()),
            ("http://example.com/page".to_string(), body.to_string()),
        ]),
    });

    let orchestrator = Orchestrator::new(cfg, llm, search).with_page_source(pages);
    let outcome = orchestrator.run("dedup correctness").await.unwrap();

    let run_root = dir.path().join(format!("run_{}", outcome.run_id));
    let evidence_lines = std::fs::read_to_string(run_root.join("evidence_bank/evidence.jsonl")).unwrap();
    assert_eq!(evidence_lines.lines().count(), 1);
    assert!(evidence_lines.contains("\"id\":\"ev_0001\""));

    let raws: Vec<_> = std::fs::read_dir(run_root.join("evidence_bank/raw")).unwrap().collect();
    assert_eq!(raws.len(), 1);

    let events = events_of(dir.path(), &outcome.run_id);
    let added = events.iter().filter(|e| e.kind == EventKind::EvidenceAdded).count();
    assert_eq!(added, 1);
}

/// 手工造一个「写完 1/3 章节后被杀」的运行目录
fn seed_partial_run(artifacts: &Path, run_id: &str, query: &str) {
    let root = artifacts.join(format!("run_{}", run_id));
    std::fs::create_dir_all(root.join("evidence_bank/raw")).unwrap();
    let outline_md = "# Report\n## Alpha\n- alpha notes\n## Beta\n- beta notes\n## Gamma\n- gamma notes\n";
    std::fs::write(root.join("outline.md"), outline_md).unwrap();
    // 评审已完成，续跑时不应重跑
    std::fs::write(root.join("outline_judgement.json"), "{\"results\": {}}").unwrap();

    let events = [
        serde_json::json!({"ts": "2026-08-01T00:00:00Z", "run_id": run_id, "step": 1, "kind": "run_started", "payload": {"query": query}}),
        serde_json::json!({"ts": "2026-08-01T00:00:01Z", "run_id": run_id, "step": 2, "kind": "outline_updated", "payload": {"version": 1, "markdown": outline_md}}),
        serde_json::json!({"ts": "2026-08-01T00:00:02Z", "run_id": run_id, "step": 3, "kind": "planner_terminated", "payload": {"reason": "terminate"}}),
        serde_json::json!({"ts": "2026-08-01T00:00:03Z", "run_id": run_id, "step": 4, "kind": "section_written", "payload": {"node_id": "sec_1_1", "title": "Alpha", "level": 2, "chars": 20, "reason": "terminated", "used_ids": [], "body": "Alpha body written before the crash."}}),
    ];
    let lines: Vec<String> = events.iter().map(|e| e.to_string()).collect();
    std::fs::write(root.join("events.jsonl"), lines.join("\n") + "\n").unwrap();
}

#[tokio::test]
async fn test_resume_writes_only_missing_sections() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path());
    seed_partial_run(dir.path(), "rtest01", "resume scenario");

    let llm = RoutedLlm::new(
        vec![],
        vec![
            "<write>Beta body written after resume.</write>",
            "<terminate>section done</terminate>",
            "<write>Gamma body written after resume.</write>",
            "<terminate>section done</terminate>",
        ],
    );
    let search = Arc::new(StubSearch { hits: vec![] });
    let pages = Arc::new(StubPages { pages: HashMap::new() });

    let orchestrator = Orchestrator::new(cfg, llm, search).with_page_source(pages);
    let outcome = orchestrator.resume("rtest01").await.unwrap();
    assert_eq!(outcome.status, RunStatus::Complete);

    let report = std::fs::read_to_string(&outcome.report_path).unwrap();
    // 三节齐全且按大纲顺序
    let a = report.find("Alpha body written before the crash.").unwrap();
    let b = report.find("Beta body written after resume.").unwrap();
    let c = report.find("Gamma body written after resume.").unwrap();
    assert!(a < b && b < c);

    let events = events_of(dir.path(), "rtest01");
    let written: Vec<&str> = events
        .iter()
        .filter(|e| e.kind == EventKind::SectionWritten)
        .filter_map(|e| e.payload["node_id"].as_str())
        .collect();
    // 旧事件不重发：sec_1_1 只出现一次（来自崩溃前）
    assert_eq!(written, vec!["sec_1_1", "sec_1_2", "sec_1_3"]);
    assert_eq!(events.iter().filter(|e| e.kind == EventKind::RunStarted).count(), 1);
}

#[tokio::test]
async fn test_continue_on_finished_run_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path());

    let run_id = "rdone01";
    let root = dir.path().join(format!("run_{}", run_id));
    std::fs::create_dir_all(&root).unwrap();
    std::fs::write(root.join("report.md"), "# Report\n").unwrap();
    let events = [
        serde_json::json!({"ts": "2026-08-01T00:00:00Z", "run_id": run_id, "step": 1, "kind": "run_started", "payload": {"query": "q"}}),
        serde_json::json!({"ts": "2026-08-01T00:00:01Z", "run_id": run_id, "step": 2, "kind": "run_finished", "payload": {"status": "complete"}}),
    ];
    let lines: Vec<String> = events.iter().map(|e| e.to_string()).collect();
    std::fs::write(root.join("events.jsonl"), lines.join("\n") + "\n").unwrap();

    let llm = RoutedLlm::new(vec![], vec![]);
    let search = Arc::new(StubSearch { hits: vec![] });
    let orchestrator = Orchestrator::new(cfg, llm, search);

    let outcome = orchestrator.resume(run_id).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Complete);

    let events_after = events_of(dir.path(), run_id);
    assert_eq!(events_after.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_fetch_banks_equal_as_sets() {
    async fn one_run(artifacts: &Path) -> HashSet<String> {
        let mut cfg = test_config(artifacts);
        cfg.fetch.concurrency = 4;
        cfg.planner.max_urls_per_query = 10;
        cfg.search.max_results = 10;

        let llm = RoutedLlm::new(
            vec![
                r#"<tool_call>{"name": "search", "arguments": {"query": ["wide sweep"], "goal": "g"}}</tool_call>"#,
                "<write_outline># Report\n## Findings\n- all pages\n</write_outline>",
                "<terminate>done</terminate>",
            ],
            vec![
                "<write>Findings prose.</write>",
                "<terminate>section done</terminate>",
            ],
        );
        let hits: Vec<SearchHit> = (1..=10)
            .map(|i| hit(i, &format!("https://site{}.example/doc", i)))
            .collect();
        let pages: HashMap<String, String> = (1..=10)
            .map(|i| {
                (
                    format!("https://site{}.example/doc", i),
                    format!("Unique long body number {} with enough characters to pass.", i),
                )
            })
            .collect();

        let orchestrator = Orchestrator::new(cfg, llm, Arc::new(StubSearch { hits }))
            .with_page_source(Arc::new(StubPages { pages }));
        let outcome = orchestrator.run("parallel determinism").await.unwrap();

        let run_root = artifacts.join(format!("run_{}", outcome.run_id));
        let lines = std::fs::read_to_string(run_root.join("evidence_bank/evidence.jsonl")).unwrap();
        let mut ids = HashSet::new();
        let mut hashes = HashSet::new();
        for line in lines.lines() {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            ids.insert(v["id"].as_str().unwrap().to_string());
            hashes.insert(v["hash"].as_str().unwrap().to_string());
        }
        // ID 稠密：恰好 ev_0001..ev_0010，各不重复
        assert_eq!(ids.len(), 10);
        for n in 1..=10 {
            assert!(ids.contains(&format!("ev_{:04}", n)));
        }
        hashes
    }

    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let hashes_a = one_run(dir_a.path()).await;
    let hashes_b = one_run(dir_b.path()).await;
    // 两次运行的证据库按集合相等（ID 分配顺序允许不同）
    assert_eq!(hashes_a, hashes_b);
}

#[tokio::test]
async fn test_missing_run_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path());
    let llm = RoutedLlm::new(vec![], vec![]);
    let search = Arc::new(StubSearch { hits: vec![] });
    let orchestrator = Orchestrator::new(cfg, llm, search);

    let err = orchestrator.resume("never_existed").await.unwrap_err();
    assert!(matches!(err, EngineError::Fatal(_)));
}

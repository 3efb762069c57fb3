//! Weaver - 双智能体开放式深度研究 CLI
//!
//! 入口：初始化日志、加载配置、按子命令运行 / 续跑 / 重放。
//! 退出码：0 完整报告，2 部分报告，1 致命失败。

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use weaver::config::load_config;
use weaver::core::{EngineError, Orchestrator, RunOutcome};

#[derive(Parser)]
#[command(name = "weaver", about = "Dual-agent open-ended deep research engine", version)]
struct Cli {
    /// 额外配置文件路径（叠加在 config/default.toml 之上）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 开新一次研究运行
    Run {
        /// 研究问题；过长或含特殊字符时改用 --query-file
        query: Option<String>,
        /// 从 UTF-8 文本文件读取研究问题
        #[arg(long)]
        query_file: Option<PathBuf>,
        /// 把最终报告另存一份到该路径
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 续跑一次被中断的运行
    Continue {
        run_id: String,
    },
    /// 把一次运行的事件流打印到 stdout
    Replay {
        run_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.clone()).context("Failed to load config")?;

    match cli.command {
        Command::Run { query, query_file, output } => {
            let query = resolve_query(query, query_file)?;
            let orchestrator = Orchestrator::from_env(config).map_err(fatal)?;
            spawn_ctrl_c(&orchestrator);
            let outcome = orchestrator.run(&query).await;
            finish(outcome, output)
        }
        Command::Continue { run_id } => {
            let orchestrator = Orchestrator::from_env(config).map_err(fatal)?;
            spawn_ctrl_c(&orchestrator);
            let outcome = orchestrator.resume(&run_id).await;
            finish(outcome, None)
        }
        Command::Replay { run_id } => {
            let events = Orchestrator::replay_events(&config, &run_id).map_err(fatal)?;
            if events.is_empty() {
                anyhow::bail!("run {} has no events", run_id);
            }
            for ev in events {
                println!("{}", serde_json::to_string(&ev)?);
            }
            Ok(())
        }
    }
}

fn resolve_query(query: Option<String>, query_file: Option<PathBuf>) -> anyhow::Result<String> {
    let query = match (query, query_file) {
        (Some(q), _) if !q.trim().is_empty() => q,
        (_, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read query file {}", path.display()))?,
        _ => anyhow::bail!("Provide a QUERY argument or --query-file"),
    };
    let query = query.trim().to_string();
    if query.is_empty() {
        anyhow::bail!("The query is empty");
    }
    Ok(query)
}

/// Ctrl-C -> 触发取消令牌；循环在下一个检查点干净退出，运行可续跑
fn spawn_ctrl_c(orchestrator: &Orchestrator) {
    let token = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("cancellation requested, finishing current step");
            token.cancel();
        }
    });
}

fn fatal(e: EngineError) -> anyhow::Error {
    anyhow::anyhow!(e)
}

fn finish(outcome: Result<RunOutcome, EngineError>, output: Option<PathBuf>) -> anyhow::Result<()> {
    match outcome {
        Ok(outcome) => {
            if let Some(out) = output {
                if let Some(parent) = out.parent() {
                    std::fs::create_dir_all(parent).ok();
                }
                std::fs::copy(&outcome.report_path, &out)
                    .with_context(|| format!("Failed to copy report to {}", out.display()))?;
            }
            eprintln!("report: {}", outcome.report_path.display());
            std::process::exit(outcome.status.exit_code());
        }
        Err(EngineError::Cancelled) => {
            eprintln!("run cancelled; resume later with `weaver continue <run_id>`");
            std::process::exit(2);
        }
        Err(e) => {
            eprintln!("fatal: {}", e);
            std::process::exit(1);
        }
    }
}

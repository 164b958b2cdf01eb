//! Hive 演示入口
//!
//! 用法：`hive <brief.json> [plan.json] [--config <file>]`
//!
//! 读取 TaskBrief 与可选的候选计划（未给出时由 Mock LLM 生成单步 echo 计划），
//! 基于内置 echo 能力运行任务并把 TaskOutcome 以 JSON 打印到标准输出。
//! 任务停在 Escalated 时保存快照，供运维方决策后恢复。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use hive::capability::EchoCapability;
use hive::config::{load_config, AppConfig};
use hive::coordinator::{CoordinatorBuilder, SnapshotStore};
use hive::llm::MockLlmClient;
use hive::plan::TaskBrief;
use hive::planner::parse_proposal;

struct Args {
    brief: PathBuf,
    plan: Option<PathBuf>,
    config: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut positional = Vec::new();
    let mut config = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            _ => positional.push(PathBuf::from(arg)),
        }
    }
    let mut positional = positional.into_iter();
    let Some(brief) = positional.next() else {
        bail!("usage: hive <brief.json> [plan.json] [--config <file>]");
    };
    Ok(Args {
        brief,
        plan: positional.next(),
        config,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();
    let args = parse_args()?;

    let cfg = load_config(args.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let brief_text = std::fs::read_to_string(&args.brief)
        .with_context(|| format!("read brief {}", args.brief.display()))?;
    let brief: TaskBrief = serde_json::from_str(&brief_text).context("parse task brief")?;

    let snapshot_dir = cfg.persistence.snapshot_dir.clone();
    let builder = CoordinatorBuilder::new(brief, cfg).with_capability(EchoCapability);
    let builder = match &args.plan {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read plan {}", path.display()))?;
            let candidates = parse_proposal(&text).context("parse plan candidates")?;
            builder.with_candidates(candidates)
        }
        None => builder.with_llm(Arc::new(MockLlmClient::new())),
    };

    let mut coordinator = builder.build().context("build coordinator")?;
    let outcome = coordinator.settle().await.context("run task")?;

    if outcome.is_escalated() {
        let store = SnapshotStore::new(snapshot_dir);
        let path = store
            .save(&coordinator.snapshot())
            .context("save escalation snapshot")?;
        tracing::warn!(
            task = %outcome.task_id,
            snapshot = %path.display(),
            "Task escalated; snapshot saved for operator decision"
        );
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&outcome).context("serialize outcome")?
    );
    Ok(())
}

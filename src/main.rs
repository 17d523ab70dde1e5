//! TaskFlow 命令行入口
//!
//! 初始化日志与配置，装配编排器，然后对命令行给出的任务循环执行，直到会话完成或达到轮数上限。

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::Context;
use taskflow::config::load_config;
use taskflow::core::{ExecuteRequest, ExecutionResult, OrchestratorBuilder};
use taskflow::phase::PhaseEvent;
use tokio_util::sync::CancellationToken;

const MAX_TURNS: u32 = 20;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taskflow::observability::init();

    let config_path = std::env::var("TASKFLOW_CONFIG").ok().map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;

    let workspace = config.app.workspace();
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;

    let mut task = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if task.trim().is_empty() {
        println!("Task:");
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        task = line.trim().to_string();
    }
    if task.is_empty() {
        anyhow::bail!("No task given");
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let model_id = config.model.default_model.clone();
    let sweep_interval = config.session.sweep_interval();
    let orchestrator = OrchestratorBuilder::new(config, workspace)
        .with_events(tx)
        .build();

    let shutdown = CancellationToken::new();
    let sweeper = orchestrator
        .sessions()
        .spawn_sweeper(sweep_interval, shutdown.clone());
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                PhaseEvent::ToolCall { tool, .. } => println!("  -> {tool}"),
                PhaseEvent::ToolResult { summary, .. } => println!("  <- {summary}"),
                PhaseEvent::PhaseChanged { from, to } => println!("  [{from} -> {to}]"),
                other => tracing::debug!(event = ?other, "phase event"),
            }
        }
    });

    let mut session_id = None;
    for turn in 1..=MAX_TURNS {
        let request = ExecuteRequest {
            model_id: model_id.clone(),
            prompt: if turn == 1 { task.clone() } else { "Continue.".to_string() },
            request_id: format!("cli-{turn}"),
            session_id: session_id.clone(),
        };
        let response = orchestrator.execute(request).await?;
        session_id = Some(response.session_id.clone());

        println!("[{}] {}", response.phase, response.text);
        for todo in &response.todos {
            println!("  - [{}] {}: {}", todo.status.as_str(), todo.id, todo.description);
        }
        if let ExecutionResult::Failure { error, .. } = &response.execution_result {
            println!("  ! {} ({})", error.message, error.code);
        }
        if response.complete {
            break;
        }
    }

    let snapshot = serde_json::to_string_pretty(&orchestrator.metrics().snapshot())?;
    tracing::info!(metrics = %snapshot, "run finished");
    if let Some(id) = session_id {
        let _ = orchestrator.stop_session(&id).await;
    }
    shutdown.cancel();
    let _ = sweeper.await;
    drop(orchestrator);
    let _ = printer.await;
    Ok(())
}

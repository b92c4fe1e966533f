//! hornet 命令行入口：读取指令，跑完整个控制循环并打印事件流

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use hornet::config::load_config;
use hornet::core::{AgentEventKind, Orchestrator};
use hornet::observability;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init();

    let directive: String = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if directive.trim().is_empty() {
        bail!("usage: hornet <directive>");
    }

    let config = load_config(None).context("failed to load configuration")?;
    let orchestrator = Arc::new(
        Orchestrator::from_config(config).context("failed to assemble agent")?,
    );

    // 事件打印与主循环并行；循环结束（AgentStopped）后打印任务也随之退出
    let mut events = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let line = serde_json::to_string(&event).unwrap_or_default();
            println!("{}", line);
            if matches!(event.kind, AgentEventKind::AgentStopped { .. }) {
                break;
            }
        }
    });

    // Ctrl-C 转为优雅停止
    let stopper = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping agent");
            stopper.stop();
        }
    });

    orchestrator
        .process_directive(&directive)
        .await
        .context("directive processing failed")?;
    let _ = printer.await;

    let state = orchestrator.state();
    tracing::info!(
        iterations = state.iteration_count,
        tokens = state.total_tokens_used,
        cost = format!("${:.4}", state.total_cost),
        "session finished"
    );
    Ok(())
}

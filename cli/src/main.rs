// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Entry point for the OpenLoRA resource orchestrator.
//!
//! Wires together Inventory, Quota Ledger, Allocator, Scheduler, and the
//! dual HTTP/RPC control surface, then runs the scheduling tick, the
//! heartbeat sweeper, and the unhealthy-node reaper as background tasks
//! until `SIGINT`/`SIGTERM`.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

use openlora_orchestrator_core::allocator::Allocator;
use openlora_orchestrator_core::api::{self, AppState};
use openlora_orchestrator_core::audit::AuditEmitter;
use openlora_orchestrator_core::checkpoint::{CheckpointDocument, CheckpointWriter, FileCheckpointWriter, NullCheckpointWriter};
use openlora_orchestrator_core::config::OrchestratorConfig;
use openlora_orchestrator_core::health::{HeartbeatSweeper, Reaper};
use openlora_orchestrator_core::inventory::Inventory;
use openlora_orchestrator_core::policy::AllowAllPolicy;
use openlora_orchestrator_core::quota::QuotaLedger;
use openlora_orchestrator_core::scheduler::Scheduler;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = OrchestratorConfig::parse();

    match run(config).await {
        Ok(()) => {
            tracing::info!("orchestrator shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(error = %err, "orchestrator exited with a fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: OrchestratorConfig) -> Result<()> {
    let inventory = Arc::new(Inventory::new());
    let quota = Arc::new(QuotaLedger::new());
    let audit = Arc::new(AuditEmitter::default());
    let allocator = Arc::new(Allocator::new(inventory.clone(), quota.clone(), audit.clone()));
    let scheduler = Arc::new(Scheduler::new(
        allocator.clone(),
        quota.clone(),
        Arc::new(AllowAllPolicy),
        config.policy_evaluator_fail_open,
        audit.clone(),
    ));

    let checkpoint_writer: Arc<dyn CheckpointWriter> = match &config.checkpoint_path {
        Some(path) => Arc::new(FileCheckpointWriter::new(path.clone())),
        None => Arc::new(NullCheckpointWriter),
    };
    replay_checkpoint(checkpoint_writer.as_ref(), &inventory, &scheduler, &allocator)?;

    let sweeper = Arc::new(HeartbeatSweeper::new(
        inventory.clone(),
        audit.clone(),
        config.heartbeat_timeout(),
        Duration::from_secs(5),
    ));
    let reaper = Arc::new(Reaper::new(inventory.clone(), scheduler.clone(), config.reap_after(), Duration::from_secs(5)));

    let http_listener = TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("failed to bind HTTP control surface on port {}", config.http_port))?;
    let grpc_addr = format!("0.0.0.0:{}", config.grpc_port)
        .parse()
        .context("failed to parse RPC bind address")?;

    tracing::info!(http_port = config.http_port, grpc_port = config.grpc_port, "starting OpenLoRA orchestrator");

    let tick_interval = config.tick_interval();
    let tick_scheduler = scheduler.clone();
    let tick_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_interval);
        loop {
            interval.tick().await;
            tick_scheduler.tick();
        }
    });
    let sweeper_task = tokio::spawn(sweeper.run());
    let reaper_task = tokio::spawn(reaper.run());

    let http_app = api::router(AppState { scheduler: scheduler.clone(), inventory: inventory.clone(), audit: audit.clone() });
    let rpc_service = api::OrchestratorRpc::new(scheduler.clone(), inventory.clone(), audit.clone()).into_server();

    let http_server = axum::serve(http_listener, http_app).with_graceful_shutdown(shutdown_signal());
    let grpc_server = tonic::transport::Server::builder()
        .add_service(rpc_service)
        .serve_with_shutdown(grpc_addr, shutdown_signal());

    let result = tokio::try_join!(
        async { http_server.await.context("HTTP control surface failed") },
        async { grpc_server.await.context("RPC control surface failed") },
    );

    tick_task.abort();
    sweeper_task.abort();
    reaper_task.abort();

    save_checkpoint(checkpoint_writer.as_ref(), &inventory, &scheduler, &allocator);

    result.map(|_| ())
}

/// Waits for `SIGINT` or, on Unix, `SIGTERM`.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

/// Replay a fresh checkpoint into Inventory, Scheduler, and Allocator
/// before the control surface opens, per the checkpoint hook's documented
/// boot behavior. A missing or stale checkpoint is not an error.
fn replay_checkpoint(
    writer: &dyn CheckpointWriter,
    inventory: &Arc<Inventory>,
    scheduler: &Arc<Scheduler>,
    allocator: &Arc<Allocator>,
) -> Result<()> {
    let Some(doc) = writer.load().context("failed to read checkpoint")? else {
        return Ok(());
    };
    if !doc.is_fresh(chrono::Utc::now()) {
        tracing::warn!(saved_at = %doc.saved_at, "ignoring stale checkpoint");
        return Ok(());
    }

    let now = chrono::Utc::now();
    for node in doc.nodes {
        inventory.register_node(node, now);
    }
    scheduler.restore(doc.jobs);
    allocator.restore(doc.allocations);
    tracing::info!(saved_at = %doc.saved_at, "replayed checkpoint");
    Ok(())
}

/// Save a checkpoint on clean shutdown. Best-effort: a failure to persist
/// is logged, never fatal — the core remains in-memory-authoritative.
fn save_checkpoint(writer: &dyn CheckpointWriter, inventory: &Inventory, scheduler: &Scheduler, allocator: &Allocator) {
    let doc = CheckpointDocument {
        nodes: inventory.list_sorted(),
        jobs: scheduler.list(None),
        allocations: allocator.list(),
        saved_at: chrono::Utc::now(),
    };
    if let Err(err) = writer.save(&doc) {
        tracing::warn!(error = %err, "failed to save checkpoint on shutdown");
    }
}

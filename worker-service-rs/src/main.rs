// worker-service-rs/src/main.rs
// Main entry point for the self-healing worker service.
//
// Wires the explicitly-constructed collaborators (model clients, memory
// index, sandbox runner, notifier) into the repair pipeline, sweeps any
// sandbox containers left over from a previous process, then consumes
// the dead-letter queue until shutdown.

use std::sync::Arc;

use anyhow::Context;
use dotenv::dotenv;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use ai_client::AiClient;
use config_rs::{AiConfig, AppConfig, DbConfig, NotifierConfig, RedisConfig, SandboxConfig};
use memory_kb::MemoryIndex;
use notifier::Notifier;
use repair_pipeline::RepairPipeline;
use sandbox_runner::{sweep_stale_sessions, ContainerRuntime, DockerCli, SandboxRunner};

mod intake;

/// Buffered run reports between spawned pipeline runs and the supervisor.
const REPORT_CHANNEL_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let db_cfg = DbConfig::from_env();
    let redis_cfg = RedisConfig::from_env();
    let ai_cfg = AiConfig::from_env();
    let notifier_cfg = NotifierConfig::from_env();
    let sandbox_cfg = SandboxConfig::from_env();
    let app_cfg = AppConfig::from_env();

    if app_cfg.root_dir.is_none() {
        tracing::warn!("APP_ROOT_DIR not set; fix application will be unavailable");
    }

    let ai = Arc::new(AiClient::new(&ai_cfg));

    let memory = Arc::new(
        MemoryIndex::connect(&db_cfg, &ai_cfg, ai.clone())
            .await
            .context("failed to connect to the memory store")?,
    );
    memory
        .initialize()
        .await
        .context("failed to initialize the memory schema")?;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::new());

    // Previous worker processes may have died mid-run; their sandbox
    // containers are stopped best-effort before we accept work.
    sweep_stale_sessions(runtime.as_ref(), &sandbox_cfg.container_prefix).await;

    let sandbox = Arc::new(SandboxRunner::new(runtime, sandbox_cfg));
    let notifier = Arc::new(Notifier::new(&notifier_cfg));

    let pipeline = Arc::new(RepairPipeline::new(
        ai,
        memory,
        sandbox,
        notifier,
        app_cfg.root_dir,
    ));

    let (reports_tx, reports_rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);
    let supervisor = tokio::spawn(intake::supervise(reports_rx));

    tracing::info!("worker service started");

    tokio::select! {
        result = intake::consume_dead_letters(redis_cfg, pipeline, reports_tx) => {
            if let Err(err) = result {
                tracing::error!(error = %err, "dead-letter intake stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    // Dropping the intake drops its report sender; once in-flight runs
    // finish and release theirs, the supervisor drains and exits.
    let _ = supervisor.await;
    tracing::info!("worker service stopped");

    Ok(())
}

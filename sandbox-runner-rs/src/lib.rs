// sandbox-runner-rs/src/lib.rs
// Sandboxed verification of proposed code changes.
//
// A verification run walks a fixed state machine:
//
//   Preparing -> ImageBuilt -> NetworkReady -> ContainerRunning
//     -> Probing -> Verified{success|failure} -> Destroyed
//
// Destroyed is reached on every exit path: the stages run inside one
// fallible function and teardown is executed unconditionally afterwards,
// whatever that function returned. Teardown steps are independent of
// each other and individually best-effort.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use config_rs::SandboxConfig;
use shared_types_rs::{CodeChange, FailureEvent};

pub mod runtime;

pub use runtime::{ContainerRuntime, ContainerSpec, DockerCli, RuntimeError};

/// Sidecar containers share the run id under this prefix.
const SIDECAR_PREFIX: &str = "sandbox-redis";

/// Build recipe for the sandbox image, parameterized by the run's
/// ephemeral port. The image carries a private copy of the application
/// tree; its entrypoint applies the injected code changes and then
/// launches the application under test.
const RECIPE_TEMPLATE: &str = r#"FROM oven/bun:1.0.25-alpine
WORKDIR /app
RUN apk add --no-cache curl
RUN apk add --no-cache redis
RUN adduser -D sandbox
USER sandbox
COPY --chown=sandbox:sandbox ./ .
ENV PORT={port}
EXPOSE {port}/tcp
CMD ["sh", "-c", "redis-server --daemonize no --port 6800 & exec bun run sandbox/entrypoint.ts"]
"#;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("code change serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Lifecycle states, logged as the run progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Preparing,
    ImageBuilt,
    NetworkReady,
    ContainerRunning,
    Probing,
    Verified,
    Destroyed,
}

impl SandboxState {
    fn as_str(self) -> &'static str {
        match self {
            SandboxState::Preparing => "preparing",
            SandboxState::ImageBuilt => "image_built",
            SandboxState::NetworkReady => "network_ready",
            SandboxState::ContainerRunning => "container_running",
            SandboxState::Probing => "probing",
            SandboxState::Verified => "verified",
            SandboxState::Destroyed => "destroyed",
        }
    }
}

/// One verification run's identity: names and scratch artifacts. Never
/// outlives the run that created it.
#[derive(Debug, Clone)]
pub struct SandboxSession {
    pub session_id: String,
    pub container_name: String,
    pub sidecar_name: String,
    pub recipe_path: PathBuf,
    pub port: u16,
}

/// Outcome of one verification run.
#[derive(Debug, Clone)]
pub struct SandboxOutcome {
    pub success: bool,
    pub detail: String,
}

impl SandboxOutcome {
    fn success(detail: impl Into<String>) -> Self {
        Self {
            success: true,
            detail: detail.into(),
        }
    }

    fn failure(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: detail.into(),
        }
    }
}

/// Runs a proposed fix to completion inside an ephemeral, resource-capped
/// container and reports pass/fail. Teardown is guaranteed.
pub struct SandboxRunner {
    runtime: Arc<dyn ContainerRuntime>,
    cfg: SandboxConfig,
    http: reqwest::Client,
}

impl SandboxRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, cfg: SandboxConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self { runtime, cfg, http }
    }

    /// Verify one set of code changes against the original job invocation.
    pub async fn verify(&self, event: &FailureEvent, changes: &[CodeChange]) -> SandboxOutcome {
        // Ephemeral port picked pseudo-randomly per run; collisions are an
        // accepted risk, there is no reservation step.
        let port: u16 = rand::thread_rng().gen_range(10000..20000);
        let session = self.make_session(event, port);

        tracing::info!(
            job_id = %event.id,
            state = SandboxState::Preparing.as_str(),
            port,
            "starting sandbox verification"
        );

        let result = self.run_stages(&session, event, changes).await;

        // Unconditional teardown: every exit path above funnels through
        // here before the outcome is reported.
        self.teardown(&session).await;

        match result {
            Ok(true) => {
                tracing::info!(job_id = %event.id, state = SandboxState::Verified.as_str(), "sandbox job succeeded");
                SandboxOutcome::success("replayed job completed in sandbox")
            }
            Ok(false) => {
                tracing::info!(job_id = %event.id, state = SandboxState::Verified.as_str(), "sandbox job failed");
                SandboxOutcome::failure("replayed job did not complete in sandbox")
            }
            Err(err) => {
                tracing::error!(job_id = %event.id, error = %err, "error in sandbox");
                SandboxOutcome::failure(format!("sandbox error: {}", err))
            }
        }
    }

    fn make_session(&self, event: &FailureEvent, port: u16) -> SandboxSession {
        let session_id = format!("{}-one", event.name);
        SandboxSession {
            container_name: format!("{}-{}", self.cfg.container_prefix, session_id),
            sidecar_name: format!("{}-{}", SIDECAR_PREFIX, session_id),
            recipe_path: runtime::recipe_path(&self.cfg.scratch_dir, &session_id),
            session_id,
            port,
        }
    }

    async fn run_stages(
        &self,
        session: &SandboxSession,
        event: &FailureEvent,
        changes: &[CodeChange],
    ) -> Result<bool, SandboxError> {
        let recipe = render_recipe(session.port);
        self.runtime
            .write_build_recipe(&session.recipe_path, &recipe)
            .await?;

        self.runtime
            .build_image(&session.recipe_path, &self.cfg.image_tag, &self.cfg.context_dir)
            .await?;
        tracing::info!(job = %session.session_id, state = SandboxState::ImageBuilt.as_str(), "sandbox image built");

        self.runtime.ensure_network(&self.cfg.network_name).await?;
        tracing::info!(job = %session.session_id, state = SandboxState::NetworkReady.as_str(), "sandbox network ready");

        let spec = ContainerSpec {
            name: session.container_name.clone(),
            image: self.cfg.image_tag.clone(),
            network: self.cfg.network_name.clone(),
            memory_limit: self.cfg.memory_limit.clone(),
            cpus: self.cfg.cpus.clone(),
            pids_limit: self.cfg.pids_limit,
            port: session.port,
            env: vec![
                (
                    "APP_CODE_CHANGES".to_string(),
                    serde_json::to_string(changes)?,
                ),
                ("APP_PORT".to_string(), session.port.to_string()),
                ("EXECUTION_CONTEXT".to_string(), "sandbox".to_string()),
            ],
            env_file: self.cfg.env_file.clone(),
        };
        self.runtime.run_container(&spec).await?;
        tracing::info!(job = %session.session_id, state = SandboxState::ContainerRunning.as_str(), "sandbox container running");

        // Fixed settle delay before the first probe.
        tokio::time::sleep(Duration::from_secs(self.cfg.settle_secs)).await;

        tracing::info!(job = %session.session_id, state = SandboxState::Probing.as_str(), "replaying job against sandbox");
        Ok(self.probe(event, session.port).await)
    }

    /// Replay the original job's exact invocation against the sandboxed
    /// application. Exhausting the retry budget is a verification
    /// failure, not a pipeline error.
    async fn probe(&self, event: &FailureEvent, port: u16) -> bool {
        let url = format!("http://localhost:{}/job", port);
        let body = serde_json::json!({
            "name": event.name,
            "data": event.data,
        });

        for attempt in 1..=self.cfg.probe_attempts {
            match self.http.post(&url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    return true;
                }
                Ok(response) => {
                    tracing::debug!(
                        attempt,
                        status = response.status().as_u16(),
                        "probe attempt rejected"
                    );
                }
                Err(err) => {
                    tracing::debug!(attempt, error = %err, "probe attempt failed to connect");
                }
            }
            tokio::time::sleep(Duration::from_secs(self.cfg.probe_delay_secs)).await;
        }

        false
    }

    /// Stop the primary container and the run's sidecar, then delete the
    /// scratch recipe. The three actions are independent; a failure in
    /// one never skips the rest, and "already absent" is success.
    async fn teardown(&self, session: &SandboxSession) {
        tracing::info!(job = %session.session_id, state = SandboxState::Destroyed.as_str(), "destroying sandbox");

        if let Err(err) = self.runtime.stop_container(&session.container_name).await {
            tracing::error!(container = %session.container_name, error = %err, "could not stop container");
        }

        if let Err(err) = self.runtime.stop_container(&session.sidecar_name).await {
            tracing::error!(container = %session.sidecar_name, error = %err, "could not stop sidecar");
        }

        if let Err(err) = self
            .runtime
            .remove_build_recipe(&session.recipe_path)
            .await
        {
            tracing::error!(path = %session.recipe_path.display(), error = %err, "could not delete build recipe");
        }
    }
}

/// Stop any sandbox containers left behind by previous worker processes.
/// Called once at startup; every stop is best-effort.
pub async fn sweep_stale_sessions(runtime: &dyn ContainerRuntime, container_prefix: &str) {
    let names = match runtime.list_containers().await {
        Ok(names) => names,
        Err(err) => {
            tracing::error!(error = %err, "failed to list containers for sweep");
            return;
        }
    };

    let stale: Vec<&String> = names
        .iter()
        .filter(|n| n.starts_with(container_prefix) || n.starts_with(SIDECAR_PREFIX))
        .collect();

    if stale.is_empty() {
        tracing::debug!("no stale sandbox containers found");
        return;
    }

    tracing::info!(count = stale.len(), "removing stale sandbox containers");
    for name in stale {
        if let Err(err) = runtime.stop_container(name).await {
            tracing::error!(container = %name, error = %err, "could not stop stale container");
        }
    }
}

/// Render the build recipe for one run's port.
fn render_recipe(port: u16) -> String {
    RECIPE_TEMPLATE.replace("{port}", &port.to_string())
}

// sandbox-runner-rs/src/runtime.rs
// Container runtime abstraction and the docker CLI implementation.
//
// The trait boundary is exactly the set of operations the sandbox needs:
// write/delete a build recipe, build an image, idempotently ensure a
// bridge network, run a detached resource-capped container, stop a
// container (idempotent on not-found) and list container names. Tests
// substitute an in-memory fake.

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

/// Everything needed to start one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    pub memory_limit: String,
    pub cpus: String,
    pub pids_limit: u32,
    /// The only port published out of the container.
    pub port: u16,
    pub env: Vec<(String, String)>,
    pub env_file: Option<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn write_build_recipe(&self, path: &Path, contents: &str) -> Result<(), RuntimeError>;

    async fn remove_build_recipe(&self, path: &Path) -> Result<(), RuntimeError>;

    async fn build_image(
        &self,
        recipe: &Path,
        tag: &str,
        context_dir: &Path,
    ) -> Result<(), RuntimeError>;

    /// Ensure a named bridge network exists. An already-existing network
    /// of that name is success, not an error.
    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError>;

    /// Start a detached container; returns the container id.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Stop a named container. "No such container" is success.
    async fn stop_container(&self, name: &str) -> Result<(), RuntimeError>;

    async fn list_containers(&self) -> Result<Vec<String>, RuntimeError>;
}

/// The docker CLI spoken through `tokio::process`.
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    async fn docker(&self, args: &[&str]) -> Result<Output, RuntimeError> {
        tracing::debug!(command = %format!("{} {}", self.binary, args.join(" ")), "running container runtime command");

        let output = Command::new(&self.binary).args(args).output().await?;
        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command: format!("{} {}", self.binary, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(output)
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn write_build_recipe(&self, path: &Path, contents: &str) -> Result<(), RuntimeError> {
        tokio::fs::write(path, contents).await?;
        tracing::debug!(path = %path.display(), "build recipe written");
        Ok(())
    }

    async fn remove_build_recipe(&self, path: &Path) -> Result<(), RuntimeError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            // Already gone counts as removed.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn build_image(
        &self,
        recipe: &Path,
        tag: &str,
        context_dir: &Path,
    ) -> Result<(), RuntimeError> {
        let recipe_str = recipe.to_string_lossy().to_string();
        let context_str = context_dir.to_string_lossy().to_string();
        self.docker(&["build", "-f", &recipe_str, "-t", tag, &context_str])
            .await?;
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError> {
        let filter = format!("name={}", name);
        let output = self
            .docker(&["network", "ls", "--filter", &filter, "--format", "{{.Name}}"])
            .await?;

        let existing = String::from_utf8_lossy(&output.stdout);
        if existing.lines().any(|line| line.trim() == name) {
            tracing::debug!(network = name, "network already exists");
            return Ok(());
        }

        self.docker(&["network", "create", name, "--driver=bridge"])
            .await?;
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let memory = format!("--memory={}", spec.memory_limit);
        let network = format!("--network={}", spec.network);
        let cpus = format!("--cpus={}", spec.cpus);
        let name = format!("--name={}", spec.name);
        let pids = format!("--pids-limit={}", spec.pids_limit);
        let publish = format!("{}:{}", spec.port, spec.port);

        let mut args: Vec<String> = Vec::new();
        args.push("run".to_string());
        if let Some(env_file) = &spec.env_file {
            args.push("--env-file".to_string());
            args.push(env_file.clone());
        }
        args.push("-d".to_string());
        args.push("--rm".to_string());
        args.push(memory);
        args.push(network);
        args.push(cpus);
        args.push(name);
        args.push(pids);
        args.push("-p".to_string());
        args.push(publish);
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(spec.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.docker(&arg_refs).await?;

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        tracing::debug!(container_id = %container_id, "started sandbox container");
        Ok(container_id)
    }

    async fn stop_container(&self, name: &str) -> Result<(), RuntimeError> {
        match self.docker(&["stop", name]).await {
            Ok(_) => Ok(()),
            Err(RuntimeError::CommandFailed { stderr, .. })
                if stderr.contains("No such container") =>
            {
                tracing::debug!(container = name, "container already absent");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn list_containers(&self) -> Result<Vec<String>, RuntimeError> {
        let output = self
            .docker(&["ps", "-a", "--format", "{{.Names}}"])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}

/// Where a run's scratch build recipe lives.
pub fn recipe_path(scratch_dir: &Path, session_id: &str) -> PathBuf {
    scratch_dir.join(format!("Dockerfile.{}.temp", session_id))
}

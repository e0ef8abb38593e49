//! config-rs/lib.rs
//! Shared configuration utilities for consistent service configuration
//! Provides env-derived config structs for the worker and its collaborators

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Read an environment variable, falling back to a default when it is
/// unset or fails to parse.
pub fn get_env_var<T: FromStr>(name: &str, default: T) -> T
where
    T: std::fmt::Display + Clone,
{
    match env::var(name) {
        Ok(raw) => raw.parse::<T>().unwrap_or_else(|_| {
            log::warn!("Invalid value in {}, using default {}", name, default);
            default
        }),
        Err(_) => default,
    }
}

/// Read an environment variable as a string with a default.
pub fn get_env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Read an optional environment variable, treating empty as unset.
pub fn get_env_opt(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// PostgreSQL connection settings (APP_DB_*).
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl DbConfig {
    pub fn from_env() -> Self {
        Self {
            host: get_env_or("APP_DB_HOST", "localhost"),
            port: get_env_var("APP_DB_PORT", 5432),
            user: get_env_or("APP_DB_USER", "postgres"),
            password: get_env_or("APP_DB_PASSWORD", ""),
            database: get_env_or("APP_DB_NAME", "smartworker"),
        }
    }

    pub fn url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

/// Redis connection settings (APP_REDIS_*). The queue library owns the
/// queue keys; the worker only consumes the dead-letter list.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub dlq_key: String,
}

impl RedisConfig {
    pub fn from_env() -> Self {
        Self {
            host: get_env_or("APP_REDIS_HOST", "localhost"),
            port: get_env_var("APP_REDIS_PORT", 6379),
            dlq_key: get_env_or("APP_DLQ_KEY", "login-dlq"),
        }
    }

    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

/// Model-serving collaborator endpoints (AI_*).
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub service_url: String,
    pub model_name: String,
    pub embedding_url: String,
    pub embedding_model: String,
    /// Vector dimension of the deployed embedding model; must match the
    /// dimension of the chunk table's vector column.
    pub vector_size: usize,
}

impl AiConfig {
    pub fn from_env() -> Self {
        Self {
            service_url: get_env_or("AI_SERVICE_URL", "http://localhost:8100"),
            model_name: get_env_or("AI_MODEL_NAME", "qwen2.5-coder-3b-instruct-q4_k_m.gguf"),
            embedding_url: get_env_or("AI_EMBEDDING_URL", "http://localhost:8110"),
            embedding_model: get_env_or("AI_EMBEDDING_MODEL", "bge-large-en-v1.5-f32"),
            vector_size: get_env_var("VECTOR_SIZE", 1024),
        }
    }
}

/// Notification collaborator settings. Notifications are disabled when no
/// webhook URL is configured.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub webhook_url: Option<String>,
}

impl NotifierConfig {
    pub fn from_env() -> Self {
        Self {
            webhook_url: get_env_opt("APP_NOTIFY_WEBHOOK_URL"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.webhook_url.is_some()
    }
}

/// Sandbox verification settings (SANDBOX_*).
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Image tag shared by all runs; concurrent builds race on it.
    pub image_tag: String,
    /// Prefix of the primary container name; the sidecar uses
    /// `sandbox-redis-` with the same run id.
    pub container_prefix: String,
    pub network_name: String,
    /// Directory the scratch build recipe is written into.
    pub scratch_dir: PathBuf,
    /// Build context: the application tree copied into the image.
    pub context_dir: PathBuf,
    /// Env file handed to the application under test, when present.
    pub env_file: Option<String>,
    pub memory_limit: String,
    pub cpus: String,
    pub pids_limit: u32,
    /// Seconds to wait for the sandboxed application to come up.
    pub settle_secs: u64,
    pub probe_attempts: u32,
    pub probe_delay_secs: u64,
}

impl SandboxConfig {
    pub fn from_env() -> Self {
        Self {
            image_tag: get_env_or("SANDBOX_IMAGE_TAG", "job-sandbox"),
            container_prefix: get_env_or("SANDBOX_CONTAINER_PREFIX", "job-sandbox"),
            network_name: get_env_or("SANDBOX_NETWORK", "sandbox"),
            scratch_dir: PathBuf::from(get_env_or("SANDBOX_SCRATCH_DIR", ".")),
            context_dir: PathBuf::from(get_env_or("SANDBOX_CONTEXT_DIR", "./")),
            env_file: get_env_opt("SANDBOX_ENV_FILE").or_else(|| Some(".env.docker".to_string())),
            memory_limit: get_env_or("SANDBOX_MEMORY_LIMIT", "128m"),
            cpus: get_env_or("SANDBOX_CPUS", "0.5"),
            pids_limit: get_env_var("SANDBOX_PIDS_LIMIT", 64),
            settle_secs: get_env_var("SANDBOX_SETTLE_SECS", 10),
            probe_attempts: get_env_var("SANDBOX_PROBE_ATTEMPTS", 5),
            probe_delay_secs: get_env_var("SANDBOX_PROBE_DELAY_SECS", 2),
        }
    }
}

/// Top-level application settings.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Root of the application tree the fix paths resolve against.
    /// Unset is fatal to the fix-application step, not to startup.
    pub root_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            root_dir: get_env_opt("APP_ROOT_DIR").map(PathBuf::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_env_var_falls_back_on_missing() {
        let port: u16 = get_env_var("DEFINITELY_NOT_SET_PORT_VAR", 9090);
        assert_eq!(port, 9090);
    }

    #[test]
    fn db_url_is_well_formed() {
        let cfg = DbConfig {
            host: "db".to_string(),
            port: 5433,
            user: "worker".to_string(),
            password: "secret".to_string(),
            database: "jobs".to_string(),
        };
        assert_eq!(cfg.url(), "postgres://worker:secret@db:5433/jobs");
    }

    #[test]
    fn notifier_without_webhook_is_unconfigured() {
        let cfg = NotifierConfig { webhook_url: None };
        assert!(!cfg.is_configured());
    }
}

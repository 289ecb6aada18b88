//! Server and client configuration, loaded from `.env`, environment, then CLI flags.
//!
//! Later sources win; an explicit flag always beats its environment-variable fallback.

use clap::Parser;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "ci-server", about = "CI job runner server")]
pub struct ServerConfig {
    /// Postgres connection string for the persistent store.
    #[arg(long, env = "CI_DATABASE_URL")]
    pub database_url: String,

    /// Directory for stashed zip uploads.
    #[arg(long, env = "CI_SPOOL_DIR", default_value = "./spool")]
    pub spool_dir: std::path::PathBuf,

    /// Prefix applied to container names.
    #[arg(long, env = "CI_NAMESPACE_PREFIX", default_value = "ci")]
    pub namespace_prefix: String,

    /// Seconds between reconciliation passes.
    #[arg(long, env = "CI_RECONCILE_INTERVAL_SECS", default_value_t = 2.0)]
    pub reconcile_interval_secs: f64,

    /// Seconds a stream waits on a queued job before giving up.
    #[arg(long, env = "CI_QUEUED_STREAM_TIMEOUT_SECS", default_value_t = 30)]
    pub queued_stream_timeout_secs: u64,

    /// Address the API server listens on.
    #[arg(long, env = "CI_BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: String,

    /// Image used to run project test suites.
    #[arg(long, env = "CI_RUNNER_IMAGE", default_value = "docker.io/library/alpine:latest")]
    pub docker_image: String,

    /// Which role(s) this process runs: "api", "controller", or "all" (default).
    #[arg(long, env = "CI_ROLE", default_value = "all")]
    pub role: String,
}

impl ServerConfig {
    pub fn load() -> anyhow::Result<Self> {
        // Best-effort: a missing .env file is not an error.
        let _ = dotenvy::dotenv();
        Ok(Self::parse())
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs_f64(self.reconcile_interval_secs)
    }

    pub fn queued_stream_timeout(&self) -> Duration {
        Duration::from_secs(self.queued_stream_timeout_secs)
    }

    pub fn runs_api(&self) -> bool {
        self.role == "all" || self.role == "api"
    }

    pub fn runs_controller(&self) -> bool {
        self.role == "all" || self.role == "controller"
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "ci-admin", about = "Administer CI runner users and API keys")]
pub struct AdminConfig {
    #[arg(long, env = "CI_DATABASE_URL")]
    pub database_url: String,

    #[command(subcommand)]
    pub command: AdminCommand,
}

#[derive(Debug, Clone, clap::Subcommand)]
pub enum AdminCommand {
    /// Create a new user.
    CreateUser {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
    },
    /// Mint a new API key for a user.
    CreateKey {
        #[arg(long)]
        user_id: uuid::Uuid,
        #[arg(long, default_value = "default")]
        name: String,
    },
    /// Revoke an API key.
    RevokeKey {
        #[arg(long)]
        key_id: uuid::Uuid,
    },
    /// List users.
    ListUsers,
    /// Deactivate or reactivate a user.
    SetUserActive {
        #[arg(long)]
        user_id: uuid::Uuid,
        #[arg(long)]
        active: bool,
    },
}

#[derive(Debug, Clone, Parser)]
#[command(name = "ci-client", about = "Submit and track CI jobs")]
pub struct ClientConfig {
    /// Base URL of the CI server.
    #[arg(long, env = "CI_SERVER_URL", default_value = "http://localhost:8080")]
    pub server_url: String,

    /// Bearer credential. Falls back to CI_API_KEY, then a config file `key=value`.
    #[arg(long, env = "CI_API_KEY")]
    pub api_key: Option<String>,

    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(Debug, Clone, clap::Subcommand)]
pub enum ClientCommand {
    /// Submit a project zip and stream its logs to stdout.
    Submit {
        /// Path to the project zip to submit.
        zip_path: std::path::PathBuf,
    },
    /// Submit a project zip without waiting; prints the job id.
    SubmitAsync {
        zip_path: std::path::PathBuf,
    },
    /// Stream (or replay) the logs of an existing job.
    Stream {
        job_id: uuid::Uuid,
        #[arg(long)]
        from_beginning: bool,
    },
    /// Show a single job's record.
    Get { job_id: uuid::Uuid },
    /// List the caller's jobs.
    List,
}

impl ClientConfig {
    /// Resolve the bearer credential: explicit flag/env, else a config file `key=value` in
    /// `$XDG_CONFIG_HOME/ci-runner/credentials` (or `~/.config/ci-runner/credentials`).
    pub fn resolve_api_key(&self) -> anyhow::Result<String> {
        if let Some(key) = &self.api_key {
            return Ok(key.clone());
        }
        let path = dirs_config_path();
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            anyhow::anyhow!(
                "no API key provided and could not read {}: {e}",
                path.display()
            )
        })?;
        for line in contents.lines() {
            if let Some(rest) = line.strip_prefix("key=") {
                return Ok(rest.trim().to_string());
            }
        }
        anyhow::bail!("no `key=` line found in {}", path.display())
    }
}

fn dirs_config_path() -> std::path::PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
    base.join("ci-runner").join("credentials")
}

//! Typed configuration from environment variables and worker files.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::worker::{DEFAULT_POLL_INTERVAL, WorkerOptions};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub worker_name: Option<String>,
    pub max_concurrency: usize,
    pub poll_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            worker_name: std::env::var("JOBQ_WORKER_NAME").ok(),
            max_concurrency: parsed_var("JOBQ_MAX_CONCURRENCY")?.unwrap_or(1),
            poll_interval: parsed_var::<u64>("JOBQ_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
        })
    }

    /// Worker options seeded from the environment.
    pub fn worker_options(&self) -> WorkerOptions {
        let mut options = WorkerOptions::new()
            .max_concurrency(self.max_concurrency)
            .poll_interval(self.poll_interval);
        options.name = self.worker_name.clone();
        options
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid {name}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Top-level TOML wrapper for `jobq work --config`.
#[derive(Debug, Deserialize)]
pub struct WorkerFile {
    pub worker: WorkerSection,
}

/// The `[worker]` table. Unset fields fall back to flags and environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerSection {
    /// Queue selector text: `*`, `name` or `a,b`.
    pub selector: Option<String>,
    pub name: Option<String>,
    pub max_concurrency: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    /// Executable run for each job.
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

impl WorkerFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read worker config {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("bad worker config {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

impl WorkerSection {
    /// Overlay this table onto `options`.
    pub fn apply(&self, mut options: WorkerOptions) -> WorkerOptions {
        if let Some(ref name) = self.name {
            options.name = Some(name.clone());
        }
        if let Some(n) = self.max_concurrency {
            options.max_concurrency = n;
        }
        if let Some(ms) = self.poll_interval_ms {
            options.poll_interval = Duration::from_millis(ms);
        }
        options
    }
}

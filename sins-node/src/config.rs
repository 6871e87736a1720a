//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use sins_core::{AllocatorConfig, Config, LoadConfig, RetryPolicy, TransportConfig};

/// Agent configuration. File: ~/.config/sins/config.toml or /etc/sins/config.toml.
/// Env overrides: SINS_ALLOC_ACK_TIMEOUT, SINS_STOP_ACK_TIMEOUT, SINS_APPLY_DELAY,
/// SINS_WORKERS, SINS_MAX_RETRIES. Times are in seconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Wait for an allocation_ack (default 2).
    #[serde(default = "default_alloc_ack_timeout")]
    pub alloc_ack_timeout: f64,
    /// Wait for a stop_ack (default 5).
    #[serde(default = "default_stop_ack_timeout")]
    pub stop_ack_timeout: f64,
    /// Load: gap between ack and apply (default 1).
    #[serde(default = "default_apply_delay")]
    pub apply_delay: f64,
    /// Load: periodic curr_allocation report; off when absent.
    #[serde(default)]
    pub report_interval: Option<f64>,
    /// Inbound callback workers (default 10).
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: f64,
    /// Resends after a missed ack (default 0).
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: f64,
    #[serde(default)]
    pub retry_jitter: f64,
}

fn default_alloc_ack_timeout() -> f64 {
    2.0
}
fn default_stop_ack_timeout() -> f64 {
    5.0
}
fn default_apply_delay() -> f64 {
    1.0
}
fn default_workers() -> usize {
    10
}
fn default_connect_timeout() -> f64 {
    5.0
}
fn default_retry_backoff() -> f64 {
    1.0
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            alloc_ack_timeout: default_alloc_ack_timeout(),
            stop_ack_timeout: default_stop_ack_timeout(),
            apply_delay: default_apply_delay(),
            report_interval: None,
            workers: default_workers(),
            connect_timeout: default_connect_timeout(),
            max_retries: 0,
            retry_backoff: default_retry_backoff(),
            retry_jitter: 0.0,
        }
    }
}

impl FileConfig {
    /// Validate and convert into the agents' config.
    pub fn into_core(self) -> anyhow::Result<Config> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        let report_interval = self
            .report_interval
            .map(|s| seconds("report_interval", s))
            .transpose()?;
        Ok(Config {
            allocator: AllocatorConfig {
                alloc_ack_timeout: seconds("alloc_ack_timeout", self.alloc_ack_timeout)?,
                stop_ack_timeout: seconds("stop_ack_timeout", self.stop_ack_timeout)?,
                retry: RetryPolicy::new(
                    self.max_retries,
                    seconds("retry_backoff", self.retry_backoff)?,
                    seconds("retry_jitter", self.retry_jitter)?,
                ),
            },
            load: LoadConfig {
                apply_delay: seconds("apply_delay", self.apply_delay)?,
                report_interval,
            },
            transport: TransportConfig {
                workers: self.workers,
                connect_timeout: seconds("connect_timeout", self.connect_timeout)?,
                ..TransportConfig::default()
            },
        })
    }
}

pub fn seconds(name: &str, value: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("{} must be a non-negative number of seconds, got {}", name, value))
}

/// Load config: defaults, then config file, then env vars. An explicit
/// `path` must exist and parse; the default locations are optional.
pub fn load(path: Option<&Path>) -> anyhow::Result<FileConfig> {
    let mut c = match path {
        Some(p) => parse_file(p)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn apply_env<F>(c: &mut FileConfig, var: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = var("SINS_ALLOC_ACK_TIMEOUT").and_then(|s| s.parse().ok()) {
        c.alloc_ack_timeout = v;
    }
    if let Some(v) = var("SINS_STOP_ACK_TIMEOUT").and_then(|s| s.parse().ok()) {
        c.stop_ack_timeout = v;
    }
    if let Some(v) = var("SINS_APPLY_DELAY").and_then(|s| s.parse().ok()) {
        c.apply_delay = v;
    }
    if let Some(v) = var("SINS_WORKERS").and_then(|s| s.parse().ok()) {
        c.workers = v;
    }
    if let Some(v) = var("SINS_MAX_RETRIES").and_then(|s| s.parse().ok()) {
        c.max_retries = v;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/sins/config.toml"));
    }
    out.push(PathBuf::from("/etc/sins/config.toml"));
    out
}

fn parse_file(path: &Path) -> anyhow::Result<FileConfig> {
    let s = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

fn load_file() -> Option<FileConfig> {
    let p = config_paths().into_iter().find(|p| p.exists())?;
    match parse_file(&p) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(path = %p.display(), error = %format!("{:#}", e), "ignoring config file");
            None
        }
    }
}

use crate::remote::RetryPolicy;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(1);
const DEFAULT_REMOTE_FOLDER: &str = "Google AI Studio";
const APP_DIR_NAME: &str = "project_context";

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between two remote modification checks.
    pub poll_interval: Duration,
    /// How long `stop()` waits for the poller to exit.
    pub stop_grace: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Root of all local state; per-project directories live below it.
    pub home: PathBuf,
    /// Remote folder the context and transcript documents are created in.
    pub remote_folder: String,
    pub monitor: MonitorConfig,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            remote_folder: DEFAULT_REMOTE_FOLDER.to_string(),
            monitor: MonitorConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `PROJECT_CONTEXT_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(home) = non_empty_env("PROJECT_CONTEXT_HOME") {
            cfg.home = PathBuf::from(home);
        }
        if let Some(folder) = non_empty_env("PROJECT_CONTEXT_REMOTE_FOLDER") {
            cfg.remote_folder = folder;
        }
        if let Some(poll) = duration_from_env_ms("PROJECT_CONTEXT_POLL_MS") {
            cfg.monitor.poll_interval = poll;
        }
        if let Some(grace) = duration_from_env_ms("PROJECT_CONTEXT_STOP_GRACE_MS") {
            cfg.monitor.stop_grace = grace;
        }
        cfg
    }
}

fn default_home() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

fn non_empty_env(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn duration_from_env_ms(var: &str) -> Option<Duration> {
    non_empty_env(var)
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

//! Engine configuration, read from `TERN_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryBackend {
    ConfigMap,
    Secret,
    Sqlite,
}

impl FromStr for HistoryBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "configmap" | "cm" => Ok(HistoryBackend::ConfigMap),
            "secret" => Ok(HistoryBackend::Secret),
            "sqlite" => Ok(HistoryBackend::Sqlite),
            other => Err(anyhow!("unknown history backend: {} (expect configmap, secret or sqlite)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between steady-state observations.
    pub poll_interval: Duration,
    /// Cap on retained history entries.
    pub max_releases: usize,
    pub field_manager: String,
    pub history_backend: HistoryBackend,
    pub db_path: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            max_releases: 20,
            field_manager: "tern".to_string(),
            history_backend: HistoryBackend::ConfigMap,
            db_path: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let poll_ms: u64 = std::env::var("TERN_POLL_INTERVAL_MS").ok().and_then(|s| s.parse().ok()).unwrap_or(d.poll_interval.as_millis() as u64);
        let max_releases: usize = std::env::var("TERN_MAX_RELEASES").ok().and_then(|s| s.parse().ok()).unwrap_or(d.max_releases);
        let field_manager = std::env::var("TERN_FIELD_MANAGER").ok().filter(|s| !s.is_empty()).unwrap_or(d.field_manager);
        let history_backend = std::env::var("TERN_HISTORY_BACKEND").ok().and_then(|s| s.parse().ok()).unwrap_or(d.history_backend);
        let db_path = std::env::var("TERN_DB_PATH").ok();
        Self { poll_interval: Duration::from_millis(poll_ms.max(1)), max_releases: max_releases.max(1), field_manager, history_backend, db_path }
    }
}

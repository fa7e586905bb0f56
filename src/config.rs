use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ai::DEFAULT_INFERENCE_ENDPOINT;
use crate::persist::default_state_dir;
use crate::watcher::WatchSettings;

/// Resolved engine settings.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EngineConfig {
    pub source: Option<PathBuf>,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
    pub catalog_resync: Duration,
    /// `None` keeps user state in memory only.
    pub state_dir: Option<PathBuf>,
    pub inference_endpoint: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            source: None,
            poll_interval: Duration::from_millis(1_000),
            poll_timeout: Duration::from_secs(10),
            probe_interval: Duration::from_millis(11_000),
            probe_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            catalog_resync: Duration::from_millis(10_000),
            state_dir: Some(default_state_dir()),
            inference_endpoint: DEFAULT_INFERENCE_ENDPOINT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default, alias = "poll_ms")]
    poll_interval_ms: Option<u64>,
    #[serde(default)]
    poll_timeout_secs: Option<u64>,
    #[serde(default, alias = "probe_ms")]
    probe_interval_ms: Option<u64>,
    #[serde(default)]
    probe_timeout_secs: Option<u64>,
    #[serde(default, alias = "timeout_secs")]
    request_timeout_secs: Option<u64>,
    #[serde(default)]
    catalog_resync_ms: Option<u64>,
    #[serde(default)]
    state_dir: Option<PathBuf>,
    #[serde(default, alias = "ollama_url")]
    inference_endpoint: Option<String>,
}

impl EngineConfig {
    /// Reads `explicit` or the first discovered config file; defaults when there is none.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit.map(Path::to_path_buf).or_else(discover_config_path) {
            Some(path) => Self::from_file(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config = Self::from_yaml(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let defaults = Self::default();
        if raw.trim().is_empty() {
            return Ok(defaults);
        }

        let parsed: ConfigFile = serde_yaml::from_str(raw)?;
        Ok(Self {
            source: None,
            poll_interval: parsed
                .poll_interval_ms
                .map(millis)
                .unwrap_or(defaults.poll_interval),
            poll_timeout: parsed
                .poll_timeout_secs
                .map(seconds)
                .unwrap_or(defaults.poll_timeout),
            probe_interval: parsed
                .probe_interval_ms
                .map(millis)
                .unwrap_or(defaults.probe_interval),
            probe_timeout: parsed
                .probe_timeout_secs
                .map(seconds)
                .unwrap_or(defaults.probe_timeout),
            request_timeout: parsed
                .request_timeout_secs
                .map(seconds)
                .unwrap_or(defaults.request_timeout),
            catalog_resync: parsed
                .catalog_resync_ms
                .map(millis)
                .unwrap_or(defaults.catalog_resync),
            state_dir: parsed.state_dir.or(defaults.state_dir),
            inference_endpoint: parsed
                .inference_endpoint
                .filter(|endpoint| !endpoint.trim().is_empty())
                .unwrap_or(defaults.inference_endpoint),
        })
    }

    /// Command-line flags win over the file. Connectivity checks run at most once a second.
    pub fn apply_cli_overrides(
        &mut self,
        poll_ms: Option<u64>,
        probe_ms: Option<u64>,
        state_dir: Option<PathBuf>,
    ) {
        if let Some(poll_ms) = poll_ms {
            self.poll_interval = millis(poll_ms);
        }
        if let Some(probe_ms) = probe_ms {
            self.probe_interval = Duration::from_millis(probe_ms.max(1_000));
        }
        if let Some(state_dir) = state_dir {
            self.state_dir = Some(state_dir);
        }
    }

    pub fn watch_settings(&self) -> WatchSettings {
        WatchSettings {
            poll_interval: self.poll_interval,
            poll_timeout: self.poll_timeout,
        }
    }
}

/// Sub-100ms cadences would hammer the API server.
fn millis(value: u64) -> Duration {
    Duration::from_millis(value.max(100))
}

fn seconds(value: u64) -> Duration {
    Duration::from_secs(value.max(1))
}

fn discover_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("KUBEPLORER_CONFIG")
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }

    let cwd_candidates = [
        PathBuf::from("kubeplorer.yaml"),
        PathBuf::from("kubeplorer.yml"),
        PathBuf::from(".kubeplorer.yaml"),
    ];
    for candidate in cwd_candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let home = dirs::home_dir()?;
    [
        home.join(".config/kubeplorer/config.yaml"),
        home.join(".config/kubeplorer/config.yml"),
    ]
    .into_iter()
    .find(|candidate| candidate.exists())
}

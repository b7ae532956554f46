//! Watcher configuration.
//!
//! Stored in JSON format at `~/.portwatch/config.json`. Every field has a
//! default, so a missing file or a partial file both load cleanly. The CLI
//! layers flags and environment variables over the loaded values.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::adapters::resolver::DEFAULT_STRATEGY_TIMEOUT;
use crate::adapters::sink::DEFAULT_SINK_TIMEOUT;
use crate::adapters::snapshot::DEFAULT_SNAPSHOT_PATH;
use crate::domain::{ContainerIdentity, PortFilter};
use crate::error::{Error, Result};

/// Observation modality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Periodic socket-table sampling.
    #[default]
    Polling,
    /// Kernel bind/close event stream from a tracer process.
    Ebpf,
}

/// Preferred socket-table backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    #[default]
    Auto,
    Ss,
    Proc,
}

/// Configuration for one watcher run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchConfig {
    pub mode: Mode,

    /// Delay between sampling cycles.
    pub interval_ms: u64,

    /// Samples taken per cycle.
    pub burst_count: u32,

    /// Delay between samples within a cycle.
    pub burst_delay_ms: u64,

    pub backend: BackendChoice,

    /// Closure debounce window. Zero closes on the first absent cycle.
    pub grace_ms: u64,

    /// Port allow-list, e.g. `"22,80,8000-8100"`. Unset watches everything.
    pub ports: Option<String>,

    /// Collector endpoint for lifecycle events.
    pub sink_url: Option<String>,

    pub sink_timeout_ms: u64,

    /// Bound on each PID attribution attempt.
    pub resolve_timeout_ms: u64,

    /// Snapshot file. `null` disables the snapshot.
    pub snapshot_path: Option<PathBuf>,

    pub container_id: String,

    pub container_name: String,

    /// Tracer argv for `ebpf` mode.
    pub tracer_command: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Polling,
            interval_ms: 1000,
            burst_count: 1,
            burst_delay_ms: 100,
            backend: BackendChoice::Auto,
            grace_ms: 0,
            ports: None,
            sink_url: None,
            sink_timeout_ms: DEFAULT_SINK_TIMEOUT.as_millis() as u64,
            resolve_timeout_ms: DEFAULT_STRATEGY_TIMEOUT.as_millis() as u64,
            snapshot_path: Some(PathBuf::from(DEFAULT_SNAPSHOT_PATH)),
            container_id: String::new(),
            container_name: String::new(),
            tracer_command: Vec::new(),
        }
    }
}

impl WatchConfig {
    /// Reject configurations the watcher cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(Error::Config("intervalMs must be greater than 0".to_string()));
        }
        if self.burst_count == 0 {
            return Err(Error::Config("burstCount must be at least 1".to_string()));
        }
        self.filter()?;

        if self.mode == Mode::Ebpf && self.tracer_command.is_empty() {
            return Err(Error::Config(
                "ebpf mode requires a tracer command".to_string(),
            ));
        }

        if let Some(url) = &self.sink_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::Config(format!(
                    "Sink URL must start with http:// or https://: {}",
                    url
                )));
            }
        }

        Ok(())
    }

    /// The parsed port allow-list.
    pub fn filter(&self) -> Result<PortFilter> {
        match self.ports.as_deref() {
            Some(spec) => spec.parse(),
            None => Ok(PortFilter::allow_all()),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn burst_delay(&self) -> Duration {
        Duration::from_millis(self.burst_delay_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_timeout_ms)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn identity(&self) -> ContainerIdentity {
        ContainerIdentity::new(self.container_id.clone(), self.container_name.clone())
    }
}

/// Configuration store backed by a JSON file.
pub struct ConfigStore {
    /// Path to the configuration file.
    config_path: PathBuf,
}

impl ConfigStore {
    /// Create a new config store with the default path.
    ///
    /// Default path: `~/.portwatch/config.json`
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

        Ok(Self {
            config_path: home.join(".portwatch").join("config.json"),
        })
    }

    /// Create a config store with a custom path.
    pub fn with_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.config_path
    }

    /// Load configuration from disk.
    ///
    /// Returns default config if the file doesn't exist.
    pub async fn load(&self) -> Result<WatchConfig> {
        if !self.config_path.exists() {
            return Ok(WatchConfig::default());
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }
}

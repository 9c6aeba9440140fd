use anyhow::Result;
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_POOL_SIZE: usize = 8;
pub const DEFAULT_LEASE_SECS: u64 = 120;
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_DEADLINE_SWEEP_SECS: u64 = 60;
pub const DEFAULT_FINISHED_RETENTION_SECS: u64 = 7 * 24 * 3600;
/// Runs are abandoned this long before their lease would expire.
const APOPTOSIS_MARGIN_SECS: u64 = 29;

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct StoreConfig {
    /// Directory holding `strands.sqlite`
    #[serde(default)]
    pub state_dir: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct DispatcherConfig {
    /// Maximum strands run concurrently by one worker process
    #[serde(default)]
    #[schemars(range(min = 1))]
    pub pool_size: Option<usize>,
    /// Lease length in seconds; the run budget is a quarter of it
    #[serde(default)]
    #[schemars(range(min = 1))]
    pub lease_secs: Option<u64>,
    #[serde(default)]
    pub scan_interval_ms: Option<u64>,
    #[serde(default)]
    pub deadline_sweep_secs: Option<u64>,
    /// Finished root strands older than this are deleted
    #[serde(default)]
    pub finished_retention_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema = schemars::schema_for!(Config);
    let schema_value = serde_json::to_value(&schema).expect("schema value");
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration structure.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).expect("schema json")
}

pub fn write_schema_file(path: &str) -> std::io::Result<()> {
    let schema_json = config_schema_json();
    std::fs::write(path, serde_json::to_string_pretty(&schema_json)?)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let raw: toml::Value = toml::from_str(content)?;
    let json_value = serde_json::to_value(&raw)?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow::anyhow!(validation_errors.join(", ")));
    }
    Ok(toml::from_str(content)?)
}

pub fn load_config(path: &str) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// `TENDRIL_STATE_DIR`, then `[store].state_dir`, then the per-user data
/// directory.
pub fn resolve_state_dir(cfg: &Config) -> PathBuf {
    if let Ok(dir) = std::env::var("TENDRIL_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Some(dir) = &cfg.store.state_dir {
        return PathBuf::from(dir);
    }
    directories::ProjectDirs::from("dev", "tendril", "tendril")
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("state"))
}

/// Resolved dispatcher knobs with defaults and environment overrides applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherSettings {
    pub pool_size: usize,
    pub lease: Duration,
    pub scan_interval: Duration,
    pub deadline_sweep: Duration,
    pub finished_retention: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl DispatcherSettings {
    pub fn from_config(cfg: &Config) -> Self {
        let d = &cfg.dispatcher;
        let pool_size = std::env::var("TENDRIL_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .or(d.pool_size)
            .unwrap_or(DEFAULT_POOL_SIZE)
            .max(1);
        Self {
            pool_size,
            lease: Duration::from_secs(d.lease_secs.unwrap_or(DEFAULT_LEASE_SECS).max(1)),
            scan_interval: Duration::from_millis(
                d.scan_interval_ms.unwrap_or(DEFAULT_SCAN_INTERVAL_MS),
            ),
            deadline_sweep: Duration::from_secs(
                d.deadline_sweep_secs.unwrap_or(DEFAULT_DEADLINE_SWEEP_SECS),
            ),
            finished_retention: Duration::from_secs(
                d.finished_retention_secs
                    .unwrap_or(DEFAULT_FINISHED_RETENTION_SECS),
            ),
        }
    }

    pub fn run_budget(&self) -> Duration {
        self.lease / 4
    }

    pub fn apoptosis_timeout(&self) -> Duration {
        self.lease
            .checked_sub(Duration::from_secs(APOPTOSIS_MARGIN_SECS))
            .filter(|d| !d.is_zero())
            .unwrap_or(self.lease)
    }
}

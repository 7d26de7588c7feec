//! Node configuration loaded from a TOML file.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use weave_ledger::LedgerConfig;
use weave_sync::SyndicationConfig;

/// Top-level configuration for a Weave node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeaveConfig {
    /// Human-readable name used in logs.
    pub agent_name: String,
    /// Tracing filter directive, overridden by `RUST_LOG`.
    pub log_level: String,
    pub ledger: LedgerConfig,
    pub syndication: SyndicationConfig,
    pub simulation: SimulationConfig,
}

impl Default for WeaveConfig {
    fn default() -> Self {
        Self {
            agent_name: "weave".to_string(),
            log_level: "info".to_string(),
            ledger: LedgerConfig::default(),
            syndication: SyndicationConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

/// Shape of the in-process multi-agent simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub agents: usize,
    pub events_per_agent: usize,
    /// Random pairwise syncs before the final convergence rounds.
    pub random_syncs: usize,
    /// Number of agents whose endpoint fails fetches during the random phase.
    pub flaky_agents: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            agents: 4,
            events_per_agent: 100,
            random_syncs: 40,
            flaky_agents: 1,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Load configuration from `path`, falling back to defaults.
///
/// A missing file is not an error. `WEAVE_DATA_DIR` overrides
/// `ledger.data_dir`.
pub fn load_config(path: Option<&str>) -> Result<WeaveConfig, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => WeaveConfig::default(),
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => WeaveConfig::default(),
    };

    if let Ok(dir) = std::env::var("WEAVE_DATA_DIR") {
        if !dir.trim().is_empty() {
            config.ledger.data_dir = Some(dir.into());
        }
    }

    Ok(config)
}

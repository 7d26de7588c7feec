//! Ledger configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Outcome of checking a configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigValidation {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    pub fn from_errors(errors: Vec<String>) -> Self {
        ConfigValidation {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Configuration for a [`crate::Ledger`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Number of appended events that triggers an automatic checkpoint.
    pub checkpoint_interval: u64,
    /// Page size used when a query does not specify a limit.
    pub default_query_limit: usize,
    /// Upper bound applied to any requested query limit.
    pub max_query_limit: usize,
    /// Directory for the event journal and agent key. `None` keeps
    /// everything in memory.
    pub data_dir: Option<PathBuf>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            checkpoint_interval: 100,
            default_query_limit: 100,
            max_query_limit: 10_000,
            data_dir: None,
        }
    }
}

impl LedgerConfig {
    pub fn validate(&self) -> ConfigValidation {
        let mut errors = Vec::new();
        if self.checkpoint_interval == 0 {
            errors.push("checkpoint_interval must be greater than zero".to_string());
        }
        if self.default_query_limit == 0 {
            errors.push("default_query_limit must be greater than zero".to_string());
        }
        if self.max_query_limit < self.default_query_limit {
            errors.push(format!(
                "max_query_limit ({}) must not be below default_query_limit ({})",
                self.max_query_limit, self.default_query_limit
            ));
        }
        ConfigValidation::from_errors(errors)
    }

    /// Log every problem and replace offending fields with defaults.
    pub fn sanitized(mut self) -> Self {
        let validation = self.validate();
        if validation.valid {
            return self;
        }
        for error in &validation.errors {
            tracing::warn!(%error, "invalid ledger configuration, using default");
        }
        let defaults = LedgerConfig::default();
        if self.checkpoint_interval == 0 {
            self.checkpoint_interval = defaults.checkpoint_interval;
        }
        if self.default_query_limit == 0 {
            self.default_query_limit = defaults.default_query_limit;
        }
        if self.max_query_limit < self.default_query_limit {
            self.max_query_limit = self.default_query_limit.max(defaults.max_query_limit);
        }
        self
    }
}

/// Builder for ledger configuration.
pub struct LedgerConfigBuilder {
    config: LedgerConfig,
}

impl LedgerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: LedgerConfig::default(),
        }
    }

    pub fn checkpoint_interval(mut self, interval: u64) -> Self {
        self.config.checkpoint_interval = interval;
        self
    }

    pub fn default_query_limit(mut self, limit: usize) -> Self {
        self.config.default_query_limit = limit;
        self
    }

    pub fn max_query_limit(mut self, limit: usize) -> Self {
        self.config.max_query_limit = limit;
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> LedgerConfig {
        self.config
    }
}

impl Default for LedgerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = LedgerConfigBuilder::new()
            .checkpoint_interval(5)
            .default_query_limit(10)
            .max_query_limit(50)
            .data_dir("/tmp/weave")
            .build();

        assert_eq!(config.checkpoint_interval, 5);
        assert_eq!(config.default_query_limit, 10);
        assert_eq!(config.max_query_limit, 50);
        assert!(config.validate().valid);
    }

    #[test]
    fn test_invalid_config_falls_back_to_defaults() {
        let config = LedgerConfigBuilder::new()
            .checkpoint_interval(0)
            .default_query_limit(0)
            .build();
        let validation = config.validate();
        assert!(!validation.valid);
        assert_eq!(validation.errors.len(), 2);

        let sanitized = config.sanitized();
        assert_eq!(sanitized.checkpoint_interval, 100);
        assert_eq!(sanitized.default_query_limit, 100);
        assert!(sanitized.validate().valid);
    }

    #[test]
    fn test_partial_deserialization_uses_defaults() {
        let config: LedgerConfig = serde_json::from_str(r#"{"checkpoint_interval": 7}"#).unwrap();
        assert_eq!(config.checkpoint_interval, 7);
        assert_eq!(config.default_query_limit, 100);
        assert!(config.data_dir.is_none());
    }
}

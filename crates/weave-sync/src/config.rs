//! Syndication configuration.

use crate::backoff::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use weave_ledger::ConfigValidation;

/// Configuration for a [`crate::SyndicationService`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyndicationConfig {
    /// Endpoints registered at construction.
    pub peers: Vec<String>,
    /// Run a sync round every `sync_interval_ms` while started.
    pub auto_sync: bool,
    pub sync_interval_ms: u64,
    /// Cap on events pulled or pushed per peer per round.
    pub max_events_per_sync: usize,
    /// Bound on every individual transport call.
    pub request_timeout_ms: u64,
    /// How long `stop` waits for an in-flight round.
    pub shutdown_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for SyndicationConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            auto_sync: true,
            sync_interval_ms: 30_000,
            max_events_per_sync: 1000,
            request_timeout_ms: 10_000,
            shutdown_timeout_ms: 5_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl SyndicationConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> ConfigValidation {
        let mut errors = Vec::new();
        if self.sync_interval_ms == 0 {
            errors.push("sync_interval_ms must be greater than zero".to_string());
        }
        if self.max_events_per_sync == 0 {
            errors.push("max_events_per_sync must be greater than zero".to_string());
        }
        if self.request_timeout_ms == 0 {
            errors.push("request_timeout_ms must be greater than zero".to_string());
        }
        if self.retry.base_delay_ms == 0 {
            errors.push("retry.base_delay_ms must be greater than zero".to_string());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push(format!(
                "retry.max_delay_ms ({}) must not be below retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            ));
        }
        for endpoint in &self.peers {
            if endpoint.trim().is_empty() {
                errors.push("peer endpoints must not be empty".to_string());
            }
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
            tracing::warn!(%error, "invalid syndication configuration, using default");
        }
        let defaults = SyndicationConfig::default();
        if self.sync_interval_ms == 0 {
            self.sync_interval_ms = defaults.sync_interval_ms;
        }
        if self.max_events_per_sync == 0 {
            self.max_events_per_sync = defaults.max_events_per_sync;
        }
        if self.request_timeout_ms == 0 {
            self.request_timeout_ms = defaults.request_timeout_ms;
        }
        if self.retry.base_delay_ms == 0 {
            self.retry.base_delay_ms = defaults.retry.base_delay_ms;
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            self.retry.max_delay_ms = self.retry.base_delay_ms.max(defaults.retry.max_delay_ms);
        }
        self.peers.retain(|endpoint| !endpoint.trim().is_empty());
        self
    }
}

/// Builder for syndication configuration.
pub struct SyndicationConfigBuilder {
    config: SyndicationConfig,
}

impl SyndicationConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyndicationConfig::default(),
        }
    }

    pub fn peer(mut self, endpoint: impl Into<String>) -> Self {
        self.config.peers.push(endpoint.into());
        self
    }

    pub fn auto_sync(mut self, enabled: bool) -> Self {
        self.config.auto_sync = enabled;
        self
    }

    pub fn sync_interval(mut self, ms: u64) -> Self {
        self.config.sync_interval_ms = ms;
        self
    }

    pub fn max_events_per_sync(mut self, max: usize) -> Self {
        self.config.max_events_per_sync = max;
        self
    }

    pub fn request_timeout(mut self, ms: u64) -> Self {
        self.config.request_timeout_ms = ms;
        self
    }

    pub fn shutdown_timeout(mut self, ms: u64) -> Self {
        self.config.shutdown_timeout_ms = ms;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn build(self) -> SyndicationConfig {
        self.config
    }
}

impl Default for SyndicationConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

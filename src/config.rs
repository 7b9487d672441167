// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the hub core.
//!
//! Configuration is passed to [`ReplicationReconciler::new()`](crate::ReplicationReconciler::new)
//! and the coordination primitives, and can be constructed programmatically
//! or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use channel_hub::config::HubConfig;
//!
//! let config = HubConfig {
//!     local_node_id: "hub-east-1".into(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! HubConfig
//! ├── local_node_id: String          # Identity compared against global masters
//! └── settings: HubSettings
//!     ├── reconciler: ReconcilerConfig  # Watch path, tick, job pool
//!     ├── task: TaskConfig              # Pull/forward loop tuning
//!     ├── query: QueryConfig            # Fan-out deadline
//!     ├── counter: CounterConfig        # lastUpdated namespace
//!     └── key_set: KeySetConfig         # GroupInFlight namespace
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! local_node_id: "hub-east-1"
//!
//! settings:
//!   reconciler:
//!     watch_path: "/replicator/watcher"
//!     interval: "1h"
//!     max_concurrent_ops: 20
//!   task:
//!     poll_interval: "1s"
//!     batch_size: 100
//!   query:
//!     timeout: "118s"
//! ```

use crate::circuit_breaker::CircuitConfig;
use crate::error::{HubError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Identity of the local hub.
    /// A global channel is replicated from here only when its master equals
    /// this value.
    pub local_node_id: String,

    #[serde(default)]
    pub settings: HubSettings,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            local_node_id: "local.dev.hub.default".to_string(),
            settings: HubSettings::default(),
        }
    }
}

impl HubConfig {
    /// Create a config with short timings for tests.
    pub fn for_testing(local_node_id: &str) -> Self {
        Self {
            local_node_id: local_node_id.to_string(),
            settings: HubSettings {
                reconciler: ReconcilerConfig {
                    drain_timeout: "2s".to_string(),
                    ..ReconcilerConfig::default()
                },
                task: TaskConfig::for_testing(),
                query: QueryConfig {
                    timeout: "2s".to_string(),
                },
                counter: CounterConfig::default(),
                key_set: KeySetConfig::default(),
            },
        }
    }

    /// Reject configurations the hub cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.local_node_id.trim().is_empty() {
            return Err(HubError::Config("local_node_id must not be empty".to_string()));
        }

        let reconciler = &self.settings.reconciler;
        if !reconciler.watch_path.starts_with('/') || reconciler.watch_path.len() < 2 {
            return Err(HubError::Config(format!(
                "watch_path must be an absolute node path, got {:?}",
                reconciler.watch_path
            )));
        }
        if reconciler.max_concurrent_ops == 0 {
            return Err(HubError::Config("max_concurrent_ops must be at least 1".to_string()));
        }
        if self.settings.task.batch_size == 0 {
            return Err(HubError::Config("task batch_size must be at least 1".to_string()));
        }
        if self.settings.counter.max_attempts == 0 {
            return Err(HubError::Config("counter max_attempts must be at least 1".to_string()));
        }

        for (name, root) in [
            ("counter root", &self.settings.counter.root),
            ("key_set root", &self.settings.key_set.root),
        ] {
            if root.trim_matches('/').is_empty() || root.trim_start_matches('/').contains('/') {
                return Err(HubError::Config(format!("{} must be a single path segment, got {:?}", name, root)));
            }
        }

        for (name, value) in [
            ("reconciler interval", &reconciler.interval),
            ("reconciler drain_timeout", &reconciler.drain_timeout),
            ("task poll_interval", &self.settings.task.poll_interval),
            ("task stop_timeout", &self.settings.task.stop_timeout),
            ("query timeout", &self.settings.query.timeout),
        ] {
            humantime::parse_duration(value)
                .map_err(|e| HubError::Config(format!("{} {:?}: {}", name, value, e)))?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HubSettings {
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub task: TaskConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub counter: CounterConfig,
    #[serde(default)]
    pub key_set: KeySetConfig,
}

fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReconcilerConfig: pass triggers and the job pool
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Coordination node whose changes trigger a pass on every hub.
    #[serde(default = "default_watch_path")]
    pub watch_path: String,

    /// Periodic safety-net pass, as a duration string (e.g., "1h").
    #[serde(default = "default_interval")]
    pub interval: String,

    /// Maximum start/stop jobs running at once.
    #[serde(default = "default_max_concurrent_ops")]
    pub max_concurrent_ops: usize,

    /// How long shutdown waits for tasks to stop.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
}

fn default_watch_path() -> String {
    "/replicator/watcher".to_string()
}

fn default_interval() -> String {
    "1h".to_string()
}

fn default_max_concurrent_ops() -> usize {
    20
}

fn default_drain_timeout() -> String {
    "10s".to_string()
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            watch_path: default_watch_path(),
            interval: default_interval(),
            max_concurrent_ops: default_max_concurrent_ops(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl ReconcilerConfig {
    pub fn interval_duration(&self) -> Duration {
        parse_or(&self.interval, Duration::from_secs(3600))
    }

    pub fn drain_timeout_duration(&self) -> Duration {
        parse_or(&self.drain_timeout, Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TaskConfig: per-channel pull and forward loops
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Sleep between polls when the remote side had nothing new.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Maximum items moved per fetch or forward call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How long `stop()` waits for the loop before aborting it.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: String,

    /// First backoff after a failed iteration.
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial: String,

    /// Backoff ceiling.
    #[serde(default = "default_backoff_max")]
    pub backoff_max: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Remote peer protection
    // ─────────────────────────────────────────────────────────────────────────

    /// Share one token bucket across every task's remote calls.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    /// Consecutive remote failures before a task's circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long an open circuit waits before probing again.
    #[serde(default = "default_circuit_reset_timeout")]
    pub circuit_reset_timeout: String,
}

fn default_poll_interval() -> String {
    "1s".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_stop_timeout() -> String {
    "5s".to_string()
}

fn default_backoff_initial() -> String {
    "1s".to_string()
}

fn default_backoff_max() -> String {
    "60s".to_string()
}

fn default_false() -> bool {
    false
}

fn default_rate_limit_per_sec() -> u32 {
    1000
}

fn default_rate_limit_burst() -> u32 {
    100
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout() -> String {
    "30s".to_string()
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            batch_size: default_batch_size(),
            stop_timeout: default_stop_timeout(),
            backoff_initial: default_backoff_initial(),
            backoff_max: default_backoff_max(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_reset_timeout: default_circuit_reset_timeout(),
        }
    }
}

impl TaskConfig {
    pub fn for_testing() -> Self {
        Self {
            poll_interval: "10ms".to_string(),
            batch_size: 10,
            stop_timeout: "500ms".to_string(),
            backoff_initial: "10ms".to_string(),
            backoff_max: "100ms".to_string(),
            circuit_failure_threshold: 100,
            circuit_reset_timeout: "50ms".to_string(),
            ..Self::default()
        }
    }

    pub fn poll_interval_duration(&self) -> Duration {
        parse_or(&self.poll_interval, Duration::from_secs(1))
    }

    pub fn stop_timeout_duration(&self) -> Duration {
        parse_or(&self.stop_timeout, Duration::from_secs(5))
    }

    pub fn retry_config(&self) -> RetryConfig {
        let defaults = RetryConfig::default();
        RetryConfig {
            initial_delay: parse_or(&self.backoff_initial, defaults.initial_delay),
            max_delay: parse_or(&self.backoff_max, defaults.max_delay),
            ..defaults
        }
    }

    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }

    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            recovery_timeout: parse_or(&self.circuit_reset_timeout, Duration::from_secs(30)),
            ..CircuitConfig::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QueryConfig: cross-partition fan-out
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Deadline for a whole fan-out query.
    /// Kept just under the two-minute limit of the API layer in front.
    #[serde(default = "default_query_timeout")]
    pub timeout: String,
}

fn default_query_timeout() -> String {
    "118s".to_string()
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout: default_query_timeout(),
        }
    }
}

impl QueryConfig {
    pub fn timeout_duration(&self) -> Duration {
        parse_or(&self.timeout, Duration::from_secs(118))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Coordination namespaces
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterConfig {
    /// Root node of the per-channel counters.
    #[serde(default = "default_counter_root")]
    pub root: String,

    /// Read/write attempts per update before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_counter_root() -> String {
    "lastUpdated".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            root: default_counter_root(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySetConfig {
    /// Root node of the key-set groups.
    #[serde(default = "default_key_set_root")]
    pub root: String,
}

fn default_key_set_root() -> String {
    "GroupInFlight".to_string()
}

impl Default for KeySetConfig {
    fn default() -> Self {
        Self {
            root: default_key_set_root(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        let settings = &config.settings;
        assert_eq!(settings.reconciler.watch_path, "/replicator/watcher");
        assert_eq!(settings.reconciler.interval_duration(), Duration::from_secs(3600));
        assert_eq!(settings.reconciler.max_concurrent_ops, 20);
        assert_eq!(settings.query.timeout_duration(), Duration::from_secs(118));
        assert_eq!(settings.counter.root, "lastUpdated");
        assert_eq!(settings.counter.max_attempts, 3);
        assert_eq!(settings.key_set.root, "GroupInFlight");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_for_testing_config() {
        let config = HubConfig::for_testing("hub-a");
        assert_eq!(config.local_node_id, "hub-a");
        assert_eq!(config.settings.task.poll_interval_duration(), Duration::from_millis(10));
        assert_eq!(config.settings.task.stop_timeout_duration(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_parsing_various_formats() {
        let mut reconciler = ReconcilerConfig::default();
        reconciler.interval = "90s".to_string();
        assert_eq!(reconciler.interval_duration(), Duration::from_secs(90));
        reconciler.interval = "1m 30s".to_string();
        assert_eq!(reconciler.interval_duration(), Duration::from_secs(90));
        reconciler.interval = "250ms".to_string();
        assert_eq!(reconciler.interval_duration(), Duration::from_millis(250));
    }

    #[test]
    fn test_duration_invalid_fallback() {
        let query = QueryConfig {
            timeout: "soon".to_string(),
        };
        assert_eq!(query.timeout_duration(), Duration::from_secs(118));
    }

    #[test]
    fn test_task_rate_limit_config() {
        let mut task = TaskConfig::default();
        assert!(task.rate_limit_config().is_none());

        task.rate_limit_enabled = true;
        task.rate_limit_per_sec = 50;
        task.rate_limit_burst = 5;
        let limits = task.rate_limit_config().unwrap();
        assert_eq!(limits.refill_rate, 50);
        assert_eq!(limits.burst_size, 5);
    }

    #[test]
    fn test_task_retry_and_circuit_config() {
        let task = TaskConfig::for_testing();
        let retry = task.retry_config();
        assert_eq!(retry.initial_delay, Duration::from_millis(10));
        assert_eq!(retry.max_delay, Duration::from_millis(100));

        let circuit = task.circuit_config();
        assert_eq!(circuit.failure_threshold, 100);
        assert_eq!(circuit.recovery_timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_validate_rejects_empty_node_id() {
        let config = HubConfig {
            local_node_id: "  ".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(HubError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_relative_watch_path() {
        let mut config = HubConfig::default();
        config.settings.reconciler.watch_path = "replicator/watcher".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let mut config = HubConfig::default();
        config.settings.reconciler.max_concurrent_ops = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_nested_roots() {
        let mut config = HubConfig::default();
        config.settings.counter.root = "a/b".to_string();
        assert!(config.validate().is_err());

        let mut config = HubConfig::default();
        config.settings.key_set.root = "/".to_string();
        assert!(config.validate().is_err());

        let mut config = HubConfig::default();
        config.settings.key_set.root = "/GroupInFlight".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_duration() {
        let mut config = HubConfig::default();
        config.settings.task.stop_timeout = "eventually".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stop_timeout"));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let mut config = HubConfig::for_testing("hub-b");
        config.settings.task.rate_limit_enabled = true;

        let json = serde_json::to_string(&config).unwrap();
        let parsed: HubConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.local_node_id, "hub-b");
        assert!(parsed.settings.task.rate_limit_enabled);
        assert_eq!(parsed.settings.task.poll_interval, "10ms");
    }

    #[test]
    fn test_minimal_json_uses_defaults() {
        let parsed: HubConfig = serde_json::from_str(r#"{"local_node_id": "hub-c"}"#).unwrap();
        assert_eq!(parsed.settings.reconciler.watch_path, "/replicator/watcher");
        assert_eq!(parsed.settings.task.batch_size, 100);
        assert_eq!(parsed.settings.counter.max_attempts, 3);
    }
}

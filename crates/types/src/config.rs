//! Engine configuration.
//!
//! Every knob ships with the documented default and deserializes from TOML,
//! so a partial config file only needs to name what it changes.

use crate::model::ProviderId;
use crate::state::StateKind;
use crate::MIB;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_true() -> bool {
    true
}

fn default_max_loaded_models() -> usize {
    2
}

fn default_timeout_multiplier() -> f64 {
    1.0
}

/// How strictly provider privacy claims are enforced during selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyMode {
    /// Only providers claiming fully on-device execution are eligible.
    Strict,
    /// Any available provider is eligible.
    #[default]
    Any,
}

/// The ordered provider preference list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderPolicy {
    /// Provider ids in preference order; first available wins.
    pub order: Vec<ProviderId>,
}

impl Default for ProviderPolicy {
    fn default() -> Self {
        Self {
            order: vec![
                ProviderId::new("native"),
                ProviderId::new("webllm"),
                ProviderId::new("wasm"),
                ProviderId::new("mock"),
            ],
        }
    }
}

/// Healthcheck (provider ping) tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    /// Cadence of opportunistic health evaluation.
    #[serde(default = "HealthcheckConfig::default_interval_ms")]
    pub interval_ms: u64,
    /// Token silence beyond this is a suspected stall.
    #[serde(default = "HealthcheckConfig::default_stalled_threshold_ms")]
    pub stalled_threshold_ms: u64,
    /// Base ping deadline.
    #[serde(default = "HealthcheckConfig::default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    /// Ping deadline multiplier applied while a stall is suspected.
    #[serde(default = "HealthcheckConfig::default_stalled_timeout_multiplier")]
    pub stalled_timeout_multiplier: u32,
}

impl HealthcheckConfig {
    fn default_interval_ms() -> u64 {
        5_000
    }
    fn default_stalled_threshold_ms() -> u64 {
        30_000
    }
    fn default_ping_timeout_ms() -> u64 {
        5_000
    }
    fn default_stalled_timeout_multiplier() -> u32 {
        3
    }
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: Self::default_interval_ms(),
            stalled_threshold_ms: Self::default_stalled_threshold_ms(),
            ping_timeout_ms: Self::default_ping_timeout_ms(),
            stalled_timeout_multiplier: Self::default_stalled_timeout_multiplier(),
        }
    }
}

/// Watchdog tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Tick cadence of the watchdog task.
    #[serde(default = "WatchdogConfig::default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Per-state deadline overrides, replacing the built-in defaults.
    #[serde(default)]
    pub deadline_overrides: HashMap<StateKind, u64>,
}

impl WatchdogConfig {
    fn default_check_interval_ms() -> u64 {
        1_000
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: Self::default_check_interval_ms(),
            deadline_overrides: HashMap::new(),
        }
    }
}

/// Retry ledger tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries permitted after the original attempt.
    #[serde(default = "RetryConfig::default_max_retries")]
    pub max_retries: u32,
    /// Budget multiplier applied on each retry.
    #[serde(default = "RetryConfig::default_reduction_factor")]
    pub reduction_factor: f64,
    /// The smallest budget worth attempting.
    #[serde(default = "RetryConfig::default_min_tokens")]
    pub min_tokens: u32,
}

impl RetryConfig {
    fn default_max_retries() -> u32 {
        2
    }
    fn default_reduction_factor() -> f64 {
        0.8
    }
    fn default_min_tokens() -> u32 {
        50
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            reduction_factor: Self::default_reduction_factor(),
            min_tokens: Self::default_min_tokens(),
        }
    }
}

/// Model cache tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Auto-eviction drains the cache down to this fraction of quota.
    #[serde(default = "CacheConfig::default_max_usage_ratio")]
    pub max_usage_ratio: f64,
    /// Auto-eviction also ensures at least this much free space.
    #[serde(default = "CacheConfig::default_min_free_bytes")]
    pub min_free_bytes: u64,
    /// Prefer the origin-private filesystem bucket when the platform
    /// exposes one.
    #[serde(default = "default_true")]
    pub prefer_opfs: bool,
}

impl CacheConfig {
    fn default_max_usage_ratio() -> f64 {
        0.8
    }
    fn default_min_free_bytes() -> u64 {
        200 * MIB
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_usage_ratio: Self::default_max_usage_ratio(),
            min_free_bytes: Self::default_min_free_bytes(),
            prefer_opfs: true,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Provider preference order.
    pub provider_policy: ProviderPolicy,
    /// Privacy enforcement during selection.
    pub privacy_mode: PrivacyMode,
    /// How many models may be resident at once (>= 1).
    #[serde(default = "default_max_loaded_models")]
    pub max_loaded_models: usize,
    /// Evict the LRU non-active model when over capacity.
    #[serde(default = "default_true")]
    pub auto_unload: bool,
    /// Multiplier applied to every state deadline (slow-device escape hatch).
    #[serde(default = "default_timeout_multiplier")]
    pub timeout_multiplier: f64,
    /// Healthcheck tuning.
    pub healthcheck: HealthcheckConfig,
    /// Watchdog tuning.
    pub watchdog: WatchdogConfig,
    /// Retry ledger tuning.
    pub retry: RetryConfig,
    /// Model cache tuning.
    pub cache: CacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider_policy: ProviderPolicy::default(),
            privacy_mode: PrivacyMode::default(),
            max_loaded_models: default_max_loaded_models(),
            auto_unload: true,
            timeout_multiplier: default_timeout_multiplier(),
            healthcheck: HealthcheckConfig::default(),
            watchdog: WatchdogConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses a (possibly partial) TOML document over the defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_loaded_models, 2);
        assert!(cfg.auto_unload);
        assert_eq!(cfg.privacy_mode, PrivacyMode::Any);
        assert_eq!(cfg.timeout_multiplier, 1.0);
        assert_eq!(cfg.healthcheck.interval_ms, 5_000);
        assert_eq!(cfg.healthcheck.stalled_threshold_ms, 30_000);
        assert_eq!(cfg.healthcheck.ping_timeout_ms, 5_000);
        assert_eq!(cfg.healthcheck.stalled_timeout_multiplier, 3);
        assert_eq!(cfg.watchdog.check_interval_ms, 1_000);
        assert_eq!(cfg.retry.max_retries, 2);
        assert_eq!(cfg.retry.reduction_factor, 0.8);
        assert_eq!(cfg.retry.min_tokens, 50);
        assert_eq!(cfg.cache.max_usage_ratio, 0.8);
        assert_eq!(cfg.cache.min_free_bytes, 200 * MIB);
        assert!(cfg.cache.prefer_opfs);
    }

    #[test]
    fn test_partial_toml_overlays_defaults() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            privacy_mode = "strict"

            [provider_policy]
            order = ["mock"]

            [retry]
            max_retries = 5

            [watchdog.deadline_overrides]
            WARMING_UP = 90000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.privacy_mode, PrivacyMode::Strict);
        assert_eq!(cfg.provider_policy.order, vec![ProviderId::new("mock")]);
        assert_eq!(cfg.retry.max_retries, 5);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.retry.min_tokens, 50);
        assert_eq!(
            cfg.watchdog.deadline_overrides.get(&StateKind::WarmingUp),
            Some(&90_000)
        );
    }
}

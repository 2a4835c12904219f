//! Cache configuration.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::clock::duration_millis;

/// A pair of read-time TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    /// Age up to which an entry is served without refreshing.
    pub fresh: Duration,
    /// Age up to which an entry is served while refreshing in the background.
    pub stale: Duration,
}

impl TtlPolicy {
    /// Create a policy. `fresh` must not exceed `stale`.
    pub fn new(fresh: Duration, stale: Duration) -> Self {
        debug_assert!(fresh <= stale, "fresh TTL exceeds stale TTL");
        Self { fresh, stale }
    }

    /// A policy with no stale window.
    pub fn fresh_only(ttl: Duration) -> Self {
        Self {
            fresh: ttl,
            stale: ttl,
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            fresh: Duration::from_millis(DEFAULT_FRESH_TTL_MS),
            stale: Duration::from_millis(DEFAULT_STALE_TTL_MS),
        }
    }
}

const DEFAULT_FRESH_TTL_MS: u64 = 60 * 1000;
const DEFAULT_STALE_TTL_MS: u64 = 5 * 60 * 1000;
const DEFAULT_HARD_TTL_MS: u64 = 24 * 60 * 60 * 1000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 10 * 60 * 1000;

/// Cache manager configuration.
///
/// ```toml
/// namespace = "cache_"
/// fresh_ttl_ms = 60000
/// stale_ttl_ms = 300000
/// hard_ttl_ms = 86400000
/// sweep_interval_ms = 600000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Prefix applied to every storage key. Lets the cache share a store
    /// with other data without `clear` or sweeps touching it.
    pub namespace: String,

    /// Default fresh TTL for [`get_or_fetch_default`](crate::CacheManager::get_or_fetch_default).
    pub fresh_ttl_ms: u64,

    /// Default stale TTL for [`get_or_fetch_default`](crate::CacheManager::get_or_fetch_default).
    pub stale_ttl_ms: u64,

    /// Age past which the sweeper removes entries.
    pub hard_ttl_ms: u64,

    /// How often the sweeper runs.
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            fresh_ttl_ms: DEFAULT_FRESH_TTL_MS,
            stale_ttl_ms: DEFAULT_STALE_TTL_MS,
            hard_ttl_ms: DEFAULT_HARD_TTL_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
        }
    }
}

impl CacheConfig {
    /// Load config from a file. `.json` files are parsed as JSON, anything
    /// else as TOML.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cache config: {}", path))?;

        let config: Self = if path.ends_with(".json") {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON cache config: {}", path))?
        } else {
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML cache config: {}", path))?
        };

        config
            .validate()
            .with_context(|| format!("Invalid cache config: {}", path))?;
        Ok(config)
    }

    /// Parse config from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse TOML cache config")?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.fresh_ttl_ms > self.stale_ttl_ms {
            bail!(
                "fresh_ttl_ms ({}) must not exceed stale_ttl_ms ({})",
                self.fresh_ttl_ms,
                self.stale_ttl_ms
            );
        }
        if self.sweep_interval_ms == 0 {
            bail!("sweep_interval_ms must be greater than zero");
        }
        Ok(())
    }

    /// Set the key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the default TTL policy.
    pub fn with_ttl(mut self, policy: TtlPolicy) -> Self {
        self.fresh_ttl_ms = duration_millis(policy.fresh);
        self.stale_ttl_ms = duration_millis(policy.stale);
        self
    }

    /// Set the sweeper's hard TTL.
    pub fn with_hard_ttl(mut self, ttl: Duration) -> Self {
        self.hard_ttl_ms = duration_millis(ttl);
        self
    }

    /// Set the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = duration_millis(interval);
        self
    }

    /// Default TTL policy.
    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy {
            fresh: Duration::from_millis(self.fresh_ttl_ms),
            stale: Duration::from_millis(self.stale_ttl_ms),
        }
    }

    /// Sweeper hard TTL.
    pub fn hard_ttl(&self) -> Duration {
        Duration::from_millis(self.hard_ttl_ms)
    }

    /// Sweep interval, never shorter than one millisecond.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

//! Configuration for the cache tiers

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the in-process recency tier and the durable tier.
///
/// The defaults mirror a long-running cataloging workstation: a small
/// recency cache sized for one session's working set, and a negative-cache
/// window long enough that codes confirmed absent are not re-asked for
/// months (classification schemes change rarely).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries in the in-process recency cache
    pub recency_capacity: usize,

    /// How long a negative ("no such code") record stays trusted before a
    /// re-validation against the remote service is forced
    pub negative_ttl: Duration,

    /// Idle window after which batched access-count increments are flushed
    /// to the durable store
    pub flush_quiescence: Duration,

    /// Bounded wait for the persistence worker to drain on shutdown
    pub shutdown_grace: Duration,

    /// Enable hit/miss/eviction counters on the recency cache
    pub track_stats: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            recency_capacity: 256,
            // 90 days
            negative_ttl: Duration::from_secs(90 * 24 * 3600),
            flush_quiescence: Duration::from_secs(3),
            shutdown_grace: Duration::from_secs(5),
            track_stats: true,
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.recency_capacity == 0 {
            return Err("recency_capacity must be greater than 0".to_string());
        }

        if self.negative_ttl.is_zero() {
            return Err("negative_ttl must be greater than 0".to_string());
        }

        if self.flush_quiescence.is_zero() {
            return Err("flush_quiescence must be greater than 0".to_string());
        }

        if self.shutdown_grace.is_zero() {
            return Err("shutdown_grace must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Builder for cache configuration with validation
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    recency_capacity: Option<usize>,
    negative_ttl: Option<Duration>,
    flush_quiescence: Option<Duration>,
    shutdown_grace: Option<Duration>,
    track_stats: Option<bool>,
}

impl CacheConfigBuilder {
    /// Set the recency-cache capacity
    pub fn recency_capacity(mut self, capacity: usize) -> Self {
        self.recency_capacity = Some(capacity);
        self
    }

    /// Set the negative-cache time-to-live
    pub fn negative_ttl(mut self, ttl: Duration) -> Self {
        self.negative_ttl = Some(ttl);
        self
    }

    /// Set the access-count flush quiescence window
    pub fn flush_quiescence(mut self, window: Duration) -> Self {
        self.flush_quiescence = Some(window);
        self
    }

    /// Set the shutdown drain grace period
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    /// Enable or disable recency-cache statistics
    pub fn track_stats(mut self, enable: bool) -> Self {
        self.track_stats = Some(enable);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            recency_capacity: self.recency_capacity.unwrap_or(defaults.recency_capacity),
            negative_ttl: self.negative_ttl.unwrap_or(defaults.negative_ttl),
            flush_quiescence: self.flush_quiescence.unwrap_or(defaults.flush_quiescence),
            shutdown_grace: self.shutdown_grace.unwrap_or(defaults.shutdown_grace),
            track_stats: self.track_stats.unwrap_or(defaults.track_stats),
        }
    }
}

/// Preset configurations for common deployments
impl CacheConfig {
    /// Configuration for memory-constrained environments
    pub fn small() -> Self {
        Self {
            recency_capacity: 64,
            // 30 days
            negative_ttl: Duration::from_secs(30 * 24 * 3600),
            ..Default::default()
        }
    }

    /// Configuration for bulk pre-warming runs: a wider recency tier and a
    /// calmer flush cadence for sustained write bursts
    pub fn bulk() -> Self {
        Self {
            recency_capacity: 1024,
            // 180 days
            negative_ttl: Duration::from_secs(180 * 24 * 3600),
            flush_quiescence: Duration::from_secs(5),
            ..Default::default()
        }
    }
}

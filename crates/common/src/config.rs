//! Typed configuration for the indexing core.
//!
//! Unlike the knobs a long-running server reads from its environment, these
//! are plain constructor arguments: this is an embedded library, not a
//! process, so there is no environment to read from and no CLI to parse.
//! Every bound documented here is enforced in the constructor, returning an
//! [`errors::ErrorMetadata`]-tagged error rather than panicking, since a
//! caller-supplied config value is external input.

use std::time::Duration;

use errors::ErrorMetadata;

use crate::types::Durability;

/// Configuration for the [translog](https://docs.rs/translog) component.
#[derive(Clone, Copy, Debug)]
pub struct TranslogConfig {
    /// Default durability applied to a write when the caller doesn't
    /// override it per-request.
    pub durability: Durability,
    /// How often the background fsync task flushes the active generation
    /// when `durability` is [`Durability::Async`]. Must be positive.
    pub sync_interval: Duration,
    /// Roll to a new generation once the active one reaches this size.
    /// Must be positive.
    pub generation_threshold_bytes: u64,
    /// Secondary retention window: generations newer than this age are kept
    /// even if no commit or view references them, to widen the window for
    /// history-based peer recovery. `None` disables secondary retention.
    pub retention_age: Option<Duration>,
    /// Secondary retention window expressed as total retained bytes across
    /// all generations. `None` disables secondary retention by size.
    pub retention_size_bytes: Option<u64>,
}

impl Default for TranslogConfig {
    fn default() -> Self {
        Self {
            durability: Durability::Request,
            sync_interval: Duration::from_millis(5_000),
            generation_threshold_bytes: 64 * 1024 * 1024,
            retention_age: None,
            retention_size_bytes: None,
        }
    }
}

impl TranslogConfig {
    pub fn validated(self) -> anyhow::Result<Self> {
        if self.sync_interval.is_zero() {
            anyhow::bail!(ErrorMetadata::invalid_config(
                "translog.sync_interval_ms must be positive"
            ));
        }
        if self.generation_threshold_bytes == 0 {
            anyhow::bail!(ErrorMetadata::invalid_config(
                "translog.generation_threshold_bytes must be positive"
            ));
        }
        Ok(self)
    }
}

/// Configuration for the [`LiveVersionMap`](https://docs.rs/version_map).
#[derive(Clone, Copy, Debug)]
pub struct VersionMapConfig {
    /// Floor on how long a tombstone is retained before it becomes eligible
    /// for pruning, even once its seqNo is at or below the global
    /// checkpoint. Must be positive.
    pub tombstone_gc_interval: Duration,
}

impl Default for VersionMapConfig {
    fn default() -> Self {
        Self {
            tombstone_gc_interval: Duration::from_secs(60),
        }
    }
}

impl VersionMapConfig {
    pub fn validated(self) -> anyhow::Result<Self> {
        if self.tombstone_gc_interval.is_zero() {
            anyhow::bail!(ErrorMetadata::invalid_config(
                "version_map_gc_ms must be positive"
            ));
        }
        Ok(self)
    }
}

/// Configuration for the [`Engine`](https://docs.rs/engine).
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub translog: TranslogConfig,
    pub version_map: VersionMapConfig,
    /// Background refresh cadence. `None` disables the background timer;
    /// callers may still invoke `refresh()` manually.
    pub refresh_interval: Option<Duration>,
    /// How long `close()` waits for in-flight writes to drain before
    /// declaring the engine `Failed` regardless.
    pub close_drain_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            translog: TranslogConfig::default(),
            version_map: VersionMapConfig::default(),
            refresh_interval: Some(Duration::from_secs(1)),
            close_drain_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    pub fn validated(self) -> anyhow::Result<Self> {
        let translog = self.translog.validated()?;
        let version_map = self.version_map.validated()?;
        if let Some(interval) = self.refresh_interval {
            if interval.is_zero() {
                anyhow::bail!(ErrorMetadata::invalid_config(
                    "refresh_interval_ms must be positive when set; use None to disable"
                ));
            }
        }
        Ok(Self {
            translog,
            version_map,
            ..self
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_sync_interval() {
        let config = TranslogConfig {
            sync_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validated().is_err());
    }

    #[test]
    fn rejects_zero_generation_threshold() {
        let config = TranslogConfig {
            generation_threshold_bytes: 0,
            ..Default::default()
        };
        assert!(config.validated().is_err());
    }

    #[test]
    fn default_config_validates() {
        assert!(EngineConfig::default().validated().is_ok());
    }
}

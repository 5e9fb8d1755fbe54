//! Configuration for the WAL core.

use crate::error::{WalError, WalResult};
use crate::types::WalDuration;
use serde::{Deserialize, Serialize};

/// Default age after which a record becomes eligible for GC (7 days)
pub const DEFAULT_GC_EXPIRE: WalDuration = WalDuration::from_secs(7 * 24 * 60 * 60);

/// Default hard upper bound on the container size
pub const DEFAULT_MAX_LOG_SIZE: usize = 512;

/// Default soft lower bound below which GC never shrinks the container
pub const DEFAULT_GC_LOG_SIZE: usize = 128;

/// Tuning knobs of a [`crate::WalObject`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Records older than this are eligible for GC
    pub gc_expire_duration: WalDuration,

    /// Hard upper bound - GC runs unconditionally until the container fits
    pub max_log_size: usize,

    /// Soft lower bound - GC never shrinks the container below this
    pub gc_log_size: usize,

    /// Tolerate a failing action callback when the record's carried hash
    /// equals the locally computed chain hash. Lets a replica keep replaying
    /// a primary's stream even when local side effects fail.
    pub accept_log_when_hash_matched: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            gc_expire_duration: DEFAULT_GC_EXPIRE,
            max_log_size: DEFAULT_MAX_LOG_SIZE,
            gc_log_size: DEFAULT_GC_LOG_SIZE,
            accept_log_when_hash_matched: false,
        }
    }
}

impl WalConfig {
    /// Set the GC age threshold
    pub fn with_gc_expire_duration(mut self, duration: WalDuration) -> Self {
        self.gc_expire_duration = duration;
        self
    }

    /// Set the size bounds (hard maximum and soft GC floor)
    pub fn with_size_bounds(mut self, max_log_size: usize, gc_log_size: usize) -> Self {
        self.max_log_size = max_log_size;
        self.gc_log_size = gc_log_size;
        self
    }

    /// Tolerate failing actions when the chained hash matches
    pub fn with_accept_log_when_hash_matched(mut self, accept: bool) -> Self {
        self.accept_log_when_hash_matched = accept;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> WalResult<()> {
        if self.max_log_size > 0 && self.gc_log_size > self.max_log_size {
            return Err(WalError::invalid_param(
                "gc_log_size cannot be larger than max_log_size",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WalConfig::default();
        assert_eq!(config.max_log_size, 512);
        assert_eq!(config.gc_log_size, 128);
        assert!(!config.accept_log_when_hash_matched);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = WalConfig::default().with_size_bounds(8, 16);
        assert!(config.validate().is_err());

        // An unbounded container accepts any floor
        let config = WalConfig::default().with_size_bounds(0, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = WalConfig::default()
            .with_gc_expire_duration(WalDuration::from_secs(8))
            .with_size_bounds(8, 4)
            .with_accept_log_when_hash_matched(true);

        assert_eq!(config.gc_expire_duration, WalDuration::from_secs(8));
        assert_eq!(config.max_log_size, 8);
        assert_eq!(config.gc_log_size, 4);
        assert!(config.accept_log_when_hash_matched);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization_round_trip() {
        let config = WalConfig::default().with_size_bounds(64, 32);
        let encoded = serde_json::to_string(&config).unwrap();
        let decoded: WalConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.max_log_size, 64);
        assert_eq!(decoded.gc_log_size, 32);
    }
}

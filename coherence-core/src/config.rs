//! Coherence configuration.
//!
//! Loaded from environment variables with defaults suitable for development.

use crate::ConfigError;
use serde::{Deserialize, Serialize};

/// Configuration shared by the server and node sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoherenceConfig {
    // ========================================================================
    // Directory
    // ========================================================================
    /// Number of lock shards in the access directory.
    pub directory_shards: usize,

    // ========================================================================
    // Wire limits
    // ========================================================================
    /// Maximum number of entries in any array field of a request.
    pub max_batch_len: usize,

    /// Maximum length of one object value in bytes.
    pub max_value_len: usize,

    /// Maximum length of one binding name in bytes.
    pub max_name_len: usize,

    // ========================================================================
    // Server
    // ========================================================================
    /// Buffered applied-request events before slow subscribers lag.
    pub applied_feed_capacity: usize,

    /// Address the server binary listens on.
    pub listen_addr: String,
}

impl Default for CoherenceConfig {
    fn default() -> Self {
        Self {
            directory_shards: 64,
            max_batch_len: 65_536,
            max_value_len: 16 * 1024 * 1024, // 16 MiB
            max_name_len: 64 * 1024,
            applied_feed_capacity: 1024,
            listen_addr: "127.0.0.1:44540".to_string(),
        }
    }
}

impl CoherenceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config from environment variables.
    ///
    /// Environment variables:
    /// - `COHERENCE_DIRECTORY_SHARDS`: lock shards (default: 64)
    /// - `COHERENCE_MAX_BATCH_LEN`: array entries per field (default: 65536)
    /// - `COHERENCE_MAX_VALUE_LEN`: bytes per object value (default: 16 MiB)
    /// - `COHERENCE_MAX_NAME_LEN`: bytes per binding name (default: 64 KiB)
    /// - `COHERENCE_APPLIED_FEED_CAPACITY`: applied event buffer (default: 1024)
    /// - `COHERENCE_LISTEN_ADDR`: server listen address (default: 127.0.0.1:44540)
    ///
    /// Unparseable numbers fall back to the default; [`validate`](Self::validate)
    /// catches values that parse but make no sense.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            directory_shards: env_usize("COHERENCE_DIRECTORY_SHARDS")
                .unwrap_or(defaults.directory_shards),
            max_batch_len: env_usize("COHERENCE_MAX_BATCH_LEN").unwrap_or(defaults.max_batch_len),
            max_value_len: env_usize("COHERENCE_MAX_VALUE_LEN").unwrap_or(defaults.max_value_len),
            max_name_len: env_usize("COHERENCE_MAX_NAME_LEN").unwrap_or(defaults.max_name_len),
            applied_feed_capacity: env_usize("COHERENCE_APPLIED_FEED_CAPACITY")
                .unwrap_or(defaults.applied_feed_capacity),
            listen_addr: std::env::var("COHERENCE_LISTEN_ADDR").unwrap_or(defaults.listen_addr),
        }
    }

    pub fn with_directory_shards(mut self, shards: usize) -> Self {
        self.directory_shards = shards;
        self
    }

    pub fn with_max_batch_len(mut self, max: usize) -> Self {
        self.max_batch_len = max;
        self
    }

    pub fn with_max_value_len(mut self, max: usize) -> Self {
        self.max_value_len = max;
        self
    }

    pub fn with_max_name_len(mut self, max: usize) -> Self {
        self.max_name_len = max;
        self
    }

    pub fn with_applied_feed_capacity(mut self, capacity: usize) -> Self {
        self.applied_feed_capacity = capacity;
        self
    }

    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("directory_shards", self.directory_shards),
            ("max_batch_len", self.max_batch_len),
            ("max_value_len", self.max_value_len),
            ("max_name_len", self.max_name_len),
            ("applied_feed_capacity", self.applied_feed_capacity),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        // Lengths travel as i32 on the wire.
        for (field, value) in [
            ("max_batch_len", self.max_batch_len),
            ("max_value_len", self.max_value_len),
            ("max_name_len", self.max_name_len),
        ] {
            if value > i32::MAX as usize {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                    reason: "must fit in a 32-bit length prefix".to_string(),
                });
            }
        }
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "listen_addr".to_string(),
                value: self.listen_addr.clone(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(CoherenceConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_shards_rejected() {
        let config = CoherenceConfig::new().with_directory_shards(0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("directory_shards"));
    }

    #[test]
    fn test_oversized_limit_rejected() {
        let config = CoherenceConfig::new().with_max_value_len(i32::MAX as usize + 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builders() {
        let config = CoherenceConfig::new()
            .with_directory_shards(4)
            .with_max_batch_len(10)
            .with_max_name_len(32)
            .with_applied_feed_capacity(8)
            .with_listen_addr("0.0.0.0:9000");
        assert_eq!(config.directory_shards, 4);
        assert_eq!(config.max_batch_len, 10);
        assert_eq!(config.max_name_len, 32);
        assert_eq!(config.applied_feed_capacity, 8);
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
    }
}

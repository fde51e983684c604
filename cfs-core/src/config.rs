use crate::types::{CHUNK_SIZE, FLUSH_QUEUE_DEPTH, TRANSFER_UNIT};
use crate::{CfsError, Result};
use serde::{Deserialize, Serialize};

/// Client-side settings shared by every handle opened through one `Cfs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub metadata_addr: String,
    pub volume_manager_addr: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_flush_queue_depth")]
    pub flush_queue_depth: usize,
    #[serde(default = "default_transfer_unit")]
    pub transfer_unit: usize,
    /// Bytes a write handle buffers per chunk. Only test clusters lower it.
    #[serde(default = "default_chunk_capacity")]
    pub chunk_capacity: u64,
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_flush_queue_depth() -> usize {
    FLUSH_QUEUE_DEPTH
}

fn default_transfer_unit() -> usize {
    TRANSFER_UNIT
}

fn default_chunk_capacity() -> u64 {
    CHUNK_SIZE
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            metadata_addr: "127.0.0.1:10002".to_string(),
            volume_manager_addr: "127.0.0.1:10001".to_string(),
            connect_timeout_ms: default_connect_timeout_ms(),
            flush_queue_depth: default_flush_queue_depth(),
            transfer_unit: default_transfer_unit(),
            chunk_capacity: default_chunk_capacity(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.metadata_addr.trim().is_empty() {
            return Err(CfsError::Config(
                "metadata_addr cannot be empty".to_string(),
            ));
        }

        if self.volume_manager_addr.trim().is_empty() {
            return Err(CfsError::Config(
                "volume_manager_addr cannot be empty".to_string(),
            ));
        }

        if self.flush_queue_depth == 0 {
            return Err(CfsError::Config(
                "flush_queue_depth must be at least 1".to_string(),
            ));
        }

        if self.chunk_capacity == 0 || self.chunk_capacity > CHUNK_SIZE {
            return Err(CfsError::Config(format!(
                "chunk_capacity must be between 1 and {} bytes",
                CHUNK_SIZE
            )));
        }

        if self.transfer_unit == 0 {
            return Err(CfsError::Config(
                "transfer_unit must be at least 1 byte".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.flush_queue_depth, 16);
        assert_eq!(config.transfer_unit, 1024 * 1024);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"metadata_addr": "meta:1", "volume_manager_addr": "vol:2"}"#,
        )
        .unwrap();
        assert_eq!(config.connect_timeout_ms, 3_000);
        assert_eq!(config.flush_queue_depth, 16);
        assert_eq!(config.chunk_capacity, CHUNK_SIZE);
    }

    #[test]
    fn test_oversized_chunk_capacity_rejected() {
        let config = ClientConfig {
            chunk_capacity: CHUNK_SIZE + 1,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_queue_depth_rejected() {
        let config = ClientConfig {
            flush_queue_depth: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(config.validate(), Err(CfsError::Config(_))));
    }
}

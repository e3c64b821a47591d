//! Kernel configuration
//!
//! Loaded from camelCase JSON; every field has a default, so `{}` is a valid
//! configuration.

use crate::protocol::{HEADER_SIZE, MAX_DATA_LEN};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KernelConfig {
    /// Bytes of linear memory available for marshalling
    pub memory_limit: usize,
    /// Limit on owned overlay content; unlimited when absent
    pub overlay_quota: Option<u64>,
    /// Capacity of each tty ring buffer
    pub tty_buffer_size: usize,
    pub max_processes: usize,
    /// Where the browser host fetches the shadow manifest
    pub manifest_url: String,
    /// Delay between polls of a blocking call
    pub poll_interval_ms: u32,
    /// Polls before a blocking call gives up; 0 polls forever
    pub poll_attempts: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            memory_limit: 16 * 1024 * 1024,
            overlay_quota: None,
            tty_buffer_size: 4096,
            max_processes: 64,
            manifest_url: "/shadow-manifest.json".to_string(),
            poll_interval_ms: 16,
            poll_attempts: 64,
        }
    }
}

impl KernelConfig {
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        let config: KernelConfig = serde_json::from_slice(bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // a request and its response must fit side by side
        let min_memory = 2 * (HEADER_SIZE + MAX_DATA_LEN);
        if self.memory_limit < min_memory {
            return Err(ConfigError::Invalid {
                field: "memoryLimit",
                reason: format!("must be at least {} bytes", min_memory),
            });
        }
        if self.tty_buffer_size == 0 {
            return Err(ConfigError::Invalid {
                field: "ttyBufferSize",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.max_processes == 0 {
            return Err(ConfigError::Invalid {
                field: "maxProcesses",
                reason: "must allow at least init".to_string(),
            });
        }
        if self.manifest_url.is_empty() {
            return Err(ConfigError::Invalid {
                field: "manifestUrl",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

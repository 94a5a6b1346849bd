//! Centralized configuration for the Tether transport.
//!
//! [`TransportConfig`] holds the compile-time defaults; [`ChannelConfig`] is the
//! runtime configuration consumed by [`crate::Channel::open`], loadable from
//! JSON with every field optional.

use crate::error::{Result, TetherError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transport-level defaults.
pub struct TransportConfig;

impl TransportConfig {
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3);
    pub const WORKER_THREADS: usize = 8;
    pub const WORKER_QUEUE_CAPACITY: usize = 256;
    pub const WRITE_QUEUE_CAPACITY: usize = 1024;
    pub const MAX_PENDING: usize = 8192;
    pub const DEFAULT_SERIALIZER: u32 = crate::serializer::MESSAGE_PACK_ID;
}

/// Runtime configuration for a single channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Largest frame body accepted from the peer, in bytes.
    pub max_frame_size: usize,
    /// Timeout applied by `ClientProxy::call_default`, in milliseconds.
    pub default_timeout_ms: u64,
    /// Handlers executing concurrently.
    pub worker_threads: usize,
    /// Inbound requests allowed to wait for a worker.
    pub worker_queue_capacity: usize,
    /// Encoded frames buffered in front of the writer.
    pub write_queue_capacity: usize,
    /// Outstanding outgoing calls allowed at once.
    pub max_pending: usize,
    /// Serializer used for outgoing call arguments.
    pub default_serializer: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_frame_size: TransportConfig::MAX_FRAME_SIZE,
            default_timeout_ms: TransportConfig::DEFAULT_CALL_TIMEOUT.as_millis() as u64,
            worker_threads: TransportConfig::WORKER_THREADS,
            worker_queue_capacity: TransportConfig::WORKER_QUEUE_CAPACITY,
            write_queue_capacity: TransportConfig::WRITE_QUEUE_CAPACITY,
            max_pending: TransportConfig::MAX_PENDING,
            default_serializer: TransportConfig::DEFAULT_SERIALIZER,
        }
    }
}

impl ChannelConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| TetherError::Config {
            message: format!("Invalid channel configuration: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    pub fn with_worker_queue_capacity(mut self, capacity: usize) -> Self {
        self.worker_queue_capacity = capacity;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }

    pub fn with_default_serializer(mut self, id: u32) -> Self {
        self.default_serializer = id;
        self
    }

    /// The default call timeout as a `Duration`.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Reject configurations that would leave the channel unable to work.
    pub fn validate(&self) -> Result<()> {
        let zero_field = [
            ("max_frame_size", self.max_frame_size == 0),
            ("default_timeout_ms", self.default_timeout_ms == 0),
            ("worker_threads", self.worker_threads == 0),
            ("write_queue_capacity", self.write_queue_capacity == 0),
            ("max_pending", self.max_pending == 0),
        ]
        .into_iter()
        .find(|(_, is_zero)| *is_zero);

        if let Some((field, _)) = zero_field {
            return Err(TetherError::Config {
                message: format!("{} must be greater than zero", field),
            });
        }

        if self.max_frame_size > u32::MAX as usize {
            return Err(TetherError::Config {
                message: format!(
                    "max_frame_size {} exceeds the 32-bit length prefix",
                    self.max_frame_size
                ),
            });
        }

        Ok(())
    }
}

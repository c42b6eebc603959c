//! Tunable limits and timings for the GATT server.

use std::time::Duration;

use crate::ble::stack::{IoCapability, TxPower};

/// Largest attribute value the radio stack accepts.
pub const MAX_ATTR_LEN: usize = 600;

/// Bytes served per read response.
pub const READ_CHUNK_LEN: usize = 22;

/// Largest payload pushed by a single notification or indication.
pub const NOTIFY_MAX_LEN: usize = 20;

/// Configuration shared by the device, the server and every attribute it
/// creates.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GattConfig {
    /// Application id passed to app registration.
    pub app_id: u16,
    /// Upper bound on every wait for a completion event. `None` waits
    /// forever.
    pub response_timeout: Option<Duration>,
    /// Maximum attribute value length.
    pub max_attr_len: usize,
    /// Bytes served per read response.
    pub read_chunk_len: usize,
    /// Maximum bytes sent by notify/indicate.
    pub notify_max_len: usize,
    /// Transmit power applied during bring-up.
    pub tx_power: TxPower,
    /// Delay after bring-up before the stack is used.
    pub settle_delay: Duration,
    /// Pairing I/O capability.
    pub io_capability: IoCapability,
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            app_id: 0,
            response_timeout: Some(Duration::from_secs(5)),
            max_attr_len: MAX_ATTR_LEN,
            read_chunk_len: READ_CHUNK_LEN,
            notify_max_len: NOTIFY_MAX_LEN,
            tx_power: TxPower::P7,
            settle_delay: Duration::from_millis(300),
            io_capability: IoCapability::NoInputNoOutput,
        }
    }
}

impl GattConfig {
    /// Set the application id.
    pub fn with_app_id(mut self, app_id: u16) -> Self {
        self.app_id = app_id;
        self
    }

    /// Set the completion wait bound. `None` waits forever.
    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the maximum attribute length.
    pub fn with_max_attr_len(mut self, len: usize) -> Self {
        self.max_attr_len = len;
        self
    }

    /// Set the read chunk length. Zero is clamped to one.
    pub fn with_read_chunk_len(mut self, len: usize) -> Self {
        self.read_chunk_len = len.max(1);
        self
    }

    /// Set the notify/indicate payload limit.
    pub fn with_notify_max_len(mut self, len: usize) -> Self {
        self.notify_max_len = len;
        self
    }

    /// Set the transmit power.
    pub fn with_tx_power(mut self, power: TxPower) -> Self {
        self.tx_power = power;
        self
    }

    /// Set the post-init settle delay.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set the pairing I/O capability.
    pub fn with_io_capability(mut self, capability: IoCapability) -> Self {
        self.io_capability = capability;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GattConfig::default();
        assert_eq!(config.max_attr_len, 600);
        assert_eq!(config.read_chunk_len, 22);
        assert_eq!(config.notify_max_len, 20);
        assert_eq!(config.tx_power, TxPower::P7);
        assert_eq!(config.io_capability, IoCapability::NoInputNoOutput);
        assert_eq!(config.response_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_builder() {
        let config = GattConfig::default()
            .with_app_id(3)
            .with_response_timeout(None)
            .with_read_chunk_len(0)
            .with_settle_delay(Duration::ZERO);

        assert_eq!(config.app_id, 3);
        assert_eq!(config.response_timeout, None);
        assert_eq!(config.read_chunk_len, 1);
        assert_eq!(config.settle_delay, Duration::ZERO);
    }
}

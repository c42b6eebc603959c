//! Context shared by a server and every attribute it creates.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::ble::event::GattIf;
use crate::ble::stack::GattStack;
use crate::config::GattConfig;
use crate::error::{Error, Result};

/// Stack handle, configuration and connection bookkeeping of one server.
pub struct ServerLink {
    stack: Arc<dyn GattStack>,
    config: GattConfig,
    gatts_if: RwLock<Option<GattIf>>,
    conn_id: RwLock<Option<u16>>,
    connected: AtomicU32,
}

impl ServerLink {
    /// Create a link over `stack`.
    pub fn new(stack: Arc<dyn GattStack>, config: GattConfig) -> Self {
        Self {
            stack,
            config,
            gatts_if: RwLock::new(None),
            conn_id: RwLock::new(None),
            connected: AtomicU32::new(0),
        }
    }

    /// The radio stack.
    pub fn stack(&self) -> &dyn GattStack {
        self.stack.as_ref()
    }

    /// The configuration.
    pub fn config(&self) -> &GattConfig {
        &self.config
    }

    /// Bound on completion waits.
    pub fn timeout(&self) -> Option<Duration> {
        self.config.response_timeout
    }

    /// Interface id assigned at app registration.
    pub fn gatts_if(&self) -> Option<GattIf> {
        *self.gatts_if.read()
    }

    /// Interface id, or an error if the app is not registered.
    pub fn require_gatts_if(&self) -> Result<GattIf> {
        self.gatts_if().ok_or_else(|| Error::NotRegistered {
            what: "GATT application".to_string(),
        })
    }

    pub(crate) fn set_gatts_if(&self, gatts_if: Option<GattIf>) {
        *self.gatts_if.write() = gatts_if;
    }

    /// Id of the most recent connection.
    pub fn conn_id(&self) -> Option<u16> {
        *self.conn_id.read()
    }

    /// Number of connected peers.
    pub fn connected_count(&self) -> u32 {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn on_connect(&self, conn_id: u16) -> u32 {
        *self.conn_id.write() = Some(conn_id);
        self.connected.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn on_disconnect(&self) -> u32 {
        let previous = self
            .connected
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }
}

impl std::fmt::Debug for ServerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerLink")
            .field("gatts_if", &self.gatts_if())
            .field("conn_id", &self.conn_id())
            .field("connected", &self.connected_count())
            .finish()
    }
}

//! The GATT server.
//!
//! A server owns its services and the advertiser, registers itself as a
//! GATT application and keeps the connection bookkeeping. Every server
//! event reaches the services first and the server's own handling second.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::ble::advertising::Advertising;
use crate::ble::event::{GapEvent, GattIf, GattStatus, GattsEvent};
use crate::ble::stack::GattStack;
use crate::ble::uuid::BleUuid;
use crate::config::GattConfig;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::gatt::connection::{format_address, ConnectionEvent, ConnectionState};
use crate::gatt::link::ServerLink;
use crate::gatt::service::Service;
use crate::gatt::signal::Rendezvous;

/// Default inactivity and existence limit.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// When a server has been idle long enough to be torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IdlePolicy {
    /// Limit since the last client read or write, once a client was active.
    pub client_inactivity: Duration,
    /// Limit since server creation while no client was ever active.
    pub server_existence: Duration,
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self {
            client_inactivity: DEFAULT_IDLE_TIMEOUT,
            server_existence: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// A GATT server.
pub struct Server {
    link: Arc<ServerLink>,
    services: RwLock<Vec<Arc<Service>>>,
    advertising: Advertising,
    registered: Rendezvous<GattStatus>,
    bound: AtomicBool,
    last_client_activity: RwLock<Option<Instant>>,
    created_at: Instant,
    connection_tx: broadcast::Sender<ConnectionEvent>,
}

impl Server {
    /// Create a server on `stack`.
    pub fn new(stack: Arc<dyn GattStack>, config: GattConfig) -> Arc<Self> {
        let (connection_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            advertising: Advertising::new(stack.clone()),
            link: Arc::new(ServerLink::new(stack, config)),
            services: RwLock::new(Vec::new()),
            registered: Rendezvous::new("app registration"),
            bound: AtomicBool::new(false),
            last_client_activity: RwLock::new(None),
            created_at: Instant::now(),
            connection_tx,
        })
    }

    /// Find a service by UUID.
    pub fn service_find(&self, uuid: &BleUuid) -> Option<Arc<Service>> {
        self.services
            .read()
            .iter()
            .find(|s| s.uuid() == uuid)
            .cloned()
    }

    /// Find a service by UUID, creating it if needed.
    pub fn service_create(&self, uuid: impl Into<BleUuid>) -> Arc<Service> {
        let uuid = uuid.into();
        let mut services = self.services.write();
        if let Some(existing) = services.iter().find(|s| *s.uuid() == uuid) {
            return existing.clone();
        }

        debug!(%uuid, "Creating service");
        let service = Arc::new(Service::new(uuid, self.link.clone()));
        services.push(service.clone());
        service
    }

    /// Adopt a service built for this server. Returns the service now
    /// registered under that UUID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidParameter`] if the service was built for a
    /// different server.
    pub fn service_add_existing(&self, service: Arc<Service>) -> Result<Arc<Service>> {
        if !service.belongs_to(&self.link) {
            return Err(Error::InvalidParameter {
                name: "service".to_string(),
                value: service.uuid().to_string(),
            });
        }

        let mut services = self.services.write();
        if let Some(existing) = services.iter().find(|s| s.uuid() == service.uuid()) {
            return Ok(existing.clone());
        }
        services.push(service.clone());
        Ok(service)
    }

    /// Services in insertion order.
    pub fn services(&self) -> Vec<Arc<Service>> {
        self.services.read().clone()
    }

    /// Bind this server to `device` and register the GATT application.
    ///
    /// Advertising starts as soon as the registration completes.
    ///
    /// # Errors
    ///
    /// - [`Error::DeviceNotReady`] if the device is not initialized
    /// - [`Error::ServerAlreadyBound`] if the device serves another server
    /// - [`Error::Stack`], [`Error::AttributeRejected`] or [`Error::Timeout`]
    ///   if the registration fails
    pub async fn init(self: &Arc<Self>, device: &Device) -> Result<()> {
        device.attach_server(self)?;

        let result = self.register_app().await;
        if result.is_err() {
            device.detach_server(self);
        }
        result
    }

    async fn register_app(&self) -> Result<()> {
        let app_id = self.link.config().app_id;
        info!(app_id, "Registering GATT application");

        let pending = self.registered.arm();
        self.link
            .stack()
            .register_app(app_id)
            .map_err(|code| {
                error!("register_app failed: {}", code);
                Error::stack("register_app", code)
            })?;

        let status = pending.wait(self.link.timeout()).await?;
        if !status.is_ok() {
            error!(%status, "GATT application rejected");
            return Err(Error::AttributeRejected {
                uuid: format!("app {}", app_id),
                status,
            });
        }
        Ok(())
    }

    /// Register and start every service, one after another.
    ///
    /// # Errors
    ///
    /// Returns the first service error; later services are not started.
    pub async fn start(&self) -> Result<()> {
        for service in self.services() {
            service.start().await?;
        }
        Ok(())
    }

    /// Unregister the GATT application and drop every service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stack`] if unregistering fails; the services are
    /// dropped regardless.
    pub fn deinit(&self) -> Result<()> {
        self.services.write().clear();
        self.bound.store(false, Ordering::SeqCst);

        let Some(gatts_if) = self.link.gatts_if() else {
            return Ok(());
        };
        self.link.set_gatts_if(None);
        info!(gatts_if, "Unregistering GATT application");
        self.link
            .stack()
            .unregister_app(gatts_if)
            .map_err(|code| Error::stack("unregister_app", code))
    }

    /// The advertiser.
    pub fn advertising(&self) -> &Advertising {
        &self.advertising
    }

    /// Number of connected peers.
    pub fn connected_count(&self) -> u32 {
        self.link.connected_count()
    }

    /// Id of the most recent connection.
    pub fn conn_id(&self) -> Option<u16> {
        self.link.conn_id()
    }

    /// Interface id assigned at registration.
    pub fn gatts_if(&self) -> Option<GattIf> {
        self.link.gatts_if()
    }

    /// Whether the GATT application is registered.
    pub fn is_registered(&self) -> bool {
        self.link.gatts_if().is_some()
    }

    /// The configuration.
    pub fn config(&self) -> &GattConfig {
        self.link.config()
    }

    /// Time of the last client read or write, if any.
    pub fn last_client_activity(&self) -> Option<Instant> {
        *self.last_client_activity.read()
    }

    /// Time the server was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Whether the server has been idle longer than `policy` allows.
    ///
    /// Once a client was active, idleness counts from its last read or
    /// write; before that, from server creation.
    pub fn is_idle_expired(&self, policy: &IdlePolicy) -> bool {
        match self.last_client_activity() {
            Some(last) => last.elapsed() > policy.client_inactivity,
            None => self.created_at.elapsed() > policy.server_existence,
        }
    }

    /// Subscribe to connection changes.
    pub fn subscribe_connections(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection_tx.subscribe()
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.bound.load(Ordering::SeqCst)
    }

    pub(crate) fn set_bound(&self, bound: bool) {
        self.bound.store(bound, Ordering::SeqCst);
    }

    /// Handle a GAP event.
    pub(crate) fn handle_gap_event(&self, event: &GapEvent) {
        trace!(?event, "GAP event");
        self.advertising.handle_gap_event(event);
    }

    /// Handle a server event delivered on interface `gatts_if`.
    pub(crate) fn handle_event(&self, gatts_if: GattIf, event: &GattsEvent) {
        if let Some(own) = self.link.gatts_if() {
            if own != gatts_if {
                trace!(gatts_if, own, event = event.name(), "Event for another interface");
                return;
            }
        }
        debug!(gatts_if, event = event.name(), "Server event");

        for service in self.services() {
            service.handle_event(gatts_if, event);
        }

        match event {
            GattsEvent::Register {
                status,
                app_id,
                gatts_if: assigned,
            } if *app_id == self.link.config().app_id => {
                if status.is_ok() {
                    self.link.set_gatts_if(Some(*assigned));
                    info!(gatts_if = assigned, "GATT application registered");
                }
                self.registered.signal(*status);
                if status.is_ok() {
                    self.start_advertising();
                }
            }

            GattsEvent::ServiceCreated { service_uuid, .. } => {
                if self.service_find(service_uuid).is_none() {
                    warn!(uuid = %service_uuid, "Service created with unknown UUID");
                }
            }

            GattsEvent::Connect { conn_id, remote } => {
                let count = self.link.on_connect(*conn_id);
                self.touch();
                info!(conn_id, remote = %format_address(remote), count, "Peer connected");
                if let Err(e) = self.advertising.stop() {
                    error!("Failed to stop advertising: {}", e);
                }
                self.broadcast(*conn_id, *remote, ConnectionState::Connected, count);
            }

            GattsEvent::Disconnect { conn_id, remote } => {
                let count = self.link.on_disconnect();
                info!(conn_id, remote = %format_address(remote), count, "Peer disconnected");
                self.start_advertising();
                self.broadcast(*conn_id, *remote, ConnectionState::Disconnected, count);
            }

            GattsEvent::Read { .. } | GattsEvent::Write { .. } => self.touch(),

            _ => {}
        }
    }

    fn touch(&self) {
        *self.last_client_activity.write() = Some(Instant::now());
    }

    fn start_advertising(&self) {
        if let Err(e) = self.advertising.start() {
            error!("Failed to start advertising: {}", e);
        }
    }

    fn broadcast(
        &self,
        conn_id: u16,
        remote: [u8; 6],
        state: ConnectionState,
        connected_count: u32,
    ) {
        // No subscribers is fine.
        let _ = self.connection_tx.send(ConnectionEvent {
            conn_id,
            remote,
            state,
            connected_count,
        });
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("link", &self.link)
            .field("services", &self.services.read().len())
            .field("bound", &self.is_bound())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::stack::MockGattStack;

    fn server(stack: MockGattStack) -> Arc<Server> {
        Server::new(Arc::new(stack), GattConfig::default())
    }

    #[test]
    fn test_service_create_is_idempotent() {
        let server = server(MockGattStack::new());
        let a = server.service_create(0xAFFFu16);
        let b = server.service_create(0xAFFFu16);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(server.services().len(), 1);
        assert!(server.service_find(&BleUuid::from_u16(0x180A)).is_none());
    }

    #[test]
    fn test_service_add_existing() {
        let server = server(MockGattStack::new());
        let other = Server::new(Arc::new(MockGattStack::new()), GattConfig::default());

        let created = server.service_create(0xAFFFu16);
        assert!(Arc::ptr_eq(
            &server.service_add_existing(created.clone()).unwrap(),
            &created
        ));

        let foreign = other.service_create(0x180Au16);
        assert!(matches!(
            server.service_add_existing(foreign),
            Err(Error::InvalidParameter { .. })
        ));
        assert_eq!(server.services().len(), 1);
    }

    #[test]
    fn test_connection_bookkeeping() {
        let mut stack = MockGattStack::new();
        stack.expect_stop_advertising().times(1).returning(|| Ok(()));
        stack.expect_set_advertising_data().times(1).returning(|_, _| Ok(()));
        stack.expect_start_advertising().times(1).returning(|_| Ok(()));
        let server = server(stack);
        let mut rx = server.subscribe_connections();
        let remote = [1, 2, 3, 4, 5, 6];

        server.handle_event(0, &GattsEvent::Connect { conn_id: 7, remote });
        assert_eq!(server.connected_count(), 1);
        assert_eq!(server.conn_id(), Some(7));
        assert!(server.last_client_activity().is_some());

        server.handle_event(0, &GattsEvent::Disconnect { conn_id: 7, remote });
        assert_eq!(server.connected_count(), 0);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.state, ConnectionState::Connected);
        assert_eq!(first.connected_count, 1);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_foreign_interface_ignored() {
        let server = server(MockGattStack::new());
        server.link.set_gatts_if(Some(3));

        server.handle_event(
            4,
            &GattsEvent::Connect {
                conn_id: 1,
                remote: [0; 6],
            },
        );
        assert_eq!(server.connected_count(), 0);
    }

    #[test]
    fn test_deinit_unregisters() {
        let mut stack = MockGattStack::new();
        stack
            .expect_unregister_app()
            .withf(|gatts_if| *gatts_if == 3)
            .times(1)
            .returning(|_| Ok(()));
        let server = server(stack);
        server.service_create(0xAFFFu16);
        server.link.set_gatts_if(Some(3));

        server.deinit().unwrap();
        assert!(!server.is_registered());
        assert!(server.services().is_empty());
        // Second call has nothing to unregister.
        server.deinit().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_policy() {
        let mut stack = MockGattStack::new();
        stack.expect_stop_advertising().returning(|| Ok(()));
        let server = server(stack);
        let policy = IdlePolicy::default();

        tokio::time::advance(Duration::from_secs(179)).await;
        assert!(!server.is_idle_expired(&policy));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(server.is_idle_expired(&policy));

        // A client resets the clock to its own activity.
        server.handle_event(
            0,
            &GattsEvent::Connect {
                conn_id: 0,
                remote: [0; 6],
            },
        );
        assert!(!server.is_idle_expired(&policy));
        tokio::time::advance(Duration::from_secs(181)).await;
        assert!(server.is_idle_expired(&policy));
    }
}

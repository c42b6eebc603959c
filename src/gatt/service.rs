//! GATT services.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::ble::event::{AttrHandle, GattIf, GattStatus, GattsEvent};
use crate::ble::uuid::BleUuid;
use crate::error::{Error, Result};
use crate::gatt::characteristic::Characteristic;
use crate::gatt::link::ServerLink;
use crate::gatt::signal::Rendezvous;

/// Handles reserved for the service declaration plus slack.
const BASE_HANDLES: u16 = 4;
/// Handles consumed by each characteristic (declaration and value).
const HANDLES_PER_CHARACTERISTIC: u16 = 2;

/// A primary service and its characteristics.
pub struct Service {
    uuid: BleUuid,
    link: Arc<ServerLink>,
    handle: RwLock<Option<AttrHandle>>,
    characteristics: RwLock<Vec<Arc<Characteristic>>>,
    /// Characteristic whose registration is in progress. Descriptor-added
    /// events carry no characteristic id, so registration must stay
    /// strictly sequential for this to identify their owner.
    last_created: RwLock<Option<BleUuid>>,
    started: AtomicBool,
    created: Rendezvous<GattStatus>,
    start_confirmed: Rendezvous<GattStatus>,
}

impl Service {
    pub(crate) fn new(uuid: BleUuid, link: Arc<ServerLink>) -> Self {
        Self {
            uuid,
            link,
            handle: RwLock::new(None),
            characteristics: RwLock::new(Vec::new()),
            last_created: RwLock::new(None),
            started: AtomicBool::new(false),
            created: Rendezvous::new("service created"),
            start_confirmed: Rendezvous::new("service started"),
        }
    }

    /// UUID of this service.
    pub fn uuid(&self) -> &BleUuid {
        &self.uuid
    }

    /// Handle assigned by the stack, once created.
    pub fn handle(&self) -> Option<AttrHandle> {
        *self.handle.read()
    }

    pub(crate) fn belongs_to(&self, link: &Arc<ServerLink>) -> bool {
        Arc::ptr_eq(&self.link, link)
    }

    /// Whether the stack confirmed the service start.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Characteristics in insertion order.
    pub fn characteristics(&self) -> Vec<Arc<Characteristic>> {
        self.characteristics.read().clone()
    }

    /// Find a characteristic by UUID.
    pub fn char_find(&self, uuid: &BleUuid) -> Option<Arc<Characteristic>> {
        self.characteristics
            .read()
            .iter()
            .find(|c| c.uuid() == uuid)
            .cloned()
    }

    /// Find a characteristic by UUID, creating it if needed.
    pub fn char_create(&self, uuid: impl Into<BleUuid>) -> Arc<Characteristic> {
        let uuid = uuid.into();
        let mut characteristics = self.characteristics.write();
        if let Some(existing) = characteristics.iter().find(|c| *c.uuid() == uuid) {
            return existing.clone();
        }

        let characteristic = Arc::new(Characteristic::new(uuid, self.link.clone()));
        characteristics.push(characteristic.clone());
        characteristic
    }

    /// Number of attribute handles reserved when the service is created:
    /// four plus two per characteristic.
    pub fn num_handles(&self) -> u16 {
        let count = u16::try_from(self.characteristics.read().len()).unwrap_or(u16::MAX);
        BASE_HANDLES.saturating_add(HANDLES_PER_CHARACTERISTIC.saturating_mul(count))
    }

    /// Register the service, its characteristics and their descriptors in
    /// order, then start it.
    ///
    /// # Errors
    ///
    /// - [`Error::NotRegistered`] if the GATT application is not registered
    /// - [`Error::AlreadyRegistered`] if the service was already created
    /// - [`Error::Stack`], [`Error::AttributeRejected`] or [`Error::Timeout`]
    ///   from any registration step
    pub async fn start(&self) -> Result<()> {
        info!(uuid = %self.uuid, "Starting service");

        let handle = self.execute_create().await?;

        let registered = self.create_characteristics(handle).await;
        *self.last_created.write() = None;
        registered?;

        let pending = self.start_confirmed.arm();
        self.link
            .stack()
            .start_service(handle)
            .map_err(|code| {
                error!(uuid = %self.uuid, "start_service failed: {}", code);
                Error::stack("start_service", code)
            })?;

        let status = pending.wait(self.link.timeout()).await?;
        if !status.is_ok() {
            error!(uuid = %self.uuid, %status, "Service start rejected");
            return Err(Error::AttributeRejected {
                uuid: self.uuid.to_string(),
                status,
            });
        }

        self.started.store(true, Ordering::SeqCst);
        info!(uuid = %self.uuid, handle, "Service started");
        Ok(())
    }

    async fn execute_create(&self) -> Result<AttrHandle> {
        if self.handle().is_some() {
            error!(uuid = %self.uuid, "Service already has a handle");
            return Err(Error::AlreadyRegistered {
                uuid: self.uuid.to_string(),
            });
        }

        let gatts_if = self.link.require_gatts_if()?;
        let num_handles = self.num_handles();
        debug!(uuid = %self.uuid, num_handles, "Creating service");

        let pending = self.created.arm();
        self.link
            .stack()
            .create_service(gatts_if, &self.uuid, true, num_handles)
            .map_err(|code| {
                error!(uuid = %self.uuid, "create_service failed: {}", code);
                Error::stack("create_service", code)
            })?;

        let status = pending.wait(self.link.timeout()).await?;
        if !status.is_ok() {
            error!(uuid = %self.uuid, %status, "Service rejected");
            return Err(Error::AttributeRejected {
                uuid: self.uuid.to_string(),
                status,
            });
        }

        self.handle().ok_or_else(|| Error::NotRegistered {
            what: format!("service {}", self.uuid),
        })
    }

    async fn create_characteristics(&self, handle: AttrHandle) -> Result<()> {
        for characteristic in self.characteristics() {
            *self.last_created.write() = Some(*characteristic.uuid());
            characteristic.execute_create(handle).await?;
        }
        Ok(())
    }

    /// Handle a server event, then hand it to every characteristic.
    pub(crate) fn handle_event(&self, gatts_if: GattIf, event: &GattsEvent) {
        match event {
            GattsEvent::ServiceCreated {
                status,
                service_handle,
                service_uuid,
            } if *service_uuid == self.uuid && self.created.is_armed() => {
                if status.is_ok() {
                    *self.handle.write() = Some(*service_handle);
                }
                debug!(uuid = %self.uuid, service_handle, %status, "Service created");
                self.created.signal(*status);
            }

            GattsEvent::ServiceStarted {
                status,
                service_handle,
            } if Some(*service_handle) == self.handle() => {
                self.start_confirmed.signal(*status);
            }

            GattsEvent::CharacteristicAdded {
                service_handle,
                char_uuid,
                ..
            } if Some(*service_handle) == self.handle() => {
                if self.char_find(char_uuid).is_none() {
                    warn!(service = %self.uuid, uuid = %char_uuid, "Added characteristic is unknown");
                }
            }

            _ => {}
        }

        let registering = *self.last_created.read();
        for characteristic in self.characteristics() {
            characteristic.handle_event(gatts_if, event, registering.as_ref());
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.handle() {
            Some(handle) => write!(f, "UUID: {}, handle: 0x{:02x}", self.uuid, handle),
            None => write!(f, "UUID: {}, handle: none", self.uuid),
        }
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("uuid", &self.uuid)
            .field("handle", &self.handle())
            .field("characteristics", &self.characteristics.read().len())
            .field("started", &self.is_started())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::stack::MockGattStack;
    use crate::config::GattConfig;

    fn service(stack: MockGattStack) -> Service {
        let link = Arc::new(ServerLink::new(Arc::new(stack), GattConfig::default()));
        link.set_gatts_if(Some(3));
        Service::new(BleUuid::from_u16(0xAFFF), link)
    }

    #[test]
    fn test_char_create_is_idempotent() {
        let s = service(MockGattStack::new());
        let a = s.char_create(0xAF01u16);
        let b = s.char_create(BleUuid::from_u16(0xAF01).to_128());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(s.characteristics().len(), 1);
        assert!(s.char_find(&BleUuid::from_u16(0xAF02)).is_none());
    }

    #[test]
    fn test_num_handles() {
        let s = service(MockGattStack::new());
        assert_eq!(s.num_handles(), 4);
        for n in 0..5u16 {
            s.char_create(0xAF01 + n);
        }
        assert_eq!(s.num_handles(), 14);
    }

    #[tokio::test]
    async fn test_start_requires_registration() {
        let link = Arc::new(ServerLink::new(
            Arc::new(MockGattStack::new()),
            GattConfig::default(),
        ));
        let s = Service::new(BleUuid::from_u16(0xAFFF), link);

        assert!(matches!(s.start().await, Err(Error::NotRegistered { .. })));
    }

    #[tokio::test]
    async fn test_create_failure_leaves_nothing_armed() {
        let mut stack = MockGattStack::new();
        stack
            .expect_create_service()
            .withf(|gatts_if, _, primary, num_handles| {
                *gatts_if == 3 && *primary && *num_handles == 6
            })
            .times(1)
            .returning(|_, _, _, _| Err(crate::ble::stack::StackError::INVALID_STATE));
        let s = service(stack);
        s.char_create(0xAF01u16);

        assert!(matches!(
            s.start().await,
            Err(Error::Stack {
                operation: "create_service",
                ..
            })
        ));
        assert!(!s.created.is_armed());
        assert_eq!(s.handle(), None);
    }

    #[test]
    fn test_foreign_service_created_ignored() {
        let s = service(MockGattStack::new());
        let _pending = s.created.arm();
        s.handle_event(
            3,
            &GattsEvent::ServiceCreated {
                status: GattStatus::OK,
                service_handle: 40,
                service_uuid: BleUuid::from_u16(0x180A),
            },
        );
        assert_eq!(s.handle(), None);
        assert!(s.created.is_armed());
    }
}

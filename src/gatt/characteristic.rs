//! GATT characteristics.
//!
//! A characteristic owns its value, its property flags and an ordered list
//! of descriptors. It answers reads (serving long values in chunks), applies
//! writes (directly or through a prepare/execute transaction) and pushes its
//! value to the connected peer with [`notify`](Characteristic::notify) or
//! [`indicate`](Characteristic::indicate).

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, error, info, trace, warn};

use crate::ble::event::{AttrHandle, ExecWriteFlag, GattIf, GattStatus, GattsEvent};
use crate::ble::stack::GattResponse;
use crate::ble::uuid::BleUuid;
use crate::ble::uuids::CLIENT_CHARACTERISTIC_CONFIG_UUID;
use crate::error::{Error, Result};
use crate::gatt::descriptor::Descriptor;
use crate::gatt::link::ServerLink;
use crate::gatt::properties::{Permissions, Properties};
use crate::gatt::signal::Rendezvous;
use crate::gatt::value::CharacteristicValue;

/// Application hooks invoked around peer access.
///
/// Both methods run on the event-dispatch task with no lock held, so they
/// may call back into the characteristic (for example `set_value` from
/// `before_read`).
pub trait CharacteristicCallbacks: Send + Sync {
    /// Called before a read request is answered.
    fn before_read(&self, _characteristic: &Characteristic) {}

    /// Called after a write (or an executed prepared write) was applied.
    fn after_write(&self, _characteristic: &Characteristic) {}
}

type Hook = Box<dyn Fn(&Characteristic) + Send + Sync>;

/// Closure-based [`CharacteristicCallbacks`].
///
/// ```rust
/// use smart_alert_gatt::gatt::Callbacks;
///
/// let callbacks = Callbacks::new()
///     .on_before_read(|c| {
///         let _ = c.set_value(b"fresh");
///     })
///     .on_after_write(|c| println!("written: {:?}", c.value()));
/// ```
#[derive(Default)]
pub struct Callbacks {
    before_read: Option<Hook>,
    after_write: Option<Hook>,
}

impl Callbacks {
    /// Create callbacks that do nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the before-read hook.
    pub fn on_before_read<F>(mut self, f: F) -> Self
    where
        F: Fn(&Characteristic) + Send + Sync + 'static,
    {
        self.before_read = Some(Box::new(f));
        self
    }

    /// Set the after-write hook.
    pub fn on_after_write<F>(mut self, f: F) -> Self
    where
        F: Fn(&Characteristic) + Send + Sync + 'static,
    {
        self.after_write = Some(Box::new(f));
        self
    }
}

impl CharacteristicCallbacks for Callbacks {
    fn before_read(&self, characteristic: &Characteristic) {
        if let Some(f) = &self.before_read {
            f(characteristic);
        }
    }

    fn after_write(&self, characteristic: &Characteristic) {
        if let Some(f) = &self.after_write {
            f(characteristic);
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("before_read", &self.before_read.is_some())
            .field("after_write", &self.after_write.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct CharacteristicState {
    handle: Option<AttrHandle>,
    service_handle: Option<AttrHandle>,
    properties: Properties,
    value: CharacteristicValue,
}

/// A characteristic of a [`Service`](crate::gatt::Service).
pub struct Characteristic {
    uuid: BleUuid,
    link: Arc<ServerLink>,
    state: RwLock<CharacteristicState>,
    descriptors: RwLock<Vec<Arc<Descriptor>>>,
    callbacks: RwLock<Option<Arc<dyn CharacteristicCallbacks>>>,
    created: Rendezvous<GattStatus>,
    confirmed: Rendezvous<GattStatus>,
}

impl Characteristic {
    pub(crate) fn new(uuid: BleUuid, link: Arc<ServerLink>) -> Self {
        let max_len = link.config().max_attr_len;
        Self {
            uuid,
            link,
            state: RwLock::new(CharacteristicState {
                handle: None,
                service_handle: None,
                properties: Properties::NONE,
                value: CharacteristicValue::new(max_len),
            }),
            descriptors: RwLock::new(Vec::new()),
            callbacks: RwLock::new(None),
            created: Rendezvous::new("characteristic added"),
            confirmed: Rendezvous::new("indicate confirmation"),
        }
    }

    /// UUID of this characteristic.
    pub fn uuid(&self) -> &BleUuid {
        &self.uuid
    }

    /// Handle assigned by the stack, once registered.
    pub fn handle(&self) -> Option<AttrHandle> {
        self.state.read().handle
    }

    /// Handle of the owning service, once registration started.
    pub fn service_handle(&self) -> Option<AttrHandle> {
        self.state.read().service_handle
    }

    /// Current properties.
    pub fn properties(&self) -> Properties {
        self.state.read().properties
    }

    /// Replace every property flag from an application mask
    /// (see [`mask`](crate::gatt::properties::mask)).
    pub fn set_properties(&self, mask: u32) {
        self.state.write().properties = Properties::from_app_mask(mask);
    }

    fn set_property(&self, flag: Properties, enabled: bool) {
        self.state.write().properties.set(flag, enabled);
    }

    /// Set or clear the read property.
    pub fn set_read_property(&self, enabled: bool) {
        self.set_property(Properties::READ, enabled);
    }

    /// Set or clear the write property.
    pub fn set_write_property(&self, enabled: bool) {
        self.set_property(Properties::WRITE, enabled);
    }

    /// Set or clear the write-without-response property.
    pub fn set_write_nr_property(&self, enabled: bool) {
        self.set_property(Properties::WRITE_NR, enabled);
    }

    /// Set or clear the notify property.
    pub fn set_notify_property(&self, enabled: bool) {
        self.set_property(Properties::NOTIFY, enabled);
    }

    /// Set or clear the indicate property.
    pub fn set_indicate_property(&self, enabled: bool) {
        self.set_property(Properties::INDICATE, enabled);
    }

    /// Set or clear the broadcast property.
    pub fn set_broadcast_property(&self, enabled: bool) {
        self.set_property(Properties::BROADCAST, enabled);
    }

    /// Find a descriptor by UUID.
    pub fn desc_find(&self, uuid: &BleUuid) -> Option<Arc<Descriptor>> {
        self.descriptors
            .read()
            .iter()
            .find(|d| d.uuid() == uuid)
            .cloned()
    }

    /// Find a descriptor by UUID, creating it if needed.
    pub fn desc_create(&self, uuid: impl Into<BleUuid>) -> Arc<Descriptor> {
        let uuid = uuid.into();
        let mut descriptors = self.descriptors.write();
        if let Some(existing) = descriptors.iter().find(|d| *d.uuid() == uuid) {
            return existing.clone();
        }

        let capacity = self.link.config().max_attr_len;
        let descriptor = Arc::new(Descriptor::with_capacity(uuid, capacity));
        descriptors.push(descriptor.clone());
        descriptor
    }

    /// Attach an externally built descriptor.
    ///
    /// A descriptor built with [`Descriptor::new`] takes on the configured
    /// `max_attr_len`; an explicit capacity is kept.
    ///
    /// Returns the attached descriptor, or the existing one if a descriptor
    /// with the same UUID is already attached.
    pub fn desc_add(&self, descriptor: impl Into<Arc<Descriptor>>) -> Arc<Descriptor> {
        let descriptor = descriptor.into();
        let mut descriptors = self.descriptors.write();
        if let Some(existing) = descriptors.iter().find(|d| d.uuid() == descriptor.uuid()) {
            debug!(uuid = %descriptor.uuid(), "Descriptor already attached");
            return existing.clone();
        }
        descriptor.apply_default_limit(self.link.config().max_attr_len);
        descriptors.push(descriptor.clone());
        descriptor
    }

    /// Attached descriptors in insertion order.
    pub fn descriptors(&self) -> Vec<Arc<Descriptor>> {
        self.descriptors.read().clone()
    }

    /// Install the access hooks.
    pub fn set_callbacks(&self, callbacks: impl CharacteristicCallbacks + 'static) {
        *self.callbacks.write() = Some(Arc::new(callbacks));
    }

    /// Remove the access hooks.
    pub fn clear_callbacks(&self) {
        *self.callbacks.write() = None;
    }

    /// The committed value.
    pub fn value(&self) -> Bytes {
        self.state.read().value.value()
    }

    /// Replace the committed value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValueTooLong`] and keeps the old value if `data`
    /// exceeds the maximum attribute length.
    pub fn set_value(&self, data: &[u8]) -> Result<()> {
        self.state.write().value.set_value(data).map_err(|e| {
            error!(uuid = %self.uuid, "{}", e);
            e
        })
    }

    /// Send the value to the connected peer as an indication and wait for
    /// the peer's confirmation.
    ///
    /// Does nothing when no peer is connected or when a client
    /// configuration descriptor is attached with indications disabled. At
    /// most `notify_max_len` bytes are sent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stack`] if the send fails and [`Error::Timeout`] if
    /// no confirmation arrives in time.
    pub async fn indicate(&self) -> Result<()> {
        let Some((gatts_if, conn_id, handle, payload)) = self.push_target(true)? else {
            return Ok(());
        };

        let pending = self.confirmed.arm();
        self.link
            .stack()
            .send_indicate(gatts_if, conn_id, handle, &payload, true)
            .map_err(|code| {
                error!(uuid = %self.uuid, "send_indicate failed: {}", code);
                Error::stack("send_indicate", code)
            })?;

        let status = pending.wait(self.link.timeout()).await?;
        if !status.is_ok() {
            warn!(uuid = %self.uuid, %status, "Indication confirmed with failure status");
        }
        Ok(())
    }

    /// Send the value to the connected peer as a notification.
    ///
    /// Gated and truncated like [`indicate`](Self::indicate) but does not
    /// wait for anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stack`] if the send fails.
    pub async fn notify(&self) -> Result<()> {
        let Some((gatts_if, conn_id, handle, payload)) = self.push_target(false)? else {
            return Ok(());
        };

        self.link
            .stack()
            .send_indicate(gatts_if, conn_id, handle, &payload, false)
            .map_err(|code| {
                error!(uuid = %self.uuid, "send_notify failed: {}", code);
                Error::stack("send_notify", code)
            })
    }

    /// Resolve where a notify/indicate goes, or `None` if it is gated off.
    fn push_target(&self, indication: bool) -> Result<Option<(GattIf, u16, AttrHandle, Bytes)>> {
        let kind = if indication { "indicate" } else { "notify" };

        if self.link.connected_count() == 0 {
            debug!(uuid = %self.uuid, "{}: no connected clients", kind);
            return Ok(None);
        }

        if let Some(cccd) = self.desc_find(&CLIENT_CHARACTERISTIC_CONFIG_UUID) {
            let enabled = if indication {
                cccd.indications_enabled()
            } else {
                cccd.notifications_enabled()
            };
            if !enabled {
                debug!(uuid = %self.uuid, "{}: disabled by client configuration", kind);
                return Ok(None);
            }
        }

        let handle = self.handle().ok_or_else(|| Error::NotRegistered {
            what: format!("characteristic {}", self.uuid),
        })?;
        let gatts_if = self.link.require_gatts_if()?;
        let conn_id = self.link.conn_id().ok_or_else(|| Error::NotRegistered {
            what: "connection".to_string(),
        })?;

        let mut payload = self.value();
        let max = self.link.config().notify_max_len;
        if payload.len() > max {
            debug!(uuid = %self.uuid, len = payload.len(), max, "Truncating {} payload", kind);
            payload.truncate(max);
        }

        Ok(Some((gatts_if, conn_id, handle, payload)))
    }

    /// Register this characteristic under `service_handle`, wait for its
    /// handle, then register its descriptors in order.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyRegistered`] if a handle is already assigned
    /// - [`Error::Stack`] if a request fails
    /// - [`Error::AttributeRejected`] if a completion carries a failure status
    /// - [`Error::Timeout`] if a completion does not arrive in time
    pub async fn execute_create(&self, service_handle: AttrHandle) -> Result<AttrHandle> {
        let (properties, initial) = {
            let mut state = self.state.write();
            if state.handle.is_some() {
                error!(uuid = %self.uuid, "Characteristic already has a handle");
                return Err(Error::AlreadyRegistered {
                    uuid: self.uuid.to_string(),
                });
            }
            state.service_handle = Some(service_handle);
            (state.properties, state.value.value())
        };

        debug!(
            uuid = %self.uuid,
            service_handle,
            properties = %properties,
            "Registering characteristic"
        );

        let pending = self.created.arm();
        self.link
            .stack()
            .add_characteristic(
                service_handle,
                &self.uuid,
                Permissions::READ_WRITE,
                properties,
                &initial,
            )
            .map_err(|code| {
                error!(uuid = %self.uuid, "add_characteristic failed: {}", code);
                Error::stack("add_characteristic", code)
            })?;

        let status = pending.wait(self.link.timeout()).await?;
        if !status.is_ok() {
            error!(uuid = %self.uuid, %status, "Characteristic rejected");
            return Err(Error::AttributeRejected {
                uuid: self.uuid.to_string(),
                status,
            });
        }

        let handle = self.handle().ok_or_else(|| Error::NotRegistered {
            what: format!("characteristic {}", self.uuid),
        })?;

        for descriptor in self.descriptors() {
            descriptor.execute_create(&self.link, service_handle).await?;
        }

        Ok(handle)
    }

    /// Handle a server event, then hand it to every descriptor.
    ///
    /// `registering` is the UUID of the characteristic whose registration
    /// is in progress in the owning service, if any.
    pub(crate) fn handle_event(
        &self,
        gatts_if: GattIf,
        event: &GattsEvent,
        registering: Option<&BleUuid>,
    ) {
        match event {
            GattsEvent::CharacteristicAdded {
                status,
                attr_handle,
                service_handle,
                char_uuid,
            } => {
                if *char_uuid == self.uuid && self.created.is_armed() {
                    self.on_added(*status, *attr_handle, *service_handle);
                }
            }

            GattsEvent::ExecWrite {
                conn_id,
                trans_id,
                flag,
            } => self.on_exec_write(gatts_if, *conn_id, *trans_id, *flag),

            GattsEvent::Write {
                conn_id,
                trans_id,
                handle,
                offset,
                need_rsp,
                is_prep,
                value,
            } if Some(*handle) == self.handle() => self.on_write(
                gatts_if, *conn_id, *trans_id, *handle, *offset, *need_rsp, *is_prep, value,
            ),

            GattsEvent::Read {
                conn_id,
                trans_id,
                handle,
                is_long,
                need_rsp,
                ..
            } if Some(*handle) == self.handle() => {
                self.on_read(gatts_if, *conn_id, *trans_id, *handle, *is_long, *need_rsp)
            }

            GattsEvent::Confirm { status, .. } => {
                if self.confirmed.signal(*status) {
                    trace!(uuid = %self.uuid, %status, "Indication confirmed");
                }
            }

            _ => {}
        }

        let owner_registering = registering == Some(&self.uuid);
        for descriptor in self.descriptors() {
            descriptor.handle_event(&self.link, gatts_if, event, owner_registering);
        }
    }

    fn on_added(&self, status: GattStatus, attr_handle: AttrHandle, service_handle: AttrHandle) {
        {
            let mut state = self.state.write();
            if state.handle.is_some() || state.service_handle != Some(service_handle) {
                return;
            }
            if status.is_ok() {
                state.handle = Some(attr_handle);
            }
        }
        info!(uuid = %self.uuid, handle = attr_handle, %status, "Characteristic added");
        self.created.signal(status);
    }

    fn on_exec_write(&self, gatts_if: GattIf, conn_id: u16, trans_id: u32, flag: ExecWriteFlag) {
        // The event names no attribute: only the characteristic holding
        // prepared parts reacts.
        let committed = {
            let mut state = self.state.write();
            if !state.value.exec_allowed() {
                return;
            }
            match flag {
                ExecWriteFlag::Execute => state.value.commit().map(|_| true),
                ExecWriteFlag::Cancel => {
                    state.value.cancel();
                    Ok(false)
                }
            }
        };

        let status = match committed {
            Ok(true) => {
                debug!(uuid = %self.uuid, len = self.value().len(), "Prepared write executed");
                self.fire_after_write();
                GattStatus::OK
            }
            Ok(false) => {
                debug!(uuid = %self.uuid, "Prepared write cancelled");
                GattStatus::OK
            }
            Err(e) => {
                error!(uuid = %self.uuid, "Prepared write dropped: {}", e);
                GattStatus::INVALID_ATTR_LEN
            }
        };

        self.respond(gatts_if, conn_id, trans_id, status, &GattResponse::Empty);
    }

    #[allow(clippy::too_many_arguments)]
    fn on_write(
        &self,
        gatts_if: GattIf,
        conn_id: u16,
        trans_id: u32,
        handle: AttrHandle,
        offset: u16,
        need_rsp: bool,
        is_prep: bool,
        value: &Bytes,
    ) {
        trace!(uuid = %self.uuid, handle, offset, len = value.len(), is_prep, "Write request");

        let applied = if is_prep {
            let added = self.state.write().value.add_part(value);
            if let Err(e) = &added {
                warn!(uuid = %self.uuid, offset, "Prepared write part rejected: {}", e);
            }
            added.is_ok()
        } else {
            self.set_value(value).is_ok()
        };

        if need_rsp {
            let (status, response) = if applied {
                let response = GattResponse::Value {
                    handle,
                    offset,
                    value: value.clone(),
                };
                (GattStatus::OK, response)
            } else {
                (GattStatus::INVALID_ATTR_LEN, GattResponse::Empty)
            };
            self.respond(gatts_if, conn_id, trans_id, status, &response);
        }

        if applied && !is_prep {
            self.fire_after_write();
        }
    }

    fn on_read(
        &self,
        gatts_if: GattIf,
        conn_id: u16,
        trans_id: u32,
        handle: AttrHandle,
        is_long: bool,
        need_rsp: bool,
    ) {
        if let Some(callbacks) = self.callbacks() {
            callbacks.before_read(self);
        }

        if !need_rsp {
            return;
        }

        let chunk_len = self.link.config().read_chunk_len;
        let (offset, chunk) = self.state.write().value.next_read_chunk(is_long, chunk_len);
        trace!(uuid = %self.uuid, offset, len = chunk.len(), is_long, "Read response");

        let response = GattResponse::Value {
            handle,
            offset: u16::try_from(offset).unwrap_or(u16::MAX),
            value: chunk,
        };
        self.respond(gatts_if, conn_id, trans_id, GattStatus::OK, &response);
    }

    fn callbacks(&self) -> Option<Arc<dyn CharacteristicCallbacks>> {
        self.callbacks.read().clone()
    }

    fn fire_after_write(&self) {
        if let Some(callbacks) = self.callbacks() {
            callbacks.after_write(self);
        }
    }

    fn respond(
        &self,
        gatts_if: GattIf,
        conn_id: u16,
        trans_id: u32,
        status: GattStatus,
        response: &GattResponse,
    ) {
        if let Err(code) = self
            .link
            .stack()
            .send_response(gatts_if, conn_id, trans_id, status, response)
        {
            error!(uuid = %self.uuid, "send_response failed: {}", code);
        }
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        match state.handle {
            Some(handle) => write!(f, "UUID: {}, handle: 0x{:02x}", self.uuid, handle)?,
            None => write!(f, "UUID: {}, handle: none", self.uuid)?,
        }
        write!(f, ", props: {}", state.properties)
    }
}

impl fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Characteristic")
            .field("uuid", &self.uuid)
            .field("state", &*self.state.read())
            .field("descriptors", &self.descriptors.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::stack::{MockGattStack, StackError};
    use crate::config::GattConfig;
    use crate::gatt::properties::mask;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn characteristic(stack: MockGattStack) -> Characteristic {
        let link = Arc::new(ServerLink::new(Arc::new(stack), GattConfig::default()));
        Characteristic::new(BleUuid::from_u16(0xAF01), link)
    }

    fn registered(stack: MockGattStack, handle: AttrHandle) -> Characteristic {
        let c = characteristic(stack);
        {
            let mut state = c.state.write();
            state.handle = Some(handle);
            state.service_handle = Some(40);
        }
        c.link.set_gatts_if(Some(3));
        c
    }

    fn read(handle: AttrHandle, is_long: bool) -> GattsEvent {
        GattsEvent::Read {
            conn_id: 0,
            trans_id: 1,
            handle,
            offset: 0,
            is_long,
            need_rsp: true,
        }
    }

    fn write(handle: AttrHandle, data: &'static [u8], is_prep: bool) -> GattsEvent {
        GattsEvent::Write {
            conn_id: 0,
            trans_id: 2,
            handle,
            offset: 0,
            need_rsp: true,
            is_prep,
            value: Bytes::from_static(data),
        }
    }

    #[test]
    fn test_set_properties() {
        let c = characteristic(MockGattStack::new());
        c.set_properties(mask::READ | mask::NOTIFY);
        assert_eq!(c.properties(), Properties::READ | Properties::NOTIFY);

        c.set_write_property(true);
        c.set_notify_property(false);
        assert_eq!(c.properties(), Properties::READ | Properties::WRITE);

        c.set_properties(0);
        assert!(c.properties().is_empty());
    }

    #[test]
    fn test_desc_create_is_idempotent() {
        let c = characteristic(MockGattStack::new());
        let first = c.desc_create(0x2902u16);
        let second = c.desc_create(CLIENT_CHARACTERISTIC_CONFIG_UUID);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(c.descriptors().len(), 1);
        assert!(c.desc_find(&BleUuid::from_u16(0x2901)).is_none());
    }

    #[test]
    fn test_desc_add_keeps_existing() {
        let c = characteristic(MockGattStack::new());
        let attached = c.desc_add(Descriptor::client_config());
        let again = c.desc_add(Descriptor::client_config());

        assert!(Arc::ptr_eq(&attached, &again));
        assert_eq!(c.descriptors().len(), 1);
    }

    #[test]
    fn test_desc_add_applies_configured_limit() {
        let link = Arc::new(ServerLink::new(
            Arc::new(MockGattStack::new()),
            GattConfig::default().with_max_attr_len(8),
        ));
        let c = Characteristic::new(BleUuid::from_u16(0xAF01), link);

        let user_description = c.desc_add(Descriptor::new(BleUuid::from_u16(0x2901)));
        assert!(user_description.set_value(b"too long!").is_err());
        assert_eq!(c.desc_add(Descriptor::client_config()).capacity(), 2);
    }

    #[test]
    fn test_set_value_too_long_keeps_value() {
        let c = characteristic(MockGattStack::new());
        c.set_value(b"ABC").unwrap();
        assert!(matches!(
            c.set_value(&[0u8; 601]),
            Err(Error::ValueTooLong { len: 601, max: 600 })
        ));
        assert_eq!(c.value(), Bytes::from_static(b"ABC"));
    }

    #[tokio::test]
    async fn test_indicate_without_peer_is_noop() {
        // No expectations: a send would panic.
        let c = registered(MockGattStack::new(), 42);
        c.set_value(b"ABC").unwrap();

        c.indicate().await.unwrap();
        c.notify().await.unwrap();
    }

    #[tokio::test]
    async fn test_notify_gated_by_client_config() {
        let mut stack = MockGattStack::new();
        stack
            .expect_send_indicate()
            .withf(|_, _, handle, value, confirm| {
                *handle == 42 && value.len() == 20 && !*confirm
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
        let c = registered(stack, 42);
        c.link.on_connect(0);
        c.set_value(&[9u8; 30]).unwrap();
        let cccd = c.desc_add(Descriptor::client_config());

        // Disabled: nothing sent.
        c.notify().await.unwrap();

        cccd.set_notifications(true);
        c.notify().await.unwrap();
    }

    #[tokio::test]
    async fn test_indicate_waits_for_confirm() {
        let mut stack = MockGattStack::new();
        stack
            .expect_send_indicate()
            .withf(|_, _, _, _, confirm| *confirm)
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
        let c = Arc::new(registered(stack, 42));
        c.link.on_connect(0);
        c.set_value(b"alarm").unwrap();

        let task = {
            let c = c.clone();
            tokio::spawn(async move { c.indicate().await })
        };
        while !c.confirmed.is_armed() {
            tokio::task::yield_now().await;
        }

        c.handle_event(
            3,
            &GattsEvent::Confirm {
                status: GattStatus::OK,
                conn_id: 0,
            },
            None,
        );
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_indicate_times_out() {
        let mut stack = MockGattStack::new();
        stack
            .expect_send_indicate()
            .returning(|_, _, _, _, _| Ok(()));
        let c = registered(stack, 42);
        c.link.on_connect(0);

        assert!(matches!(
            c.indicate().await,
            Err(Error::Timeout { .. })
        ));
        assert!(!c.confirmed.is_armed());
    }

    #[tokio::test]
    async fn test_indicate_send_failure_is_error() {
        let mut stack = MockGattStack::new();
        stack
            .expect_send_indicate()
            .returning(|_, _, _, _, _| Err(StackError::FAIL));
        let c = registered(stack, 42);
        c.link.on_connect(0);

        assert!(matches!(c.indicate().await, Err(Error::Stack { .. })));
        assert!(!c.confirmed.is_armed());
    }

    #[test]
    fn test_long_read_in_chunks() {
        let mut stack = MockGattStack::new();
        let mut seq = mockall::Sequence::new();
        for (offset, len) in [(0u16, 22usize), (22, 22), (44, 6)] {
            stack
                .expect_send_response()
                .withf(move |_, _, _, status, rsp| {
                    status.is_ok()
                        && matches!(rsp, GattResponse::Value { offset: o, value, .. }
                            if *o == offset && value.len() == len)
                })
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _, _, _| Ok(()));
        }
        let c = registered(stack, 42);
        c.set_value(&[5u8; 50]).unwrap();

        c.handle_event(3, &read(42, false), None);
        c.handle_event(3, &read(42, true), None);
        c.handle_event(3, &read(42, true), None);
        assert_eq!(c.state.read().value.read_offset(), 0);
    }

    #[test]
    fn test_before_read_runs_before_response() {
        let mut stack = MockGattStack::new();
        stack
            .expect_send_response()
            .withf(|_, _, _, _, rsp| rsp.value().map(|v| v.as_ref()) == Some(&b"fresh"[..]))
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
        let c = registered(stack, 42);
        c.set_callbacks(Callbacks::new().on_before_read(|c| {
            c.set_value(b"fresh").unwrap();
        }));

        c.handle_event(3, &read(42, false), None);
    }

    #[test]
    fn test_write_echoes_and_fires_callback() {
        let mut stack = MockGattStack::new();
        stack
            .expect_send_response()
            .withf(|_, _, trans_id, _, rsp| {
                *trans_id == 2 && rsp.value().map(|v| v.as_ref()) == Some(&b"guard"[..])
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
        let c = registered(stack, 42);
        let writes = Arc::new(AtomicUsize::new(0));
        let counter = writes.clone();
        c.set_callbacks(Callbacks::new().on_after_write(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        c.handle_event(3, &write(42, b"guard", false), None);
        // Another handle is not ours.
        c.handle_event(3, &write(43, b"other", false), None);

        assert_eq!(c.value(), Bytes::from_static(b"guard"));
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_prepared_write_execute() {
        let mut stack = MockGattStack::new();
        // Two prepare echoes plus the execute acknowledgement.
        stack
            .expect_send_response()
            .times(3)
            .returning(|_, _, _, _, _| Ok(()));
        let c = registered(stack, 42);
        let writes = Arc::new(AtomicUsize::new(0));
        let counter = writes.clone();
        c.set_callbacks(Callbacks::new().on_after_write(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        c.set_value(b"old").unwrap();

        c.handle_event(3, &write(42, b"my-home-", true), None);
        c.handle_event(3, &write(42, b"network", true), None);
        assert_eq!(c.value(), Bytes::from_static(b"old"));
        assert_eq!(writes.load(Ordering::SeqCst), 0);

        let exec = GattsEvent::ExecWrite {
            conn_id: 0,
            trans_id: 5,
            flag: ExecWriteFlag::Execute,
        };
        c.handle_event(3, &exec, None);
        assert_eq!(c.value(), Bytes::from_static(b"my-home-network"));
        assert_eq!(writes.load(Ordering::SeqCst), 1);

        // A stray execute with nothing prepared is ignored: no fourth response.
        c.handle_event(3, &exec, None);
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_prepared_write_cancel() {
        let mut stack = MockGattStack::new();
        stack
            .expect_send_response()
            .times(2)
            .returning(|_, _, _, _, _| Ok(()));
        let c = registered(stack, 42);
        c.set_value(b"old").unwrap();

        c.handle_event(3, &write(42, b"new", true), None);
        c.handle_event(
            3,
            &GattsEvent::ExecWrite {
                conn_id: 0,
                trans_id: 6,
                flag: ExecWriteFlag::Cancel,
            },
            None,
        );

        assert_eq!(c.value(), Bytes::from_static(b"old"));
        assert!(!c.state.read().value.exec_allowed());
    }

    #[test]
    fn test_prepared_write_beyond_limit_is_rejected() {
        let statuses = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sent = statuses.clone();
        let mut stack = MockGattStack::new();
        stack
            .expect_send_response()
            .returning(move |_, _, _, status, _| {
                sent.lock().push(status);
                Ok(())
            });
        let link = Arc::new(ServerLink::new(
            Arc::new(stack),
            GattConfig::default().with_max_attr_len(10),
        ));
        let c = Characteristic::new(BleUuid::from_u16(0xAF01), link);
        {
            let mut state = c.state.write();
            state.handle = Some(42);
            state.service_handle = Some(40);
        }
        c.link.set_gatts_if(Some(3));
        c.set_value(b"old").unwrap();

        c.handle_event(3, &write(42, b"0123456", true), None);
        c.handle_event(3, &write(42, b"789ab", true), None);
        c.handle_event(3, &write(42, b"c", true), None);
        c.handle_event(
            3,
            &GattsEvent::ExecWrite {
                conn_id: 0,
                trans_id: 7,
                flag: ExecWriteFlag::Execute,
            },
            None,
        );

        assert_eq!(
            *statuses.lock(),
            vec![
                GattStatus::OK,
                GattStatus::INVALID_ATTR_LEN,
                GattStatus::INVALID_ATTR_LEN,
                GattStatus::INVALID_ATTR_LEN,
            ]
        );
        assert_eq!(c.value(), Bytes::from_static(b"old"));
        assert!(!c.state.read().value.exec_allowed());
    }

    #[tokio::test]
    async fn test_execute_create_registers_descriptors() {
        let mut stack = MockGattStack::new();
        stack
            .expect_add_characteristic()
            .withf(|service_handle, uuid, _, props, initial| {
                *service_handle == 40
                    && *uuid == BleUuid::from_u16(0xAF01)
                    && *props == (Properties::READ | Properties::INDICATE)
                    && initial == b"ABC"
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
        stack
            .expect_add_descriptor()
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let c = Arc::new(characteristic(stack));
        c.set_properties(mask::READ | mask::INDICATE);
        c.set_value(b"ABC").unwrap();
        let cccd = c.desc_add(Descriptor::client_config());

        let task = {
            let c = c.clone();
            tokio::spawn(async move { c.execute_create(40).await })
        };

        while !c.created.is_armed() {
            tokio::task::yield_now().await;
        }
        let uuid = *c.uuid();
        c.handle_event(
            3,
            &GattsEvent::CharacteristicAdded {
                status: GattStatus::OK,
                attr_handle: 42,
                service_handle: 40,
                char_uuid: uuid,
            },
            Some(&uuid),
        );

        while cccd.handle().is_none() {
            c.handle_event(
                3,
                &GattsEvent::DescriptorAdded {
                    status: GattStatus::OK,
                    attr_handle: 43,
                    service_handle: 40,
                    descr_uuid: CLIENT_CHARACTERISTIC_CONFIG_UUID,
                },
                Some(&uuid),
            );
            tokio::task::yield_now().await;
        }

        assert_eq!(task.await.unwrap().unwrap(), 42);
        assert_eq!(c.handle(), Some(42));
        assert_eq!(cccd.handle(), Some(43));
        assert_eq!(
            c.to_string(),
            "UUID: 0000af01-0000-1000-8000-00805f9b34fb, handle: 0x2a, props: read|indicate"
        );
    }

    #[tokio::test]
    async fn test_execute_create_rejected_status() {
        let mut stack = MockGattStack::new();
        stack
            .expect_add_characteristic()
            .returning(|_, _, _, _, _| Ok(()));
        let c = Arc::new(characteristic(stack));

        let task = {
            let c = c.clone();
            tokio::spawn(async move { c.execute_create(40).await })
        };
        while !c.created.is_armed() {
            tokio::task::yield_now().await;
        }
        let uuid = *c.uuid();
        c.handle_event(
            3,
            &GattsEvent::CharacteristicAdded {
                status: GattStatus::NO_RESOURCES,
                attr_handle: 0,
                service_handle: 40,
                char_uuid: uuid,
            },
            Some(&uuid),
        );

        assert!(matches!(
            task.await.unwrap(),
            Err(Error::AttributeRejected {
                status: GattStatus::NO_RESOURCES,
                ..
            })
        ));
        assert_eq!(c.handle(), None);
    }
}

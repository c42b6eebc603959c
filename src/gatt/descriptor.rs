//! Characteristic descriptors.
//!
//! A descriptor is registered right after its characteristic. The stack's
//! descriptor-added event carries no characteristic identifier, so a
//! descriptor only accepts that event while its own characteristic is the
//! one being registered.

use std::fmt;

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, error, trace, warn};

use crate::ble::event::{AttrHandle, GattIf, GattStatus, GattsEvent};
use crate::ble::stack::GattResponse;
use crate::ble::uuid::BleUuid;
use crate::ble::uuids::CLIENT_CHARACTERISTIC_CONFIG_UUID;
use crate::config::MAX_ATTR_LEN;
use crate::error::{Error, Result};
use crate::gatt::link::ServerLink;
use crate::gatt::properties::Permissions;
use crate::gatt::signal::Rendezvous;
use crate::gatt::value::AttributeValue;

/// Client configuration bit enabling notifications.
const NOTIFY_BIT: u8 = 0x01;
/// Client configuration bit enabling indications.
const INDICATE_BIT: u8 = 0x02;

#[derive(Debug)]
struct DescriptorState {
    handle: Option<AttrHandle>,
    service_handle: Option<AttrHandle>,
    value: AttributeValue,
}

/// A descriptor attached to a characteristic.
pub struct Descriptor {
    uuid: BleUuid,
    // Set when the capacity follows the server's configured limit.
    default_capacity: bool,
    state: RwLock<DescriptorState>,
    created: Rendezvous<GattStatus>,
}

impl Descriptor {
    /// Create an unregistered descriptor with an empty value.
    ///
    /// The value holds at most [`MAX_ATTR_LEN`] bytes until the descriptor
    /// is attached to a characteristic, which applies the server's
    /// configured `max_attr_len` instead.
    pub fn new(uuid: BleUuid) -> Self {
        Self {
            default_capacity: true,
            ..Self::with_capacity(uuid, MAX_ATTR_LEN)
        }
    }

    /// Create an unregistered descriptor whose value holds at most
    /// `capacity` bytes.
    pub fn with_capacity(uuid: BleUuid, capacity: usize) -> Self {
        Self {
            uuid,
            default_capacity: false,
            state: RwLock::new(DescriptorState {
                handle: None,
                service_handle: None,
                value: AttributeValue::new(capacity),
            }),
            created: Rendezvous::new("descriptor added"),
        }
    }

    /// Create a Client Characteristic Configuration descriptor (0x2902)
    /// with notifications and indications disabled.
    pub fn client_config() -> Self {
        let descriptor = Self::with_capacity(CLIENT_CHARACTERISTIC_CONFIG_UUID, 2);
        // Two bytes always fit the two-byte capacity.
        let _ = descriptor.state.write().value.set_value(&[0x00, 0x00]);
        descriptor
    }

    /// UUID of this descriptor.
    pub fn uuid(&self) -> &BleUuid {
        &self.uuid
    }

    /// Handle assigned by the stack, once registered.
    pub fn handle(&self) -> Option<AttrHandle> {
        self.state.read().handle
    }

    /// Current value.
    pub fn value(&self) -> Bytes {
        self.state.read().value.value()
    }

    /// Length of the current value.
    pub fn length(&self) -> usize {
        self.state.read().value.len()
    }

    /// Replace the value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ValueTooLong`] and keeps the old value if `data`
    /// exceeds the descriptor capacity.
    pub fn set_value(&self, data: &[u8]) -> Result<()> {
        self.state.write().value.set_value(data).map_err(|e| {
            error!(uuid = %self.uuid, "Descriptor value rejected: {}", e);
            e
        })
    }

    /// Apply the server's value limit to a descriptor built with [`new`].
    ///
    /// [`new`]: Descriptor::new
    pub(crate) fn apply_default_limit(&self, max_len: usize) {
        if !self.default_capacity {
            return;
        }
        if let Err(e) = self.state.write().value.set_capacity(max_len) {
            warn!(uuid = %self.uuid, "Keeping descriptor capacity: {}", e);
        }
    }

    /// Capacity of the value.
    pub fn capacity(&self) -> usize {
        self.state.read().value.capacity()
    }

    /// Whether this is a Client Characteristic Configuration descriptor.
    pub fn is_client_config(&self) -> bool {
        self.uuid == CLIENT_CHARACTERISTIC_CONFIG_UUID
    }

    /// Whether the peer enabled notifications.
    pub fn notifications_enabled(&self) -> bool {
        self.config_bits() & NOTIFY_BIT != 0
    }

    /// Whether the peer enabled indications.
    pub fn indications_enabled(&self) -> bool {
        self.config_bits() & INDICATE_BIT != 0
    }

    /// Enable or disable notifications.
    pub fn set_notifications(&self, enabled: bool) {
        self.set_config_bit(NOTIFY_BIT, enabled);
    }

    /// Enable or disable indications.
    pub fn set_indications(&self, enabled: bool) {
        self.set_config_bit(INDICATE_BIT, enabled);
    }

    fn config_bits(&self) -> u8 {
        self.state.read().value.value().first().copied().unwrap_or(0)
    }

    fn set_config_bit(&self, bit: u8, enabled: bool) {
        let mut state = self.state.write();
        let current = state.value.value();
        let mut bytes = [
            current.first().copied().unwrap_or(0),
            current.get(1).copied().unwrap_or(0),
        ];
        if enabled {
            bytes[0] |= bit;
        } else {
            bytes[0] &= !bit;
        }
        if let Err(e) = state.value.set_value(&bytes) {
            error!(uuid = %self.uuid, "Client configuration update rejected: {}", e);
        }
    }

    /// Register this descriptor under `service_handle` and wait for the
    /// stack to assign its handle.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyRegistered`] if a handle is already assigned
    /// - [`Error::Stack`] if the request fails
    /// - [`Error::AttributeRejected`] if the completion carries a failure status
    /// - [`Error::Timeout`] if no completion arrives in time
    pub async fn execute_create(
        &self,
        link: &ServerLink,
        service_handle: AttrHandle,
    ) -> Result<AttrHandle> {
        debug!(uuid = %self.uuid, service_handle, "Registering descriptor");

        let initial = {
            let mut state = self.state.write();
            if state.handle.is_some() {
                error!(uuid = %self.uuid, "Descriptor already has a handle");
                return Err(Error::AlreadyRegistered {
                    uuid: self.uuid.to_string(),
                });
            }
            state.service_handle = Some(service_handle);
            state.value.value()
        };

        let pending = self.created.arm();
        link.stack()
            .add_descriptor(service_handle, &self.uuid, Permissions::READ_WRITE, &initial)
            .map_err(|code| {
                error!(uuid = %self.uuid, "add_descriptor failed: {}", code);
                Error::stack("add_descriptor", code)
            })?;

        let status = pending.wait(link.timeout()).await?;
        if !status.is_ok() {
            error!(uuid = %self.uuid, %status, "Descriptor rejected");
            return Err(Error::AttributeRejected {
                uuid: self.uuid.to_string(),
                status,
            });
        }

        self.handle().ok_or_else(|| Error::NotRegistered {
            what: format!("descriptor {}", self.uuid),
        })
    }

    /// Handle a server event. `owner_registering` tells whether the owning
    /// characteristic is the one currently being registered.
    pub(crate) fn handle_event(
        &self,
        link: &ServerLink,
        gatts_if: GattIf,
        event: &GattsEvent,
        owner_registering: bool,
    ) {
        match event {
            GattsEvent::DescriptorAdded {
                status,
                attr_handle,
                service_handle,
                descr_uuid,
            } => {
                if !owner_registering || *descr_uuid != self.uuid || !self.created.is_armed() {
                    return;
                }
                {
                    let mut state = self.state.write();
                    if state.handle.is_some() || state.service_handle != Some(*service_handle) {
                        return;
                    }
                    if status.is_ok() {
                        state.handle = Some(*attr_handle);
                    }
                }
                debug!(uuid = %self.uuid, handle = attr_handle, "Descriptor added");
                self.created.signal(*status);
            }

            GattsEvent::Write {
                conn_id,
                trans_id,
                handle,
                need_rsp,
                value,
                ..
            } if Some(*handle) == self.handle() => {
                trace!(uuid = %self.uuid, len = value.len(), "Descriptor write");
                // A rejected value keeps the old one.
                let status = match self.set_value(value) {
                    Ok(()) => GattStatus::OK,
                    Err(_) => GattStatus::INVALID_ATTR_LEN,
                };
                if *need_rsp {
                    self.respond(link, gatts_if, *conn_id, *trans_id, *handle, status);
                }
            }

            GattsEvent::Read {
                conn_id,
                trans_id,
                handle,
                need_rsp,
                ..
            } if Some(*handle) == self.handle() => {
                if *need_rsp {
                    self.respond(link, gatts_if, *conn_id, *trans_id, *handle, GattStatus::OK);
                }
            }

            _ => {}
        }
    }

    fn respond(
        &self,
        link: &ServerLink,
        gatts_if: GattIf,
        conn_id: u16,
        trans_id: u32,
        handle: AttrHandle,
        status: GattStatus,
    ) {
        let response = if status.is_ok() {
            GattResponse::Value {
                handle,
                offset: 0,
                value: self.value(),
            }
        } else {
            GattResponse::Empty
        };
        if let Err(code) = link
            .stack()
            .send_response(gatts_if, conn_id, trans_id, status, &response)
        {
            error!(uuid = %self.uuid, "send_response failed: {}", code);
        }
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.handle() {
            Some(handle) => write!(f, "UUID: {}, handle: 0x{:02x}", self.uuid, handle),
            None => write!(f, "UUID: {}, handle: none", self.uuid),
        }
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("uuid", &self.uuid)
            .field("state", &*self.state.read())
            .finish()
    }
}

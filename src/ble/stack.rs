//! The radio stack API consumed by the GATT server.
//!
//! Requests return immediately with a status code; their results arrive
//! later as [`RadioEvent`]s pushed through the [`EventSink`] the stack was
//! given at registration time.

use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;

use crate::ble::event::{
    AttrHandle, GapEvent, GattIf, GattStatus, GattcEvent, GattsEvent, PeerAddress, RadioEvent,
};
use crate::ble::uuid::BleUuid;
use crate::gatt::properties::{Permissions, Properties};

/// Non-success return code of a stack request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackError(pub i32);

impl StackError {
    /// Generic failure.
    pub const FAIL: Self = Self(-1);
    /// The request is not valid in the current state.
    pub const INVALID_STATE: Self = Self(0x103);
    /// An argument was rejected.
    pub const INVALID_ARG: Self = Self(0x102);
}

impl fmt::Display for StackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rc={:#x}", self.0)
    }
}

impl std::error::Error for StackError {}

/// Result of a stack request.
pub type StackResult = std::result::Result<(), StackError>;

/// Payload of a response to a read, write or execute-write request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattResponse {
    /// Acknowledge without an attribute value.
    Empty,
    /// Answer with (part of) an attribute value.
    Value {
        /// Attribute handle.
        handle: AttrHandle,
        /// Offset of `value` within the attribute.
        offset: u16,
        /// The bytes sent back.
        value: Bytes,
    },
}

impl GattResponse {
    /// The value bytes carried by this response, if any.
    pub fn value(&self) -> Option<&Bytes> {
        match self {
            Self::Empty => None,
            Self::Value { value, .. } => Some(value),
        }
    }
}

/// Advertising parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertisingParams {
    /// Minimum advertising interval in 0.625 ms units.
    pub interval_min: u16,
    /// Maximum advertising interval in 0.625 ms units.
    pub interval_max: u16,
    /// Whether centrals may connect.
    pub connectable: bool,
}

impl Default for AdvertisingParams {
    fn default() -> Self {
        Self {
            interval_min: 0x20,
            interval_max: 0x40,
            connectable: true,
        }
    }
}

/// Transmit power levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TxPower {
    /// -12 dBm.
    N12,
    /// -9 dBm.
    N9,
    /// -6 dBm.
    N6,
    /// -3 dBm.
    N3,
    /// 0 dBm.
    N0,
    /// +3 dBm.
    P3,
    /// +6 dBm.
    P6,
    /// +7 dBm.
    #[default]
    P7,
    /// +9 dBm.
    P9,
}

impl TxPower {
    /// Power in dBm.
    pub fn dbm(&self) -> i8 {
        match self {
            Self::N12 => -12,
            Self::N9 => -9,
            Self::N6 => -6,
            Self::N3 => -3,
            Self::N0 => 0,
            Self::P3 => 3,
            Self::P6 => 6,
            Self::P7 => 7,
            Self::P9 => 9,
        }
    }
}

/// Pairing input/output capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IoCapability {
    /// Display only.
    DisplayOnly,
    /// Display with yes/no input.
    DisplayYesNo,
    /// Keyboard only.
    KeyboardOnly,
    /// No input and no output: just-works pairing.
    #[default]
    NoInputNoOutput,
    /// Keyboard and display.
    KeyboardDisplay,
}

/// Where the stack delivers its events.
///
/// Cloned into each of the three callback registrations; every clone feeds
/// the same dispatch queue.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<RadioEvent>,
}

impl EventSink {
    /// Create a sink and the receiving end of its queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RadioEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver a GAP event.
    pub fn gap(&self, event: GapEvent) {
        self.send(RadioEvent::Gap(event));
    }

    /// Deliver a GATT client event.
    pub fn client(&self, event: GattcEvent) {
        self.send(RadioEvent::Client(event));
    }

    /// Deliver a GATT server event.
    pub fn server(&self, gatts_if: GattIf, event: GattsEvent) {
        self.send(RadioEvent::Server { gatts_if, event });
    }

    /// Deliver any event.
    pub fn send(&self, event: RadioEvent) {
        if self.tx.send(event).is_err() {
            warn!("Event dropped: dispatcher is gone");
        }
    }
}

/// GATT/GAP requests used by the server object model.
#[cfg_attr(test, mockall::automock)]
pub trait GattStack: Send + Sync {
    /// Register a GATT application. Completes with [`GattsEvent::Register`].
    fn register_app(&self, app_id: u16) -> StackResult;

    /// Unregister a GATT application.
    fn unregister_app(&self, gatts_if: GattIf) -> StackResult;

    /// Create a service shell reserving `num_handles` attribute handles.
    /// Completes with [`GattsEvent::ServiceCreated`].
    fn create_service(
        &self,
        gatts_if: GattIf,
        uuid: &BleUuid,
        is_primary: bool,
        num_handles: u16,
    ) -> StackResult;

    /// Add a characteristic to a created service. Completes with
    /// [`GattsEvent::CharacteristicAdded`].
    fn add_characteristic(
        &self,
        service_handle: AttrHandle,
        uuid: &BleUuid,
        permissions: Permissions,
        properties: Properties,
        initial_value: &[u8],
    ) -> StackResult;

    /// Add a descriptor to the most recently added characteristic of a
    /// service. Completes with [`GattsEvent::DescriptorAdded`].
    fn add_descriptor(
        &self,
        service_handle: AttrHandle,
        uuid: &BleUuid,
        permissions: Permissions,
        initial_value: &[u8],
    ) -> StackResult;

    /// Start a service. Completes with [`GattsEvent::ServiceStarted`].
    fn start_service(&self, service_handle: AttrHandle) -> StackResult;

    /// Answer a read, write or execute-write request.
    fn send_response(
        &self,
        gatts_if: GattIf,
        conn_id: u16,
        trans_id: u32,
        status: GattStatus,
        response: &GattResponse,
    ) -> StackResult;

    /// Push a value to the peer. With `need_confirm` this is an indication
    /// and completes with [`GattsEvent::Confirm`].
    fn send_indicate(
        &self,
        gatts_if: GattIf,
        conn_id: u16,
        handle: AttrHandle,
        value: &[u8],
        need_confirm: bool,
    ) -> StackResult;

    /// Configure the raw advertisement (or scan response) payload.
    fn set_advertising_data(&self, payload: &[u8], scan_response: bool) -> StackResult;

    /// Start advertising.
    fn start_advertising(&self, params: &AdvertisingParams) -> StackResult;

    /// Stop advertising.
    fn stop_advertising(&self) -> StackResult;

    /// Accept or reject a peer's security request.
    fn security_response(&self, remote: &PeerAddress, accept: bool) -> StackResult;
}

/// Radio hardware and host stack lifecycle.
#[cfg_attr(test, mockall::automock)]
pub trait Controller: Send + Sync {
    /// Initialize persistent storage used by the stack for bonding data.
    fn init_storage(&self) -> StackResult;
    /// Initialize the radio controller.
    fn controller_init(&self) -> StackResult;
    /// Set the default transmit power.
    fn set_tx_power(&self, power: TxPower) -> StackResult;
    /// Enable the controller in BLE mode.
    fn controller_enable(&self) -> StackResult;
    /// Initialize the host stack.
    fn stack_init(&self) -> StackResult;
    /// Enable the host stack.
    fn stack_enable(&self) -> StackResult;
    /// Register the GAP event entry point.
    fn register_gap_callback(&self, sink: EventSink) -> StackResult;
    /// Register the GATT client event entry point.
    fn register_gattc_callback(&self, sink: EventSink) -> StackResult;
    /// Register the GATT server event entry point.
    fn register_gatts_callback(&self, sink: EventSink) -> StackResult;
    /// Set the GAP device name.
    fn set_device_name(&self, name: &str) -> StackResult;
    /// Set the pairing I/O capability.
    fn set_io_capability(&self, capability: IoCapability) -> StackResult;
    /// Disable the host stack.
    fn stack_disable(&self) -> StackResult;
    /// Release the host stack.
    fn stack_deinit(&self) -> StackResult;
    /// Disable the controller.
    fn controller_disable(&self) -> StackResult;
    /// Release the controller. Afterwards it cannot be initialized again.
    fn controller_deinit(&self) -> StackResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_error_display() {
        assert_eq!(StackError(0x103).to_string(), "rc=0x103");
        assert_eq!(StackError::FAIL.to_string(), "rc=0xffffffff");
    }

    #[test]
    fn test_tx_power_dbm() {
        assert_eq!(TxPower::default(), TxPower::P7);
        assert_eq!(TxPower::P7.dbm(), 7);
        assert_eq!(TxPower::N12.dbm(), -12);
    }

    #[tokio::test]
    async fn test_event_sink_delivers_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.gap(GapEvent::Other(7));
        sink.server(
            3,
            GattsEvent::Confirm {
                status: GattStatus::OK,
                conn_id: 0,
            },
        );

        assert_eq!(rx.recv().await, Some(RadioEvent::Gap(GapEvent::Other(7))));
        assert!(matches!(
            rx.recv().await,
            Some(RadioEvent::Server { gatts_if: 3, .. })
        ));
    }

    #[test]
    fn test_response_value() {
        assert!(GattResponse::Empty.value().is_none());
        let rsp = GattResponse::Value {
            handle: 42,
            offset: 0,
            value: Bytes::from_static(b"ABC"),
        };
        assert_eq!(rsp.value().map(|v| v.as_ref()), Some(&b"ABC"[..]));
    }
}

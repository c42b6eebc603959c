//! Radio stack event records.
//!
//! The stack reports every result through one of three callback entry
//! points: GAP (connection and advertising), GATT client, and GATT server.
//! Each entry point delivers a closed set of event kinds modelled here.

use std::fmt;

use bytes::Bytes;

use crate::ble::uuid::BleUuid;

/// Interface id the stack assigns to a registered GATT application.
pub type GattIf = u8;

/// Numeric attribute handle assigned by the stack.
pub type AttrHandle = u16;

/// Bluetooth device address of a peer.
pub type PeerAddress = [u8; 6];

/// Status code carried by completion events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GattStatus(pub u8);

impl GattStatus {
    /// Success.
    pub const OK: Self = Self(0x00);
    /// Invalid handle.
    pub const INVALID_HANDLE: Self = Self(0x01);
    /// The attribute value length is invalid for the operation.
    pub const INVALID_ATTR_LEN: Self = Self(0x0D);
    /// Insufficient resources, e.g. no room left in the handle range.
    pub const NO_RESOURCES: Self = Self(0x80);
    /// Generic error.
    pub const ERROR: Self = Self(0x85);

    /// Check if this is a success status.
    pub fn is_ok(&self) -> bool {
        *self == Self::OK
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status=0x{:02x}", self.0)
    }
}

/// What to do with prepared writes when the peer executes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecWriteFlag {
    /// Discard the queued parts.
    Cancel,
    /// Commit the queued parts.
    Execute,
}

impl ExecWriteFlag {
    /// Create from the raw protocol flag.
    pub fn from_raw(value: u8) -> Self {
        match value {
            0x01 => Self::Execute,
            _ => Self::Cancel,
        }
    }
}

/// GATT server events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattsEvent {
    /// The application registration completed.
    Register {
        /// Result of the registration.
        status: GattStatus,
        /// Application id passed to the registration request.
        app_id: u16,
        /// Interface id assigned to the application.
        gatts_if: GattIf,
    },
    /// A service shell was created.
    ServiceCreated {
        /// Result of the creation.
        status: GattStatus,
        /// Handle assigned to the service.
        service_handle: AttrHandle,
        /// UUID of the created service.
        service_uuid: BleUuid,
    },
    /// A characteristic was added to a service.
    CharacteristicAdded {
        /// Result of the addition.
        status: GattStatus,
        /// Handle assigned to the characteristic value.
        attr_handle: AttrHandle,
        /// Handle of the owning service.
        service_handle: AttrHandle,
        /// UUID of the added characteristic.
        char_uuid: BleUuid,
    },
    /// A descriptor was added. The event does not say to which
    /// characteristic.
    DescriptorAdded {
        /// Result of the addition.
        status: GattStatus,
        /// Handle assigned to the descriptor.
        attr_handle: AttrHandle,
        /// Handle of the owning service.
        service_handle: AttrHandle,
        /// UUID of the added descriptor.
        descr_uuid: BleUuid,
    },
    /// A service was started.
    ServiceStarted {
        /// Result of the start request.
        status: GattStatus,
        /// Handle of the started service.
        service_handle: AttrHandle,
    },
    /// A peer connected.
    Connect {
        /// Connection id.
        conn_id: u16,
        /// Address of the peer.
        remote: PeerAddress,
    },
    /// A peer disconnected.
    Disconnect {
        /// Connection id.
        conn_id: u16,
        /// Address of the peer.
        remote: PeerAddress,
    },
    /// A peer wants to read an attribute.
    Read {
        /// Connection id.
        conn_id: u16,
        /// Transaction id to answer.
        trans_id: u32,
        /// Handle being read.
        handle: AttrHandle,
        /// Offset requested by the peer.
        offset: u16,
        /// Continuation of a previous read.
        is_long: bool,
        /// Whether the application must answer.
        need_rsp: bool,
    },
    /// A peer wrote an attribute.
    Write {
        /// Connection id.
        conn_id: u16,
        /// Transaction id to answer.
        trans_id: u32,
        /// Handle being written.
        handle: AttrHandle,
        /// Offset of the written bytes.
        offset: u16,
        /// Whether the application must answer.
        need_rsp: bool,
        /// Part of a prepare/execute sequence.
        is_prep: bool,
        /// Written bytes.
        value: Bytes,
    },
    /// A peer executes or cancels its prepared writes. The event carries no
    /// attribute handle.
    ExecWrite {
        /// Connection id.
        conn_id: u16,
        /// Transaction id to answer.
        trans_id: u32,
        /// Commit or discard.
        flag: ExecWriteFlag,
    },
    /// A peer confirmed an indication.
    Confirm {
        /// Result of the indication.
        status: GattStatus,
        /// Connection id.
        conn_id: u16,
    },
}

impl GattsEvent {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::ServiceCreated { .. } => "service-created",
            Self::CharacteristicAdded { .. } => "char-added",
            Self::DescriptorAdded { .. } => "descr-added",
            Self::ServiceStarted { .. } => "service-started",
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::ExecWrite { .. } => "exec-write",
            Self::Confirm { .. } => "confirm",
        }
    }
}

/// GAP events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapEvent {
    /// Advertising data was accepted by the controller.
    AdvDataSetComplete {
        /// Result of the request.
        status: GattStatus,
    },
    /// Advertising started.
    AdvStartComplete {
        /// Result of the request.
        status: GattStatus,
    },
    /// Advertising stopped.
    AdvStopComplete {
        /// Result of the request.
        status: GattStatus,
    },
    /// A peer requests a security procedure.
    SecurityRequest {
        /// Address of the peer.
        remote: PeerAddress,
    },
    /// Any other GAP event, identified by its raw code.
    Other(u32),
}

/// GATT client events. The device acts as a server only, so these are
/// identified by raw code and dropped after logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattcEvent {
    /// Raw event code.
    pub code: u32,
    /// Client interface id.
    pub gattc_if: GattIf,
}

/// An event from any of the three stack entry points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// Connection management and advertising.
    Gap(GapEvent),
    /// GATT client role.
    Client(GattcEvent),
    /// GATT server role.
    Server {
        /// Interface the event belongs to.
        gatts_if: GattIf,
        /// The event.
        event: GattsEvent,
    },
}

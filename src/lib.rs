// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # smart-alert-gatt
//!
//! An event-driven BLE GATT server framework for battery-powered smart alert
//! devices.
//!
//! The radio stack answers every request asynchronously through callback
//! events. This crate wraps that model in an object tree
//! ([`Server`] → [`Service`] → [`Characteristic`] → [`Descriptor`]) whose
//! registration methods are plain `async fn`s: each request is issued, then
//! the caller waits for the matching completion event, with a configurable
//! timeout.
//!
//! ## Features
//!
//! - **Lifecycle**: Ordered controller and host stack bring-up and release
//! - **Registration**: Services, characteristics and descriptors registered
//!   strictly in order, each awaiting its assigned handle
//! - **Reads**: Values served in fixed-size chunks for long reads
//! - **Writes**: Direct writes and prepared/executed write sequences, with
//!   per-characteristic callbacks
//! - **Push**: Notifications and confirmed indications gated by the client
//!   configuration descriptor
//! - **Advertising**: Restarted automatically whenever no peer is connected
//! - **Idle policy**: Decide when an unused server should be torn down
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use smart_alert_gatt::{ble::LoopbackStack, mask, Device, Result, ALERT_SERVICE_UUID};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let radio = Arc::new(LoopbackStack::new());
//!     let device = Device::new(radio.clone(), radio);
//!     device.init("SmartAlert").await?;
//!
//!     let server = device.create_server();
//!     let service = server.service_create(ALERT_SERVICE_UUID);
//!     let status = service.char_create(0xAF04u16);
//!     status.set_properties(mask::READ | mask::INDICATE);
//!     status.set_value(b"OK")?;
//!
//!     server.init(&device).await?;
//!     server.start().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for configuration types

// Public modules
pub mod ble;
pub mod config;
pub mod device;
pub mod error;
pub mod gatt;

// Re-exports for convenience
pub use config::GattConfig;
pub use device::{Device, DeviceState, InitStep};
pub use error::{Error, Result};

// Re-export commonly used types from submodules
pub use ble::uuid::BleUuid;
pub use ble::uuids::*;
pub use gatt::{
    mask, Callbacks, Characteristic, CharacteristicCallbacks, ConnectionEvent, ConnectionState,
    Descriptor, IdlePolicy, Permissions, Properties, Server, Service,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<Device>();
        let _ = std::any::TypeId::of::<Server>();
        let _ = std::any::TypeId::of::<Service>();
        let _ = std::any::TypeId::of::<Characteristic>();
        let _ = std::any::TypeId::of::<Descriptor>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<GattConfig>();
    }

    #[test]
    fn test_alert_uuids() {
        assert_eq!(ALERT_SERVICE_UUID, BleUuid::from_u16(0xAFFF));
        assert!(is_alert_attribute(&WLAN_SSID_UUID));
    }
}

//! Radio stack plumbing.
//!
//! Event records, the stack API the GATT layer drives, UUID handling,
//! advertising payloads and an in-memory stack for running without
//! hardware.

pub mod advertising;
pub mod event;
pub mod loopback;
pub mod stack;
pub mod uuid;
pub mod uuids;

pub use advertising::{AdType, AdvertisementData, Advertising};
pub use event::{AttrHandle, GapEvent, GattIf, GattStatus, GattsEvent, RadioEvent};
pub use loopback::{LoopbackStack, StackCall};
pub use stack::{Controller, EventSink, GattResponse, GattStack, StackError};
pub use uuid::BleUuid;
pub use uuids::*;

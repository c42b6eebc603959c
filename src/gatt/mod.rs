//! GATT server object model.
//!
//! A [`Server`] owns [`Service`]s, which own [`Characteristic`]s, which own
//! [`Descriptor`]s. Events flow top-down through that tree; registration
//! runs depth-first, one attribute at a time.

pub mod characteristic;
pub mod connection;
pub mod descriptor;
pub mod link;
pub mod properties;
pub mod server;
pub mod service;
pub mod signal;
pub mod value;

pub use characteristic::{Callbacks, Characteristic, CharacteristicCallbacks};
pub use connection::{ConnectionEvent, ConnectionState};
pub use descriptor::Descriptor;
pub use properties::{mask, Permissions, Properties};
pub use server::{IdlePolicy, Server};
pub use service::Service;
pub use value::{AttributeValue, CharacteristicValue};

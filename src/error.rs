//! Error types for the smart-alert-gatt crate.

use thiserror::Error;

use crate::ble::event::GattStatus;
use crate::ble::stack::StackError;

/// The main error type for this crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A radio stack request returned a non-success code.
    #[error("Radio stack call {operation} failed: {code}")]
    Stack {
        /// The stack request that failed.
        operation: &'static str,
        /// The code returned by the stack.
        code: StackError,
    },

    /// The stack reported a failure status in a completion event.
    #[error("Attribute {uuid} rejected by the stack: {status}")]
    AttributeRejected {
        /// UUID of the attribute that was being registered.
        uuid: String,
        /// Status carried by the completion event.
        status: GattStatus,
    },

    /// A UUID could not be parsed.
    #[error("Invalid UUID: {input}")]
    InvalidUuid {
        /// The rejected input.
        input: String,
    },

    /// A value exceeds the maximum attribute length.
    #[error("Value too long: {len} bytes, must be no bigger than {max}")]
    ValueTooLong {
        /// Length of the rejected value.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// The attribute already received its handle from the stack.
    #[error("Attribute already registered: {uuid}")]
    AlreadyRegistered {
        /// UUID of the attribute.
        uuid: String,
    },

    /// Operation requires a registration that has not happened yet.
    #[error("Not registered: {what}")]
    NotRegistered {
        /// Description of what is missing.
        what: String,
    },

    /// The device already serves another live server.
    #[error("Device already has an active server")]
    ServerAlreadyBound,

    /// The radio has not been brought up.
    #[error("Device not initialized")]
    DeviceNotReady,

    /// The controller was de-initialized and cannot be brought up again.
    #[error("Radio controller was de-initialized and cannot be re-initialized")]
    ControllerRetired,

    /// No completion event arrived in time.
    #[error("Timed out waiting for {operation}")]
    Timeout {
        /// The operation that was waiting.
        operation: &'static str,
    },

    /// The wait was abandoned before a completion event arrived.
    #[error("Wait for {operation} was cancelled")]
    Cancelled {
        /// The operation that was waiting.
        operation: &'static str,
    },

    /// The advertisement payload does not fit a single advertising PDU.
    #[error("Advertising payload too long: {len} bytes, maximum is {max}")]
    AdvertisingPayloadTooLong {
        /// Length of the encoded payload.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },
}

impl Error {
    /// Build a [`Error::Stack`] for a failed request.
    pub(crate) fn stack(operation: &'static str, code: StackError) -> Self {
        Self::Stack { operation, code }
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ValueTooLong { len: 700, max: 600 };
        assert_eq!(
            err.to_string(),
            "Value too long: 700 bytes, must be no bigger than 600"
        );

        let err = Error::stack("start_service", StackError(0x103));
        assert_eq!(
            err.to_string(),
            "Radio stack call start_service failed: rc=0x103"
        );
    }

    #[test]
    fn test_timeout_display() {
        let err = Error::Timeout {
            operation: "indicate confirmation",
        };
        assert!(err.to_string().contains("indicate confirmation"));
    }
}

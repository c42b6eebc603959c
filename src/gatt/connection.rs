//! Peer connection state.

use crate::ble::event::PeerAddress;

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No peer connected.
    #[default]
    Disconnected,
    /// A peer is connected.
    Connected,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// Connection id assigned by the stack.
    pub conn_id: u16,
    /// Address of the peer.
    pub remote: PeerAddress,
    /// The new connection state.
    pub state: ConnectionState,
    /// Number of connected peers after this change.
    pub connected_count: u32,
}

impl ConnectionEvent {
    /// Peer address formatted as `aa:bb:cc:dd:ee:ff`.
    pub fn remote_string(&self) -> String {
        format_address(&self.remote)
    }
}

/// Format a peer address as colon-separated hex, most significant byte
/// first.
pub fn format_address(address: &PeerAddress) -> String {
    address
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(ConnectionState::Connected.is_connected());
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Disconnected), "Disconnected");
        assert_eq!(format!("{}", ConnectionState::Connected), "Connected");
    }

    #[test]
    fn test_format_address() {
        let event = ConnectionEvent {
            conn_id: 0,
            remote: [0xC0, 0xFF, 0xEE, 0x00, 0x01, 0x02],
            state: ConnectionState::Connected,
            connected_count: 1,
        };
        assert_eq!(event.remote_string(), "c0:ff:ee:00:01:02");
    }
}

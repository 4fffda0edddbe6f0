//! Connection state and the errors the manager reports

use crate::transport::BrokerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Lifecycle state of an [`HsmConnection`](super::HsmConnection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    /// Transient; only entered after a failure while connected
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_reconnecting(&self) -> bool {
        matches!(self, ConnectionState::Reconnecting)
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connected => 1,
            ConnectionState::Reconnecting => 2,
        }
    }

    /// Unknown values decode as `Disconnected`
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connected,
            2 => ConnectionState::Reconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connected => "Connected",
            ConnectionState::Reconnecting => "Reconnecting",
        };
        f.write_str(name)
    }
}

/// Lock-free cell holding the current state
#[derive(Debug, Default)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Store a new state, returning the previous one
    pub fn swap(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(state.as_u8(), Ordering::AcqRel))
    }
}

/// Delivered to subscribers on every state change
#[derive(Debug, Clone)]
pub struct StateEvent {
    pub state: ConnectionState,
    pub last_error: Option<ConnectionError>,
}

/// Errors reported by the connection manager
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("already connected")]
    AlreadyConnected,
    #[error("already disconnected")]
    AlreadyDisconnected,
    #[error("broker is not initialized")]
    NotConnected,
    #[error("failed to establish link: {0}")]
    Link(#[source] BrokerError),
    #[error("broker stopped unexpectedly: {0}")]
    BrokerStopped(#[source] BrokerError),
    #[error("broker start failed on attempt {attempt}: {source}")]
    ReconnectAttempt {
        attempt: u32,
        #[source]
        source: BrokerError,
    },
    #[error("failed to reconnect after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("failed to send command: {0}")]
    Send(#[source] BrokerError),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

impl ConnectionError {
    /// Errors after which further commands on the current link are pointless
    pub fn is_connection_lost(&self) -> bool {
        match self {
            ConnectionError::NotConnected => true,
            ConnectionError::Send(e) => matches!(
                e,
                BrokerError::Closed | BrokerError::Quit | BrokerError::Dropped
            ) || e.is_fatal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PoolError;

    #[test]
    fn test_state_u8_mapping_is_lossless() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
        ] {
            assert_eq!(ConnectionState::from_u8(state.as_u8()), state);
        }
        assert_eq!(ConnectionState::from_u8(42), ConnectionState::Disconnected);
    }

    #[test]
    fn test_state_cell_starts_disconnected() {
        let cell = StateCell::default();
        assert_eq!(cell.load(), ConnectionState::Disconnected);

        let previous = cell.swap(ConnectionState::Connected);
        assert_eq!(previous, ConnectionState::Disconnected);
        assert!(cell.load().is_connected());
    }

    #[test]
    fn test_display_names() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "Reconnecting");
        assert_eq!(
            serde_json::to_string(&ConnectionState::Connected).unwrap(),
            "\"Connected\""
        );
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ConnectionError::NotConnected.to_string(),
            "broker is not initialized"
        );
        assert_eq!(
            ConnectionError::ReconnectExhausted { attempts: 5 }.to_string(),
            "failed to reconnect after 5 attempts"
        );
        let stopped = ConnectionError::BrokerStopped(BrokerError::Closed);
        assert!(stopped.to_string().starts_with("broker stopped unexpectedly"));
    }

    #[test]
    fn test_connection_lost_classification() {
        assert!(ConnectionError::NotConnected.is_connection_lost());
        assert!(ConnectionError::Send(BrokerError::Closed).is_connection_lost());
        let dial = BrokerError::Transport(PoolError::DialTimeout {
            addr: "hsm:1500".to_string(),
            timeout: Duration::from_secs(1),
        });
        assert!(ConnectionError::Send(dial).is_connection_lost());
        assert!(!ConnectionError::Timeout(Duration::from_secs(1)).is_connection_lost());
        assert!(!ConnectionError::Send(BrokerError::ReadTimeout(Duration::from_secs(1)))
            .is_connection_lost());
    }
}

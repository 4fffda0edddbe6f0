//! Connection state machine, reconnection policy and the manager itself

pub mod manager;
pub mod reconnect;
pub mod state;

pub use manager::{join_host_port, ConnectionSettings, HsmConnection, StateCallback};
pub use reconnect::{ReconnectConfig, ReconnectPolicy, ReconnectionDecision};
pub use state::{ConnectionError, ConnectionState, StateEvent};

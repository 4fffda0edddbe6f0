//! hsmlink - pooled, self-healing connections to a Host Security Module
//!
//! The device speaks a synchronous request/response protocol over TCP. This
//! crate keeps a pool of sockets to it, multiplexes concurrent commands over
//! that pool, and recovers from link failure with exponential backoff.
//!
//! # Layers
//!
//! - [`transport`]: framing, the socket pool and the command broker
//! - [`connection`]: the state machine ([`HsmConnection`]) and reconnection
//! - [`sender`]: batch runners for sequential or concurrent command streams
//!
//! # Quick Start
//!
//! ```no_run
//! use hsmlink::{ConnectionSettings, HsmConnection};
//! use std::time::Duration;
//!
//! # async fn demo() -> Result<(), hsmlink::ConnectionError> {
//! let hsm = HsmConnection::new(ConnectionSettings::default());
//! hsm.connect("10.0.0.5", "1500", 4).await?;
//!
//! let response = hsm.execute_command(b"0000NC", Duration::from_secs(5)).await?;
//! println!("{}", String::from_utf8_lossy(&response));
//!
//! hsm.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod observability;
pub mod sender;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, HsmConfig};
pub use connection::{
    ConnectionError, ConnectionSettings, ConnectionState, HsmConnection, StateEvent,
};
pub use error::{HsmError, HsmResult};
pub use sender::{BatchReport, CommandSender};

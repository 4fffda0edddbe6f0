//! Crate-level error type
//!
//! Each module reports its own error enum; `HsmError` gathers them for callers
//! (such as the CLI) that deal with more than one layer.

use crate::config::ConfigError;
use crate::connection::ConnectionError;
use crate::transport::{BrokerError, FrameError, PoolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HsmError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
}

impl HsmError {
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            HsmError::Config(_) | HsmError::InvalidInput { .. } => 2,
            HsmError::Connection(ConnectionError::Timeout(_)) => 4,
            HsmError::Connection(_) | HsmError::Broker(_) | HsmError::Pool(_) => 3,
            HsmError::Frame(_) => 5,
        }
    }
}

pub type HsmResult<T> = Result<T, HsmError>;

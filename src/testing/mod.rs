//! Test doubles for the transport seams
//!
//! Used by the unit tests and the integration tests under `tests/`.

pub mod mocks;

pub use mocks::*;

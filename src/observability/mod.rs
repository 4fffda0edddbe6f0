//! Logging and metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{ConnectionMetrics, MetricsSnapshot};

pub use logging::{command_span, link_span};

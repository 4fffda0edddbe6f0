//! Structured logging via tracing
//!
//! Output is controlled by environment variables:
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE (default INFO)
//! - `LOG_FORMAT`: json, pretty or compact (default compact)
//! - `LOG_SPANS`: `true` to emit span open/close events
//! - `RUST_LOG`: full filter override
//!
//! ```bash
//! LOG_FORMAT=json LOG_LEVEL=DEBUG hsmlink --host 10.0.0.5 --port 1500 watch
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Unknown values fall back to `Compact`
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Compact,
        }
    }
}

/// Map a `LOG_LEVEL` value to a tracing level; unknown values mean INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

fn build_filter(level: Level) -> EnvFilter {
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::new(rust_log);
    }

    let mut filter = EnvFilter::new(level.to_string());
    for quiet in ["tokio=warn", "mio=warn"] {
        if let Ok(directive) = quiet.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Install the global subscriber
///
/// A second call is a no-op, so tests and the binary can both call it.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let subscriber = tracing_subscriber::registry().with(build_filter(level));
    let events = span_events(include_spans);

    let _ = match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(events))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(events),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(events),
            )
            .try_init(),
    };
}

/// Initialize logging from `LOG_LEVEL`, `LOG_FORMAT` and `LOG_SPANS`
pub fn init_default_logging() {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_default());
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_default());
    let include_spans = env::var("LOG_SPANS")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    init_logging(level, format, include_spans);
}

/// Span covering one link's lifetime (connect, monitor, reconnect)
#[macro_export]
macro_rules! link_span {
    ($($field:tt)*) => {
        tracing::info_span!("hsm_link", $($field)*)
    };
}

/// Span covering one command round trip
#[macro_export]
macro_rules! command_span {
    ($($field:tt)*) => {
        tracing::debug_span!("hsm_command", $($field)*)
    };
}

pub use {command_span, link_span};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("PRETTY"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("Compact"), LogFormat::Compact);
    }

    #[test]
    fn test_unknown_format_defaults_to_compact() {
        assert_eq!(LogFormat::parse(""), LogFormat::Compact);
        assert_eq!(LogFormat::parse("xml"), LogFormat::Compact);
    }

    #[test]
    fn test_parse_level() {
        let cases = [
            ("error", Level::ERROR),
            ("WARN", Level::WARN),
            ("info", Level::INFO),
            ("Debug", Level::DEBUG),
            ("TRACE", Level::TRACE),
            ("verbose", Level::INFO),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_level(input), expected, "input: {input}");
        }
    }

    #[test]
    fn test_span_events() {
        assert_eq!(span_events(false), FmtSpan::NONE);
        assert_eq!(span_events(true), FmtSpan::NEW | FmtSpan::CLOSE);
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        init_logging(Level::WARN, LogFormat::Compact, false);
        init_logging(Level::DEBUG, LogFormat::Json, true);
    }

    #[test]
    fn test_span_macros_build_spans() {
        let _link = link_span!(endpoint = "127.0.0.1:1500", link_id = 7u64);
        let _cmd = command_span!(len = 6usize);
    }
}

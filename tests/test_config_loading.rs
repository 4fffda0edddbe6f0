//! Configuration loading and validation from files on disk

use hsmlink::config::{ConfigError, HsmConfig};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{content}").unwrap();
    file
}

#[test]
fn test_config_loads_every_section() {
    let file = config_file(
        r#"
[hsm]
host = "hsm-primary.internal"
port = "9998"
pool_size = 8
grace_period_ms = 50
command_timeout_ms = 1500

[pool]
dial_timeout_ms = 2000
idle_timeout_secs = 300
validation_interval_secs = 0
keep_alive_interval_secs = 15

[broker]
worker_count = 8
write_timeout_ms = 1000
read_timeout_ms = 3000
queue_size = 256

[reconnect]
max_attempts = 10
base_backoff_ms = 250
max_backoff_ms = 10000
multiplier = 1.5
"#,
    );

    let config = HsmConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.hsm.host, "hsm-primary.internal");
    assert_eq!(config.hsm.port, "9998");
    assert_eq!(config.hsm.pool_size, 8);
    assert_eq!(config.command_timeout(), Duration::from_millis(1500));
    assert_eq!(config.pool.validation_interval_secs, 0);
    assert_eq!(config.broker.queue_size, 256);
    assert_eq!(config.reconnect.multiplier, 1.5);

    let settings = config.connection_settings();
    assert_eq!(settings.grace_period, Duration::from_millis(50));
    assert_eq!(settings.link.pool.dial_timeout_ms, 2000);
    assert_eq!(settings.reconnect.max_attempts, 10);
    assert_eq!(
        settings.reconnect.calculate_backoff_delay(1),
        Duration::from_millis(375)
    );
}

#[test]
fn test_config_partial_file_keeps_defaults() {
    let file = config_file("[hsm]\nport = \"1501\"\n");
    let config = HsmConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.hsm.host, "127.0.0.1");
    assert_eq!(config.hsm.port, "1501");
    assert_eq!(config.broker.worker_count, 3);
    assert_eq!(config.reconnect.max_attempts, 5);
}

#[test]
fn test_config_rejects_invalid_values() {
    let cases = [
        "[hsm]\nport = \"70000\"\n",
        "[hsm]\nhost = \"\"\n",
        "[hsm]\npool_size = 0\n",
        "[broker]\nqueue_size = 0\n",
        "[reconnect]\nmultiplier = 0.5\n",
        "[reconnect]\nbase_backoff_ms = 500\nmax_backoff_ms = 100\n",
    ];

    for case in cases {
        let file = config_file(case);
        let result = HsmConfig::load_from_file(file.path());
        assert!(
            matches!(result, Err(ConfigError::InvalidConfig(_))),
            "expected rejection for {case:?}"
        );
    }
}

#[test]
fn test_config_wrong_types_fail_to_parse() {
    let file = config_file("[hsm]\npool_size = \"four\"\n");
    let result = HsmConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

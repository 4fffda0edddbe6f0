//! hsmlink command-line entry point

use clap::{Parser, Subcommand};
use hsmlink::config::HsmConfig;
use hsmlink::connection::HsmConnection;
use hsmlink::error::{HsmError, HsmResult};
use hsmlink::observability::init_default_logging;
use hsmlink::sender::CommandSender;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

/// Pooled, self-healing connection to a Host Security Module
#[derive(Parser)]
#[command(name = "hsmlink")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "HSMLINK_CONFIG")]
    config: Option<PathBuf>,

    /// HSM host, overrides the configuration file
    #[arg(long, env = "HSM_HOST")]
    host: Option<String>,

    /// HSM port, overrides the configuration file
    #[arg(long, env = "HSM_PORT")]
    port: Option<String>,

    /// Pooled sockets, overrides the configuration file
    #[arg(long)]
    pool_size: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, send a batch of one command and print the results
    Send {
        /// Command payload, sent as raw bytes
        command: String,

        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,

        /// Concurrent senders; 1 sends sequentially
        #[arg(short, long, default_value_t = 1)]
        workers: usize,

        /// Per-command timeout, overrides the configuration file
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Connect and log state changes until Ctrl-C
    Watch,
    /// Validate the configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    let config = match load_configuration(cli.config.as_deref(), &cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(e.exit_code());
        }
    };

    let result = match cli.command {
        Commands::Send {
            command,
            count,
            workers,
            timeout_ms,
        } => {
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.command_timeout());
            run_send(&config, command, count, workers, timeout).await
        }
        Commands::Watch => run_watch(&config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(e.exit_code());
    }
}

fn load_configuration(path: Option<&Path>, cli: &Cli) -> HsmResult<HsmConfig> {
    let mut config = match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            HsmConfig::load_from_file(path)?
        }
        None => {
            let default_path = Path::new("hsmlink.toml");
            if default_path.exists() {
                info!("Loading configuration from: {}", default_path.display());
                HsmConfig::load_from_file(default_path)?
            } else {
                HsmConfig::default()
            }
        }
    };

    if let Some(host) = &cli.host {
        config.hsm.host = host.clone();
    }
    if let Some(port) = &cli.port {
        config.hsm.port = port.clone();
    }
    if let Some(pool_size) = cli.pool_size {
        config.hsm.pool_size = pool_size;
    }
    config.validate()?;
    Ok(config)
}

async fn connect(config: &HsmConfig) -> HsmResult<HsmConnection> {
    let connection = HsmConnection::new(config.connection_settings());
    connection
        .connect(&config.hsm.host, &config.hsm.port, config.hsm.pool_size)
        .await?;
    info!(
        endpoint = ?connection.endpoint(),
        pool_capacity = connection.pool_capacity(),
        "Connected to HSM"
    );
    Ok(connection)
}

async fn run_send(
    config: &HsmConfig,
    command: String,
    count: usize,
    workers: usize,
    timeout: Duration,
) -> HsmResult<()> {
    if command.is_empty() {
        return Err(HsmError::invalid_input("command must not be empty"));
    }

    let connection = connect(config).await?;
    let sender = CommandSender::new(connection.clone(), timeout);
    let report = if workers > 1 {
        sender.send_concurrent(command.as_bytes(), count, workers).await
    } else {
        sender.send_sequential(command.as_bytes(), count).await
    };

    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(response) => println!(
                "#{:<5} {:>8.2?}  {}",
                outcome.index,
                outcome.latency,
                String::from_utf8_lossy(response)
            ),
            Err(e) => println!(
                "#{:<5} {:>8.2?}  ERROR: {}",
                outcome.index, outcome.latency, e
            ),
        }
    }
    println!(
        "{} sent, {} failed, {:.2} TPS over {:.2?}{}",
        report.completed,
        report.failed,
        report.tps(),
        report.elapsed,
        if report.stopped_early { " (stopped early)" } else { "" }
    );

    if let Err(e) = connection.disconnect().await {
        warn!(error = %e, "Disconnect after batch failed");
    }
    Ok(())
}

async fn run_watch(config: &HsmConfig) -> HsmResult<()> {
    let connection = connect(config).await?;
    let mut events = connection.subscribe();

    info!("Watching connection, press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => match &event.last_error {
                    Some(e) => warn!(state = %event.state, error = %e, "State changed"),
                    None => info!(state = %event.state, "State changed"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed state events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    if let Ok(metrics) = serde_json::to_string(&connection.metrics()) {
        info!(metrics = %metrics, "Final connection metrics");
    }
    if let Err(e) = connection.disconnect().await {
        warn!(error = %e, "Disconnect on shutdown failed");
    }
    Ok(())
}

fn handle_config_command(config: &HsmConfig, show: bool) -> HsmResult<()> {
    if show {
        let rendered = toml::to_string_pretty(config)
            .map_err(|e| HsmError::invalid_input(format!("cannot render configuration: {e}")))?;
        println!("{rendered}");
    }
    info!("Configuration is valid");
    Ok(())
}

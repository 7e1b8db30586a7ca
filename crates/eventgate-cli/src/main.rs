#![deny(unsafe_code)]

//! eventgate CLI: runs the ingestion daemon and talks to its control socket.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info, trace};
use tracing_subscriber::EnvFilter;

use eventgate_config::AppConfig;
use eventgate_core::endpoint::EndpointStatus;
use eventgate_core::ipc::IpcClient;

/// eventgate: local Unix-socket ingestion front door for security events.
#[derive(Parser)]
#[command(name = "eventgate", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, default_value = "eventgate.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv). Overrides `logging.level`.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon in the foreground.
    Start,

    /// Stop a running daemon.
    Stop,

    /// Show daemon status.
    Status {
        /// Print the raw JSON response.
        #[arg(long)]
        json: bool,
    },

    /// List endpoints with their state and counters.
    Endpoints {
        /// Print the raw JSON response.
        #[arg(long)]
        json: bool,
    },

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, found) = load_config(&cli.config).await?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(log_filter(cli.verbose, &config))),
        )
        .init();
    if !found {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    match cli.command {
        Commands::Start => cmd_start(config).await?,
        Commands::Stop => cmd_stop(&config).await?,
        Commands::Status { json } => cmd_status(&config, json).await?,
        Commands::Endpoints { json } => cmd_endpoints(&config, json).await?,
        Commands::Config { show } => cmd_config(&cli.config, &config, show)?,
    }

    Ok(())
}

fn log_filter(verbose: u8, config: &AppConfig) -> String {
    match verbose {
        0 => config.logging.level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

async fn cmd_start(config: AppConfig) -> Result<()> {
    info!(
        version = %eventgate_core::build_info::version_string(),
        "Starting eventgate daemon"
    );

    let mut daemon = eventgate_core::Daemon::new(config);
    let mut events = daemon
        .take_events()
        .context("event receiver already taken")?;

    // Stand-in for the analysis pipeline.
    let consumer = tokio::spawn(async move {
        let mut received = 0u64;
        while let Some(event) = events.recv().await {
            received += 1;
            trace!(
                endpoint = %event.provenance.endpoint,
                sequence = event.provenance.sequence,
                segment = event.provenance.segment,
                len = event.len(),
                truncated = event.provenance.truncated,
                "Event received"
            );
        }
        debug!(received, "Event consumer finished");
    });

    let result = daemon.run().await;
    drop(daemon);
    let _ = consumer.await;
    result.context("daemon exited with an error")
}

fn client(config: &AppConfig) -> IpcClient {
    IpcClient::new(&config.control.socket_path)
}

async fn cmd_stop(config: &AppConfig) -> Result<()> {
    let stop = client(config).stop().await?;
    println!("{}", stop.message);
    Ok(())
}

async fn cmd_status(config: &AppConfig, json: bool) -> Result<()> {
    let status = client(config).status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("eventgate {} ({})", status.version, status.git_hash);
    println!("  pid:       {}", status.pid);
    println!("  uptime:    {}s", status.uptime_secs);
    println!(
        "  queue:     {}/{} free",
        status.queue_available, status.queue_capacity
    );
    println!(
        "  endpoints: {} ({} failed)",
        status.endpoints.len(),
        status.endpoints_failed
    );
    for endpoint in &status.endpoints {
        println!("{}", endpoint_line(endpoint));
    }
    Ok(())
}

async fn cmd_endpoints(config: &AppConfig, json: bool) -> Result<()> {
    let listing = client(config).endpoints().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }
    for endpoint in &listing.endpoints {
        println!("{}", endpoint_line(endpoint));
        if let Some(error) = &endpoint.last_error {
            println!("      last error: {error}");
        }
    }
    Ok(())
}

fn endpoint_line(status: &EndpointStatus) -> String {
    let c = &status.counters;
    format!(
        "  - {} [{}] {} {}: accepted={} dropped={} truncated={} errors={}",
        status.name,
        status.transport,
        status.path.display(),
        status.state,
        c.events_accepted,
        c.events_dropped,
        c.truncated,
        c.read_errors,
    )
}

fn cmd_config(config_path: &Path, config: &AppConfig, show: bool) -> Result<()> {
    if show {
        let toml_str = toml::to_string_pretty(config).context("failed to render config")?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", config_path.display());
    }
    Ok(())
}

/// Load and validate the config, falling back to defaults when the file is
/// missing. The flag reports whether the file was found.
async fn load_config(path: &Path) -> Result<(AppConfig, bool)> {
    if path.exists() {
        let config = AppConfig::load(path)
            .await
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((AppConfig::default(), false))
    }
}

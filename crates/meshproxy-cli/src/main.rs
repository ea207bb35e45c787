//! meshproxy CLI
//!
//! Relay proxy daemon for mesh WireGuard hosts

mod config;
mod control;
mod wg;

use anyhow::Context;
use clap::{Parser, Subcommand};
use meshproxy_core::{PeerKey, ProxyContext, ProxyRuntime, RuntimeOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use config::Config;
use control::{ControlInput, ControlOutput, ControlWriter};
use wg::WgCommandDevice;

/// meshproxy - relay WireGuard traffic between hosts that cannot connect directly
#[derive(Parser)]
#[command(name = "meshproxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy, reading control messages from stdin
    Run,

    /// Print the wire hash of a public key
    Keyhash {
        /// WireGuard public key (base64)
        #[arg(required = true)]
        key: String,
    },

    /// Show the effective configuration
    Config {
        /// Write a default configuration file
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(Config::default_path);

    if let Commands::Config { init: true } = cli.command {
        return init_config(&path);
    }

    let config = if path.exists() {
        Config::load(&path).with_context(|| format!("loading {}", path.display()))?
    } else {
        Config::default()
    };

    // stdout carries control messages, so logs go to stderr
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    config.validate()?;

    match cli.command {
        Commands::Run => run_daemon(&config).await?,
        Commands::Keyhash { key } => print_key_hash(&key)?,
        Commands::Config { .. } => print_config(&config, &path)?,
    }

    Ok(())
}

/// Write a default configuration file
fn init_config(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    Config::default().save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

/// Show the configuration in effect
fn print_config(config: &Config, path: &Path) -> anyhow::Result<()> {
    println!("# {}", path.display());
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

/// Show the key hash used in frame trailers
fn print_key_hash(key: &str) -> anyhow::Result<()> {
    let key: PeerKey = key.parse().context("parsing public key")?;
    println!("{}", key.hash());
    Ok(())
}

/// Run the proxy until stdin closes or Ctrl+C
async fn run_daemon(config: &Config) -> anyhow::Result<()> {
    let key = config.public_key()?;
    let settings = config.proxy_settings()?;
    let metric_window = settings.metric_window;

    tracing::info!(
        "Starting meshproxy {} for {} on {}",
        env!("CARGO_PKG_VERSION"),
        key.short(),
        config.host.interface
    );

    let device = Arc::new(WgCommandDevice::new(config.host.interface.clone()));
    let ctx = ProxyContext::new(key, device, settings);
    let out = Arc::new(ControlWriter::new(tokio::io::stdout()));

    let options = RuntimeOptions {
        host_id: config.host.host_id.clone(),
        turn: config.turn_config(),
        signal_sink: Some(out.clone()),
    };
    let runtime = ProxyRuntime::start(ctx, options)
        .await
        .context("starting proxy runtime")?;
    tracing::info!(
        "Proxy server on {} (TURN: {})",
        runtime.server_addr(),
        if runtime.has_turn() { "up" } else { "off" }
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(metric_window);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    tracing::info!("Control input closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match ControlInput::parse(&line) {
                    Ok(ControlInput::Peers(update)) => runtime.apply(update).await?,
                    Ok(ControlInput::Signal(signal)) => runtime.signal(signal).await?,
                    Err(e) => tracing::warn!("Ignoring control line: {}", e),
                }
            }
            _ = ticker.tick() => {
                let samples = runtime.context().metrics().snapshot();
                if !samples.is_empty() {
                    out.write(&ControlOutput::Metrics { samples }).await?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    runtime.shutdown().await;
    Ok(())
}

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tabshare_relay::{AppState, RelayConfig, config};
use tracing::{error, info};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "tabshare-relay")]
#[command(about = "Real-time relay for groups sharing browser tabs")]
struct Cli {
    /// Path to relay.toml (defaults to <config dir>/tabshare/relay.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the relay (overrides config, 0 = auto-select)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "tabshare_relay=debug,tower_http=debug,info"
    } else {
        "tabshare_relay=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config_path = cli.config.unwrap_or_else(config::default_config_path);
    let mut file_config: config::FileConfig = config::load_config(&config_path)
        .extract()
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    if let Some(host) = cli.host {
        file_config.server.host = host;
    }
    if let Some(port) = cli.port {
        file_config.server.port = port;
    }
    let relay_config = RelayConfig::from_file(&file_config)?;
    relay_config.liveness.check_ordering();

    info!(
        "Relay config: history={} tabs/group, timeout={:?}, grace={:?}, sweep every {:?}",
        relay_config.history_capacity,
        relay_config.liveness.connection_timeout,
        relay_config.liveness.group_grace,
        relay_config.liveness.sweep_interval
    );

    let addr = relay_config.bind_addr;
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    let shutdown_signal = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal, stopping relay...");
    };

    tabshare_relay::serve(listener, AppState::new(relay_config), shutdown_signal)
        .await
        .context("relay server failed")
}

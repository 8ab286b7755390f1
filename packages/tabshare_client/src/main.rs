use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabshare_client::{
    AgentEvent, AgentHandle, ClientConfig, ClusterCoordinator, HttpClassifier, JsonFileStore,
    PartitionSource, Reconciled, RelayHandle, TabAgent, TabStore, config, spawn_relay_client,
};
use tabshare_protocol::ServerMessage;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "tabshare")]
#[command(about = "Share browser tabs with a group in real time")]
struct Cli {
    /// Path to client.toml (defaults to <config dir>/tabshare/client.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a group and print its tabs and clusters as they change
    Watch {
        #[arg(short, long)]
        group: String,
    },

    /// Share one tab into a group, then exit
    Share {
        #[arg(short, long)]
        group: String,
        #[arg(long)]
        url: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        summary: Option<String>,
    },
}

/// How long `share` waits for the relay before giving up.
const SHARE_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "tabshare_client=debug,tabshare=debug,info"
    } else {
        "tabshare_client=info,tabshare=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let config_path = cli.config.unwrap_or_else(config::default_config_path);
    let client_config = ClientConfig::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let store = Arc::new(
        JsonFileStore::open(&client_config.store_path)
            .await
            .with_context(|| format!("failed to open {}", client_config.store_path.display()))?,
    );
    let stored_key = store.api_key().unwrap_or_else(|e| {
        warn!("Failed to read stored credential: {}", e);
        None
    });
    let classifier = HttpClassifier::new(&client_config.classifier)
        .context("failed to build classification client")?
        .with_fallback_key(stored_key);
    let coordinator = Arc::new(
        ClusterCoordinator::new(Arc::new(classifier), client_config.classifier.timeout)
            .with_store(store.clone()),
    );

    let (relay, relay_task) = spawn_relay_client(client_config.relay.clone());
    let (agent, agent_task) =
        TabAgent::new(relay.clone(), store.clone(), coordinator.clone()).spawn();

    let result = match cli.command {
        Commands::Watch { group } => watch(&relay, &agent, &coordinator, group).await,
        Commands::Share {
            group,
            url,
            title,
            summary,
        } => share(&relay, &agent, group, title, url, summary).await,
    };

    agent.shutdown().await;
    relay.shutdown().await;
    let _ = agent_task.await;
    let _ = relay_task.await;
    if let Err(e) = store.flush().await {
        warn!("Local state may be incomplete: {}", e);
    }
    result
}

async fn join_and_wait(relay: &RelayHandle, group: String) -> Result<()> {
    let mut inbound = relay.subscribe();
    relay.join(group.clone()).await?;
    loop {
        match inbound.recv().await {
            Ok(ServerMessage::GroupJoined {
                group_id,
                member_count,
            }) if group_id == group => {
                info!(group = %group_id, members = member_count, "Joined group");
                return Ok(());
            }
            Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => bail!("relay client stopped"),
        }
    }
}

async fn share(
    relay: &RelayHandle,
    agent: &AgentHandle,
    group: String,
    title: String,
    url: String,
    summary: Option<String>,
) -> Result<()> {
    tokio::time::timeout(SHARE_TIMEOUT, join_and_wait(relay, group.clone()))
        .await
        .context("timed out waiting for the relay")??;

    match agent.share(title, url.clone(), summary).await? {
        Reconciled::Duplicate(kept) => {
            eprintln!("Already shared in {} by {}", group, display_sharer(&kept.shared_by));
        }
        _ => eprintln!("Shared {} with {}", url, group),
    }
    Ok(())
}

async fn watch<C: tabshare_client::Classifier>(
    relay: &RelayHandle,
    agent: &AgentHandle,
    coordinator: &ClusterCoordinator<C>,
    group: String,
) -> Result<()> {
    let mut events = agent.subscribe();
    let mut views = coordinator.subscribe();
    relay.join(group.clone()).await?;
    eprintln!("Watching {} (Ctrl+C to stop)", group);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = events.recv() => match event {
                Ok(AgentEvent::Reconciled(Reconciled::Appended(tab))) => {
                    println!("+ {} <{}>", tab.title, tab.url);
                }
                Ok(AgentEvent::Reconciled(Reconciled::Duplicate(tab))) => {
                    println!("= {} was already shared", tab.url);
                }
                Ok(AgentEvent::Reconciled(Reconciled::Replaced { tabs, .. })) => {
                    println!("* {} has {} shared tabs", group, tabs);
                }
                Ok(AgentEvent::Reconciled(Reconciled::Annotated(note))) => {
                    println!("# note from {}: {}", note.created_by, note.data);
                }
                Ok(AgentEvent::Members { member_count }) => {
                    println!("* {} members online", member_count);
                }
                Ok(AgentEvent::PeerClusters { updated_by, .. }) => {
                    println!("* {} published new clusters", updated_by);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            },
            changed = views.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let view = views.borrow_and_update().clone();
                let label = match view.source {
                    PartitionSource::Fallback => "by site",
                    PartitionSource::Semantic => "by topic",
                };
                println!("Clusters ({label}):");
                for cluster in &view.clusters {
                    println!("  {} ({} tabs): {}", cluster.name, cluster.tabs.len(), cluster.theme);
                }
                if let Some(warning) = view.warning {
                    println!("  ! {}", warning);
                }
            }
        }
    }
}

fn display_sharer(shared_by: &str) -> &str {
    if shared_by.is_empty() { "you" } else { shared_by }
}

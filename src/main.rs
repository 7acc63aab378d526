use clap::Parser;
use solisync::cluster::AuthScheme;
use solisync::{SyncConfig, SyncManager};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "solisync")]
#[command(about = "Solisync - replicated, vector-clock versioned key-value stores", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding persistent stores
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Port for node-to-node traffic when none is stored locally
    #[arg(short, long)]
    port: Option<u16>,

    /// Seeds to join (comma separated host:port); empty starts a new cluster
    #[arg(long)]
    seeds: Option<String>,

    /// Hostname other nodes should use to reach this one
    #[arg(long)]
    hostname: Option<String>,

    /// Authentication scheme (NO_AUTH or CHALLENGE_RESPONSE)
    #[arg(long)]
    auth_scheme: Option<AuthScheme>,

    /// Key store holding the shared secret
    #[arg(long)]
    keystore: Option<PathBuf>,

    /// Keep persistent stores in memory
    #[arg(long)]
    no_persistence: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "solisync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => SyncConfig::load(path)?,
        None => {
            let _ = dotenvy::dotenv();
            let mut config = SyncConfig::default();
            config.apply_env_overrides()?;
            config
        }
    };
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if let Some(port) = args.port {
        config.default_port = port;
    }
    if let Some(scheme) = args.auth_scheme {
        config.auth_scheme = scheme;
    }
    if let Some(keystore) = args.keystore {
        config.keystore_path = Some(keystore);
    }
    if args.no_persistence {
        config.persistence_enabled = false;
    }
    config.validate()?;
    tracing::info!("Starting with {:?}", config);

    let manager = SyncManager::new(config)?;
    let cluster = manager.cluster_service();
    if let Some(hostname) = &args.hostname {
        cluster.set_local_node_host(hostname)?;
    }
    if let Some(seeds) = &args.seeds {
        cluster.set_seeds(seeds)?;
    }

    manager.start().await?;
    if let Some(addr) = manager.rpc().local_addr() {
        tracing::info!("Node-to-node RPC listening on {}", addr);
    }

    shutdown_signal().await;
    manager.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

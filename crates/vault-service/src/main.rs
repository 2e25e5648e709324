use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vault_core::StorageConfig;
use vault_service::{build_router, dev_connectors, ServiceConfig, ServiceState};

#[derive(Debug, Parser)]
#[command(name = "vaultd", version, about = "Multi-signer custody wallet REST service")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON by extension).
    #[arg(short, long, env = "VAULT_CONFIG")]
    config: Option<PathBuf>,

    /// REST socket address to bind, e.g. 127.0.0.1:8092
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Persist wallet snapshots to this JSON file instead of memory.
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Principal of the first signer when no snapshot exists yet.
    #[arg(long)]
    owner: Option<String>,

    /// Log filter, overridden by RUST_LOG.
    #[arg(long)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    log_json: bool,
}

fn resolve_config(cli: &Cli) -> anyhow::Result<ServiceConfig> {
    let mut config = ServiceConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(path) = &cli.state_file {
        config.storage = StorageConfig::file(path.clone());
    }
    if let Some(owner) = &cli.owner {
        config.owner = owner.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.log_json {
        config.logging.json = true;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());
    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let connectors = dev_connectors(&config)?;
    let state = ServiceState::bootstrap(&config, connectors)?;
    info!(
        storage = state.store.label(),
        path = ?state.store.path(),
        owner = %config.owner,
        "vault-service state ready"
    );
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr).await?;
    info!("vault-service REST listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

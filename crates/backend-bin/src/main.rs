use anyhow::Context;
use chathub_backend::{
    auth::JwtAuthenticator,
    config::Settings,
    storage::{FlatFileStorage, MemoryStorage, MessageStore, PresenceStore},
    ws_router, AppState,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Real-time one-to-one chat server
#[derive(Debug, Parser)]
#[command(name = "chathub", version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config/default.toml")]
    config: PathBuf,

    /// Keep messages and presence in memory instead of the data directory
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Settings::load_from(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    init_tracing(&settings);

    let (messages, presence) = if args.in_memory {
        tracing::warn!("running with in-memory storage, nothing is persisted");
        stores(Arc::new(MemoryStorage::new()))
    } else {
        let storage = FlatFileStorage::open(&settings.data_dir)
            .await
            .with_context(|| format!("opening data directory {}", settings.data_dir.display()))?;
        stores(Arc::new(storage))
    };

    let auth = Arc::new(JwtAuthenticator::new(settings.auth.jwt_secret.as_bytes()));
    let bind_addr = settings.bind_addr;
    let state = Arc::new(AppState::new(settings, auth, messages, presence));
    let app = ws_router::create_router(state.clone());

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    // upgraded sockets outlive `serve`; let their pumps send the close frame
    state.drain_connections(state.settings.hub.shutdown_grace()).await;
    tracing::info!("server stopped");
    Ok(())
}

fn stores<T>(storage: Arc<T>) -> (Arc<dyn MessageStore>, Arc<dyn PresenceStore>)
where
    T: MessageStore + PresenceStore + 'static,
{
    let messages: Arc<dyn MessageStore> = storage.clone();
    let presence: Arc<dyn PresenceStore> = storage;
    (messages, presence)
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if settings.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Resolves on ctrl-c after closing every live connection
async fn shutdown_signal(state: Arc<AppState>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");

    if let Err(e) = state.hub.shutdown().await {
        tracing::warn!(error = %e, "hub did not shut down cleanly");
    }
}

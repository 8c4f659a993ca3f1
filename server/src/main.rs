use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use parley_server::auth::listener::AuthServer;
use parley_server::auth::token::TokenAuthority;
use parley_server::collab::localization::TableLocalizer;
use parley_server::collab::profile::HttpProfileSource;
use parley_server::config::ServerConfig;
use parley_server::db::pool::{create_pool, run_migrations};
use parley_server::db::snapshots::SnapshotStore;
use parley_server::engine::chat_hub::{ChatHub, SaveOutcome};
use parley_server::engine::tasks;
use parley_server::web::app_state::AppState;
use parley_server::web::router::build_router;

#[derive(Debug, Parser)]
#[command(name = "parley-server", about = "Parley chat backend")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "parley.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::load(&cli.config)?;

    // The chat still runs without a database, it just forgets on restart
    let store = match open_store(&config.database.url).await {
        Ok(store) => Some(store),
        Err(e) => {
            error!(error = %e, "database unavailable, running without persistence");
            None
        }
    };

    let tokens = Arc::new(TokenAuthority::new(config.auth.token_lifetime()));
    let profiles = HttpProfileSource::new(
        config.profile.base_url.clone(),
        std::time::Duration::from_secs(config.profile.timeout_secs),
    )
    .context("failed to build profile client")?;

    let mut hub = ChatHub::new(config.clone(), tokens.clone(), Arc::new(profiles));
    if let Some(path) = &config.localization.strings_file {
        hub = hub.with_localizer(Arc::new(TableLocalizer::load_or_empty(path)));
    }
    if let Some(store) = store {
        hub = hub.with_store(store);
    }
    let hub = Arc::new(hub);
    hub.load_from_store().await;

    let auth_server = AuthServer::start(&config.server.auth_address, tokens, &config.auth)
        .await
        .with_context(|| format!("failed to bind auth listener on {}", config.server.auth_address))?;

    let cancel = CancellationToken::new();
    let task_handles = tasks::spawn_all(&hub, &cancel);

    let app = build_router(Arc::new(AppState { hub: hub.clone() }));
    let listener = tokio::net::TcpListener::bind(&config.server.chat_address)
        .await
        .with_context(|| format!("failed to bind chat listener on {}", config.server.chat_address))?;

    info!(
        "Parley server starting (chat: {}, auth: {})",
        config.server.chat_address,
        auth_server.local_addr()
    );

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("chat server error")?;

    info!("shutting down");
    cancel.cancel();
    for handle in task_handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    auth_server.stop().await;
    match hub.periodic_save().await {
        SaveOutcome::Saved { sequence } => info!(sequence, "final save complete"),
        SaveOutcome::Disabled => {}
        other => warn!(outcome = ?other, "final save did not complete"),
    }
    Ok(())
}

async fn open_store(url: &str) -> Result<SnapshotStore, sqlx::Error> {
    let pool = create_pool(url).await?;
    run_migrations(&pool).await?;
    Ok(SnapshotStore::new(pool))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
}

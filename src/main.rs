use std::sync::Arc;

use gateway_relayer::api::{self, AppState};
use gateway_relayer::chain::connect_all;
use gateway_relayer::config::Config;
use gateway_relayer::store::{InMemoryStore, RequestStore};
use gateway_relayer::RelayLoop;
use tokio_util::sync::CancellationToken;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting gateway relayer");

    let config = Config::load()?;
    tracing::info!(
        chains = config.chains.len(),
        routes = config.routes.len(),
        api_addr = %config.api_addr,
        "Configuration loaded"
    );

    let chains = connect_all(&config).await?;
    tracing::info!("All chains connected");

    let store: Arc<dyn RequestStore> = Arc::new(InMemoryStore::new());
    let relay = RelayLoop::new(
        chains,
        config.resolved_routes()?,
        store.clone(),
        config.relay_settings(),
    )?;

    let cancel = CancellationToken::new();

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            wait_for_shutdown_signal().await;
            cancel.cancel();
        }
    });

    let api_state = AppState::new(store, relay.subscribe());
    let api_addr = config.api_addr.clone();
    let api_cancel = cancel.clone();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api::serve(&api_addr, api_state, api_cancel).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    let result = relay.run(cancel.clone()).await;
    cancel.cancel();
    api::join_server(api_task).await;

    result?;
    tracing::info!("Gateway relayer stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,gateway_relayer=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}

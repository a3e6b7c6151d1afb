//! Main Entrypoint for the Mike Agent Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging and, when configured, Langfuse tracing.
//! 3. Building the context strategy every session resolves participants with.
//! 4. Constructing the Axum router.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use mike_agent::{
    config::{Config, ContextStrategyKind},
    router::create_router,
    state::AppState,
    telemetry::TracingClient,
};
use mike_core::{
    context::HttpContextFetcher,
    strategy::{
        ContextStrategy, EmbeddedContextStrategy, RemoteContextStrategy, TokenTemplateStrategy,
    },
};
use std::{net::SocketAddr, sync::Arc};
use tracing::{info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

fn build_strategy(config: &Config) -> anyhow::Result<Arc<dyn ContextStrategy>> {
    let strategy: Arc<dyn ContextStrategy> = match config.context_strategy {
        ContextStrategyKind::Remote => {
            let base_url = config
                .context_api_base_url
                .clone()
                .context("CONTEXT_API_BASE_URL is required for the remote strategy")?;
            let fetcher = HttpContextFetcher::new(base_url)?;
            Arc::new(RemoteContextStrategy::new(Arc::new(fetcher)))
        }
        ContextStrategyKind::Token => Arc::new(TokenTemplateStrategy),
        ContextStrategyKind::Embedded => Arc::new(EmbeddedContextStrategy),
    };
    Ok(strategy)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging and Tracing ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    let tracing_client = match &config.tracing {
        Some(settings) => match TracingClient::new(settings) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                warn!(error = %e, "Langfuse tracing disabled");
                None
            }
        },
        None => {
            warn!("Langfuse credentials not set, tracing disabled");
            None
        }
    };

    // --- 3. Initialize the Context Strategy ---
    let strategy = build_strategy(&config)?;
    info!(strategy = ?config.context_strategy, "Context strategy ready.");

    let app_state = Arc::new(AppState {
        config: Arc::new(config.clone()),
        strategy,
        tracing: tracing_client.clone(),
    });

    // --- 4. Create Router ---
    let app = create_router(app_state);

    // --- 5. Start Server ---
    info!(
        provider = ?config.provider,
        model = %config.realtime_model,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Some(client) = tracing_client {
        tokio::task::spawn_blocking(move || client.flush()).await?;
    }
    info!("Server has shut down.");
    Ok(())
}

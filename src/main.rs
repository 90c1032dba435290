use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use ridehail_dispatch::api;
use ridehail_dispatch::auth::JwtVerifier;
use ridehail_dispatch::bus::amqp::AmqpBus;
use ridehail_dispatch::bus::memory::InMemoryBus;
use ridehail_dispatch::bus::{declare_topology, MessageBus};
use ridehail_dispatch::config::Config;
use ridehail_dispatch::engine;
use ridehail_dispatch::error::AppError;
use ridehail_dispatch::observability::metrics::Metrics;
use ridehail_dispatch::state::{AppState, Repositories};
use ridehail_dispatch::store::memory::MemoryStore;
use ridehail_dispatch::store::postgres::PgStore;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;
    init_tracing(&config);

    let repos = match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url, config.database_max_connections).await?;
            store.migrate().await?;
            Repositories::from_store(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            Repositories::from_store(Arc::new(MemoryStore::new()))
        }
    };

    let bus: Arc<dyn MessageBus> = match &config.bus.amqp_url {
        Some(url) => Arc::new(AmqpBus::connect(url, config.bus.prefetch).await?),
        None => {
            tracing::warn!("AMQP_URL not set, using in-memory bus");
            Arc::new(InMemoryBus::new(config.bus.prefetch))
        }
    };
    declare_topology(bus.as_ref()).await?;

    let verifier = Arc::new(JwtVerifier::new(&config.jwt_secret, config.jwt_issuer.clone()));
    let (app_state, hub_loop) = AppState::new(&config, repos, bus, verifier, Metrics::new());
    let shared_state = Arc::new(app_state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let hub_task = tokio::spawn(hub_loop.run(shutdown_rx.clone()));
    let mut background = engine::spawn_consumers(&shared_state, shutdown_rx.clone());
    background.push(tokio::spawn({
        let state = shared_state.clone();
        async move {
            state
                .locations
                .run_pruner(engine::location::PRUNE_EVERY, shutdown_rx)
                .await
        }
    }));

    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "http server started");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Stops the hub and consumers too, which closes every live socket.
            let _ = shutdown_tx.send(true);
        })
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")));

    for task in background {
        if let Err(err) = task.await {
            tracing::error!(error = %err, "background task panicked");
        }
    }
    if let Err(err) = hub_task.await {
        tracing::error!(error = %err, "hub task panicked");
    }

    tracing::info!("shutdown complete");
    served
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}

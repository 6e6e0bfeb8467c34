//! Presence Coordinator
//!
//! Long-running service that:
//! - Subscribes to shard lifecycle events on the input channel
//! - Mirrors every shard's connections and keeps global presence in Redis
//! - Probes silent shards and tears down dead ones
//! - Exposes health/ready endpoints and Prometheus metrics

use anyhow::Result;
use presence_coordinator::bus::{ControlPublisher, InputSubscriber};
use presence_coordinator::config::CoordinatorConfig;
use presence_coordinator::coordinator::{Coordinator, CoordinatorHandle};
use presence_coordinator::flags::{self, RuntimeFlags};
use presence_coordinator::health::{self, AppState};
use presence_coordinator::metrics::CoordinatorMetrics;
use presence_coordinator::observer::{bootstrap_observer, ObserverHandle, StoreObserver};
use presence_coordinator::shard::ShardState;
use presence_coordinator::store::{KeyLayout, RedisStore, StoreClient};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let config = CoordinatorConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("presence_coordinator={}", config.log_level).parse()?)
                .add_directive("redis=warn".parse()?),
        )
        .json()
        .init();

    let instance_id = uuid::Uuid::new_v4().to_string();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        instance_id = %instance_id,
        input_channel = %config.redis.input_channel,
        output_channel = %config.redis.output_channel,
        "Starting presence coordinator"
    );

    let metrics = CoordinatorMetrics::install()?;
    info!("Prometheus metrics initialized");

    let redis_store = Arc::new(RedisStore::open(&config.redis.url)?);
    let redis_client = redis_store.client().clone();
    let store: Arc<dyn StoreClient> = redis_store;

    let runtime_flags = RuntimeFlags::from_config(&config.flags);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    if let Some(registry_key) = config.flags.registry_key.clone() {
        tokio::spawn(flags::run_registry_refresh(
            runtime_flags.clone(),
            Arc::clone(&store),
            registry_key,
            Duration::from_millis(config.flags.refresh_interval_ms),
            shutdown_tx.subscribe(),
        ));
    }

    // The store is wiped before any shard traffic is accepted
    let observer = bootstrap_observer(StoreObserver::new(
        Arc::clone(&store),
        KeyLayout::new(config.keys.clone()),
        config.redis.stream_events_channel.clone(),
        Arc::new(runtime_flags),
    ))
    .await;
    let observer = ObserverHandle::spawn(observer);

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let publisher = ControlPublisher::new(Arc::clone(&store), config.redis.output_channel.clone());
    let publisher_task = tokio::spawn(Arc::clone(&publisher).run(control_rx));

    let shard_state = ShardState::new(instance_id);
    let coordinator = Coordinator::new(
        observer.clone(),
        config.keepalive.clone(),
        control_tx,
        shard_state.clone(),
    );
    let (handle, input_rx) = CoordinatorHandle::channel();
    let coordinator_task = tokio::spawn(coordinator.run(input_rx, shutdown_tx.subscribe()));

    let subscriber = InputSubscriber::new(redis_client, config.redis.input_channel.clone(), handle);
    let subscriber_task = tokio::spawn(Arc::clone(&subscriber).run(shutdown_tx.subscribe()));

    let app_state = AppState {
        shard_state,
        subscriber,
        observer,
        metrics,
    };

    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], config.http.port).into();

    info!(port = config.http.port, "Starting HTTP server");

    let http_server = axum::serve(tokio::net::TcpListener::bind(addr).await?, health_router);

    tokio::select! {
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    // Graceful shutdown
    info!("Shutting down presence coordinator...");
    let _ = shutdown_tx.send(());

    if let Err(e) = subscriber_task.await {
        error!(error = %e, "Input subscriber task failed");
    }
    // Waits for pending store updates; dropping the coordinator closes the
    // control queue so the publisher drains and exits.
    if let Err(e) = coordinator_task.await {
        error!(error = %e, "Coordinator task failed");
    }
    if let Err(e) = publisher_task.await {
        error!(error = %e, "Control publisher task failed");
    }

    info!(
        control_published = publisher.messages_published(),
        "Presence coordinator shutdown complete"
    );
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
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
}

//! Process wiring: connect, spawn, serve, shut down.

use crate::config::Config;
use crate::routes::build_router;
use crate::state::AppState;
use crate::subscriber::{ConfirmationSubscriber, DEFAULT_DEDUP_CAPACITY};
use anyhow::Context;
use outbox_core::channel::NotificationChannel;
use outbox_core::idempotency::IdempotencyError;
use outbox_core::store::StoreError;
use outbox_postgres::PostgresStore;
use outbox_redis::{RedisIdempotencyStore, RedisNotificationChannel};
use outbox_runtime::metrics::MetricsServer;
use outbox_runtime::retry::retry_connect;
use outbox_runtime::{IdempotencyGuard, OrderService, TransactionalWriter, spawn_relay_workers};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Connected backing stores.
pub struct Backends {
    /// Orders and outbox
    pub store: PostgresStore,
    /// Idempotency keys
    pub idempotency: RedisIdempotencyStore,
    /// `order.created` pub/sub
    pub channel: Arc<dyn NotificationChannel>,
}

impl Backends {
    /// Connect `PostgreSQL` (applying the schema) and Redis.
    ///
    /// Each connection is retried per the startup policy before giving up.
    ///
    /// # Errors
    ///
    /// Returns an error once a backing store has exhausted its attempts.
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let policy = config.retry_policy();
        let pool_config = config.pool_config();
        let (database_url, redis_url) = (config.postgres.url.as_str(), config.redis.url.as_str());
        let pool_config = &pool_config;

        let store = retry_connect("postgres", &policy, || async move {
            let store = PostgresStore::connect(database_url, pool_config).await?;
            store.apply_schema().await?;
            Ok::<_, StoreError>(store)
        })
        .await
        .context("PostgreSQL unreachable")?;

        let idempotency = retry_connect("redis", &policy, || async move {
            let store = RedisIdempotencyStore::connect(redis_url).await?;
            store.ping().await?;
            Ok::<_, IdempotencyError>(store)
        })
        .await
        .context("Redis unreachable")?;

        let channel = retry_connect("redis-pubsub", &policy, || async move {
            RedisNotificationChannel::connect(redis_url).await
        })
        .await
        .context("Redis pub/sub unreachable")?;

        Ok(Self {
            store,
            idempotency,
            channel: Arc::new(channel),
        })
    }
}

/// Run the service until Ctrl+C or SIGTERM.
///
/// 1. Connect the backing stores
/// 2. Install the Prometheus recorder
/// 3. Spawn the relay workers and the confirmation subscriber
/// 4. Serve HTTP with graceful shutdown
/// 5. Signal background tasks and wait up to the shutdown timeout for them
///
/// # Errors
///
/// Returns an error if a backing store is unreachable, the listener cannot
/// bind, or the HTTP server fails.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let backends = Backends::connect(&config).await?;

    let listener = TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr()))?;
    let local_addr = listener.local_addr()?;

    let mut metrics = MetricsServer::new(local_addr);
    metrics.start()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = spawn_relay_workers(
        &backends.store,
        &backends.channel,
        &config.relay_config(),
        config.relay.workers,
        &shutdown_rx,
    );
    info!(workers = handles.len(), "Relay workers started");

    handles.push(tokio::spawn(
        ConfirmationSubscriber::new(DEFAULT_DEDUP_CAPACITY)
            .run(Arc::clone(&backends.channel), shutdown_rx),
    ));

    let service = OrderService::new(
        IdempotencyGuard::new(backends.idempotency, config.guard_config()),
        TransactionalWriter::new(backends.store, config.writer_config()),
    );
    let app = build_router(AppState::new(service, metrics.handle().cloned()));

    info!(address = %local_addr, "Server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped, stopping background tasks");
    let _ = shutdown_tx.send(true);
    await_shutdown(handles, Duration::from_secs(config.server.shutdown_timeout)).await;

    info!("Graceful shutdown complete");
    Ok(())
}

async fn await_shutdown(handles: Vec<JoinHandle<()>>, timeout: Duration) {
    let joined = tokio::time::timeout(timeout, futures::future::join_all(handles)).await;
    match joined {
        Ok(results) => {
            for (idx, result) in results.into_iter().enumerate() {
                if let Err(e) = result {
                    warn!(task = idx, error = %e, "Background task failed");
                }
            }
        }
        Err(_) => warn!(timeout_secs = timeout.as_secs(), "Background task shutdown timed out"),
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}

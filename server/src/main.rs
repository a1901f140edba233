//! Order service binary.
//!
//! ```bash
//! docker compose up -d postgres redis
//! cargo run --bin outbox-server
//! ```

use outbox_server::{Config, lifecycle, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let config = Config::from_env();
    telemetry::init_tracing(&config.server.log_level)?;
    config.validate()?;

    tracing::info!(
        bind = %config.bind_addr(),
        relay_workers = config.relay.workers,
        batch_size = config.relay.batch_size,
        "Configuration loaded"
    );

    lifecycle::run(config).await
}

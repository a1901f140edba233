//! Fire concurrent `POST /orders` requests at a running server.
//!
//! Each request carries its own `Idempotency-Key: test-order-{i}`, so every
//! one of them should create an order. Run it twice to see every request
//! replayed instead.
//!
//! ```bash
//! cargo run --bin load-orders                      # 100 orders to localhost:8080
//! cargo run --bin load-orders -- http://host:8080/orders 500
//! ```

use reqwest::{Client, StatusCode};
use std::time::Instant;
use tokio::task::JoinSet;

const DEFAULT_URL: &str = "http://localhost:8080/orders";
const DEFAULT_COUNT: usize = 100;

enum Outcome {
    Created,
    Replayed,
    Failed,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let mut args = std::env::args().skip(1);
    let url = args
        .next()
        .or_else(|| std::env::var("LOAD_ORDERS_URL").ok())
        .unwrap_or_else(|| DEFAULT_URL.to_string());
    let count = args
        .next()
        .or_else(|| std::env::var("LOAD_ORDERS_COUNT").ok())
        .map_or(Ok(DEFAULT_COUNT), |raw| raw.parse())?;

    let client = Client::new();
    let start = Instant::now();

    let mut requests = JoinSet::new();
    for id in 0..count {
        let client = client.clone();
        let url = url.clone();
        requests.spawn(async move { send(&client, &url, id).await });
    }

    let (mut created, mut replayed, mut failed) = (0usize, 0usize, 0usize);
    while let Some(joined) = requests.join_next().await {
        match joined {
            Ok(Outcome::Created) => created += 1,
            Ok(Outcome::Replayed) => replayed += 1,
            Ok(Outcome::Failed) | Err(_) => failed += 1,
        }
    }

    let elapsed = start.elapsed();
    #[allow(clippy::cast_precision_loss)]
    let rate = count as f64 / elapsed.as_secs_f64().max(f64::EPSILON);

    println!("\n--- Summary ---");
    println!("Total: {count} orders");
    println!("Created: {created}");
    println!("Replayed: {replayed}");
    println!("Failed: {failed}");
    println!("Duration: {elapsed:?}");
    println!("Rate: {rate:.2} orders/sec");
    Ok(())
}

async fn send(client: &Client, url: &str, id: usize) -> Outcome {
    let response = client
        .post(url)
        .header("Idempotency-Key", format!("test-order-{id}"))
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            println!("[{id}] ERROR: {e}");
            return Outcome::Failed;
        }
    };

    let status = response.status();
    let replayed = response.headers().contains_key("idempotent-replayed");
    let body = response.text().await.unwrap_or_default();
    println!("[{id}] {}: {body}", status.as_u16());

    match status {
        StatusCode::CREATED if replayed => Outcome::Replayed,
        StatusCode::CREATED => Outcome::Created,
        _ => Outcome::Failed,
    }
}

//! End-to-end fan-out benchmark for Relay.
//!
//! Connects N WebSocket subscribers, then publishes over HTTP as fast as the
//! server accepts and counts what the subscribers receive.

use futures_util::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SERVER_ADDR: &str = "127.0.0.1:8080";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;
const PAYLOAD_SIZE: usize = 64;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║          Relay End-to-End Fan-out Benchmark                  ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running: cargo run --release        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    if let Err(e) = run_fanout_benchmark(num_clients).await {
        eprintln!("Benchmark failed: {}", e);
    }
}

async fn run_fanout_benchmark(num_clients: usize) -> Result<(), BoxError> {
    println!("📊 Fan-out Benchmark: {} subscribers", num_clients);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let received = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();
    for client_id in 0..num_clients {
        let received = Arc::clone(&received);
        let barrier = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_subscriber(received, barrier).await {
                eprintln!("Subscriber {} error: {}", client_id, e);
            }
        }));
    }

    barrier.wait().await;
    println!("✓ All {} subscribers connected", num_clients);

    let publisher = Publisher::new(SERVER_ADDR)?;
    let payload = vec![b'x'; PAYLOAD_SIZE];

    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    let warmup_end = Instant::now() + Duration::from_secs(WARMUP_SECS);
    while Instant::now() < warmup_end {
        publisher.publish(&payload).await?;
    }

    received.store(0, Ordering::SeqCst);
    let mut published = 0u64;
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    while start.elapsed() < Duration::from_secs(BENCH_SECS) {
        publisher.publish(&payload).await?;
        published += 1;
    }

    let elapsed = start.elapsed();
    let delivered = received.load(Ordering::SeqCst);
    let publishes_per_sec = published as f64 / elapsed.as_secs_f64();
    let deliveries_per_sec = delivered as f64 / elapsed.as_secs_f64();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Subscribers:          {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Publishes:            {:>10}                           ║",
        published
    );
    println!(
        "║  Publish rate:         {:>10.0} req/s                    ║",
        publishes_per_sec
    );
    println!(
        "║  Delivery rate:        {:>10.0} msg/s                    ║",
        deliveries_per_sec
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
    Ok(())
}

async fn run_subscriber(received: Arc<AtomicU64>, barrier: Arc<Barrier>) -> Result<(), BoxError> {
    let (ws, _) = connect_async(format!("ws://{}/subscribe", SERVER_ADDR)).await?;
    let (_sender, mut receiver) = ws.split();

    barrier.wait().await;

    while let Some(result) = receiver.next().await {
        match result? {
            Message::Text(_) | Message::Binary(_) => {
                received.fetch_add(1, Ordering::Relaxed);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

/// Publishes over one pooled keep-alive HTTP client.
struct Publisher {
    client: reqwest::Client,
    url: String,
}

impl Publisher {
    fn new(addr: &str) -> Result<Self, BoxError> {
        let client = reqwest::Client::builder().tcp_nodelay(true).build()?;
        Ok(Self {
            client,
            url: format!("http://{}/publish", addr),
        })
    }

    /// Send one publish and check for `204 No Content`.
    async fn publish(&self, payload: &[u8]) -> Result<(), BoxError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(payload.to_vec())
            .send()
            .await?;

        if response.status() != reqwest::StatusCode::NO_CONTENT {
            return Err(format!("publish failed: {}", response.status()).into());
        }
        Ok(())
    }
}

//! End-to-end throughput benchmark for Meteor.
//!
//! This benchmark measures actual Bayeux broadcast throughput over WebSocket
//! with real network I/O. Every client handshakes, subscribes to one channel
//! and publishes to it as fast as it can.

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const SERVER_URL: &str = "ws://127.0.0.1:8080/cometd";
const CHANNEL: &str = "/benchmark/broadcast";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type Receiver = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         Meteor End-to-End Throughput Benchmark               ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running: cargo run --release        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_pubsub_benchmark(num_clients).await;
}

async fn run_pubsub_benchmark(num_clients: usize) {
    println!("📊 Pub/Sub Benchmark: {} clients", num_clients);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let message_count = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    for client in 0..num_clients {
        let msg_count = Arc::clone(&message_count);
        let barrier = Arc::clone(&barrier);

        let handle = tokio::spawn(async move {
            if let Err(e) = run_client(msg_count, barrier).await {
                eprintln!("Client {} error: {}", client, e);
            }
        });
        handles.push(handle);
    }

    // Wait for all clients to subscribe
    barrier.wait().await;
    println!("✓ All {} clients subscribed", num_clients);

    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    message_count.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total_messages = message_count.load(Ordering::SeqCst);

    let msgs_per_sec = total_messages as f64 / elapsed.as_secs_f64();
    let msgs_per_sec_per_client = msgs_per_sec / num_clients as f64;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!(
        "║  Clients:              {:>10}                           ║",
        num_clients
    );
    println!(
        "║  Duration:             {:>10.2}s                          ║",
        elapsed.as_secs_f64()
    );
    println!(
        "║  Deliveries:           {:>10}                           ║",
        total_messages
    );
    println!(
        "║  Throughput:           {:>10.0} msg/s                    ║",
        msgs_per_sec
    );
    println!(
        "║  Per-Client:           {:>10.0} msg/s                    ║",
        msgs_per_sec_per_client
    );
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

/// Wait for the reply on `channel` and return it.
async fn reply(receiver: &mut Receiver, channel: &str) -> Result<Value, BoxError> {
    while let Some(frame) = receiver.next().await {
        if let Message::Text(text) = frame? {
            let batch: Vec<Value> = serde_json::from_str(&text)?;
            if let Some(found) = batch.into_iter().find(|m| m["channel"] == channel) {
                if found["successful"] != true {
                    return Err(format!("{channel} failed: {}", found["error"]).into());
                }
                return Ok(found);
            }
        }
    }
    Err("connection closed".into())
}

async fn run_client(message_count: Arc<AtomicU64>, barrier: Arc<Barrier>) -> Result<(), BoxError> {
    let (ws, _) = connect_async(SERVER_URL).await?;
    let (mut sender, mut receiver) = ws.split();

    let handshake = json!([{
        "id": "1",
        "channel": "/meta/handshake",
        "version": "1.0",
        "supportedConnectionTypes": ["websocket"]
    }]);
    sender.send(Message::Text(handshake.to_string())).await?;
    let handshook = reply(&mut receiver, "/meta/handshake").await?;
    let client_id = handshook["clientId"]
        .as_str()
        .ok_or("handshake reply without clientId")?
        .to_string();

    let setup = json!([
        {"id": "2", "channel": "/meta/connect", "clientId": client_id, "connectionType": "websocket"},
        {"id": "3", "channel": "/meta/subscribe", "clientId": client_id, "subscription": CHANNEL}
    ]);
    sender.send(Message::Text(setup.to_string())).await?;
    reply(&mut receiver, "/meta/subscribe").await?;

    barrier.wait().await;

    // Pre-encode the publish frame for efficiency
    let publish = json!([{
        "channel": CHANNEL,
        "clientId": client_id,
        "data": {"payload": "x".repeat(64)}
    }])
    .to_string();

    // Separate receiver task for full-duplex operation
    let recv_count = Arc::clone(&message_count);
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = receiver.next().await {
            if let Message::Text(text) = frame {
                if let Ok(batch) = serde_json::from_str::<Vec<Value>>(&text) {
                    let deliveries = batch
                        .iter()
                        .filter(|m| m["channel"] == CHANNEL && m.get("successful").is_none())
                        .count();
                    recv_count.fetch_add(deliveries as u64, Ordering::Relaxed);
                }
            }
        }
    });

    loop {
        if sender.send(Message::Text(publish.clone())).await.is_err() {
            break;
        }
        // Small yield to not starve the receiver task
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}

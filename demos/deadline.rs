//! Example: Polling under a deadline
//!
//! A poll cannot be cancelled once started. This example runs each poll on
//! a blocking thread and gives up waiting after a deadline, treating the
//! timeout as a failed poll.
//!
//! Run with: cargo run --example deadline

use gpu_telemetry::Collector;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

const DEADLINE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let collector = Arc::new(Mutex::new(Collector::open()?));

    for _ in 0..5 {
        let shared = Arc::clone(&collector);
        let poll = tokio::task::spawn_blocking(move || match shared.lock() {
            Ok(mut collector) => collector.collect(None).map_err(|e| e.to_string()),
            Err(_) => Err("collector poisoned".to_string()),
        });

        match timeout(DEADLINE, poll).await {
            Ok(Ok(Ok(collection))) => {
                println!(
                    "{}: {} device(s), {} available",
                    collection.query_time().format("%H:%M:%S"),
                    collection.len(),
                    collection.available().count()
                );
            }
            Ok(Ok(Err(e))) => eprintln!("poll failed: {}", e),
            Ok(Err(e)) => eprintln!("poll panicked: {}", e),
            Err(_) => eprintln!("poll timed out after {:?}", DEADLINE),
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    Ok(())
}

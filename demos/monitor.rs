//! Example: Real-time GPU monitoring
//!
//! This example shows how to continuously poll every NVIDIA GPU and display
//! a one-line summary per device in a terminal-friendly format.
//!
//! Run with: cargo run --example monitor
//!
//! Set `RUST_LOG=gpu_telemetry=debug` to see per-field query failures.

use gpu_telemetry::{Collector, DeviceSnapshot, Result};
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "?".to_string(), |v| v.to_string())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("GPU Telemetry Monitor");
    println!("=====================");
    println!();

    let mut collector = match Collector::open() {
        Ok(collector) => collector,
        Err(e) => {
            eprintln!("Error: {}", e);
            if e.is_initialization_failure() {
                eprintln!();
                eprintln!("Is the NVIDIA driver installed? Point GPU_TELEMETRY_LIBRARY");
                eprintln!("at libnvidia-ml.so.1 (or nvml.dll) if it lives elsewhere.");
            }
            return Err(e);
        }
    };

    loop {
        let collection = collector.collect(None)?;

        // Clear the screen and home the cursor
        print!("\x1B[2J\x1B[H");
        println!(
            "{}  {}  driver {}",
            collection.hostname(),
            collection.query_time().format("%a %b %d %H:%M:%S %Y"),
            collection.driver_version().unwrap_or("?")
        );

        for snapshot in collection.iter() {
            match snapshot {
                DeviceSnapshot::Available(gpu) => {
                    let m = &gpu.metrics;
                    println!(
                        "[{}] {:<24} | {:>3}C {:>3}% | {:>3}% | {:>4} / {:>4} W | {:>6} / {:>6} MB | {} proc",
                        gpu.index,
                        gpu.name,
                        opt(m.temperature),
                        opt(m.fan_speed),
                        opt(m.utilization),
                        opt(m.power_draw),
                        opt(m.power_limit),
                        opt(m.memory_used),
                        opt(m.memory_total),
                        gpu.processes.as_ref().map_or(0, Vec::len),
                    );
                }
                DeviceSnapshot::Unavailable(dev) => {
                    println!("[{}] {}", dev.index, dev.failure);
                }
            }
        }

        thread::sleep(Duration::from_secs(1));
    }
}

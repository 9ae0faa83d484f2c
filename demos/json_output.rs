//! Example: JSON output for integration
//!
//! This example shows how to serialize a poll to JSON for consumption by
//! other tools.
//!
//! Run with: cargo run --example json_output

use gpu_telemetry::Collector;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut collector = Collector::open()?;
    let collection = collector.collect(None)?;

    println!("{}", serde_json::to_string_pretty(&collection)?);
    Ok(())
}

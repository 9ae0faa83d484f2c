//! Example: List available NVIDIA GPUs
//!
//! This example shows how to enumerate all GPUs NVML can see and display
//! their identity and running processes.
//!
//! Run with: cargo run --example list_gpus
//! Restrict to some devices with: cargo run --example list_gpus -- 0,2

use gpu_telemetry::{Collector, DeviceFilter, DeviceSnapshot, Result};

fn main() -> Result<()> {
    println!("GPU Discovery");
    println!("=============");
    println!();

    println!("Platform supported: {}", gpu_telemetry::is_platform_supported());
    println!("GPU count:          {}", gpu_telemetry::gpu_count());
    println!();

    let filter = match std::env::args().nth(1) {
        Some(arg) => Some(arg.parse::<DeviceFilter>()?),
        None => None,
    };

    let mut collector = Collector::open()?;
    let collection = collector.collect(filter.as_ref())?;

    println!("Host:    {}", collection.hostname());
    println!("Backend: {}", collector.backend());
    println!(
        "Driver:  {}",
        collection.driver_version().unwrap_or("unknown")
    );
    for advisory in collection.advisories() {
        println!("Advisory: {}", advisory);
    }
    println!();

    for snapshot in collection.iter() {
        match snapshot {
            DeviceSnapshot::Available(gpu) => {
                println!("GPU #{}: {}", gpu.index, gpu.name);
                println!("  UUID:        {}", gpu.uuid);
                if let Some(total) = gpu.metrics.memory_total {
                    println!("  Memory:      {} MB", total);
                }
                if let Some(limit) = gpu.metrics.power_limit {
                    println!("  Power limit: {} W", limit);
                }
                if let Some(max) = gpu.metrics.clock_max {
                    println!("  Max clock:   {} MHz", max);
                }

                match &gpu.processes {
                    Some(processes) if !processes.is_empty() => {
                        println!("  Processes:");
                        for p in processes {
                            println!(
                                "    {:>7}  {:<12} {:>6} MB  {}",
                                p.pid,
                                p.username.as_deref().unwrap_or("?"),
                                p.gpu_memory_usage.map_or("?".to_string(), |m| m.to_string()),
                                p.command.as_deref().unwrap_or("?"),
                            );
                        }
                    }
                    Some(_) => println!("  Processes:   none"),
                    None => println!("  Processes:   not available"),
                }
            }
            DeviceSnapshot::Unavailable(dev) => {
                println!("GPU #{}: {}", dev.index, dev.failure);
                println!("  Error:       {}", dev.error);
            }
        }
        println!();
    }

    if !collection.diagnostics().is_empty() {
        println!("Query diagnostics:");
        println!("{}", collection.diagnostics());
    }

    Ok(())
}

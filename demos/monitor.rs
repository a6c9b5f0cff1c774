//! Environmental sensor monitoring example
//!
//! Run with: cargo run --example monitor
//!
//! To connect to a sensor whose name contains a given string:
//!   cargo run --example monitor -- --name EnvSensor

use envsense_ble::{
    ConnectionState, DeviceManager, Error, MeasurementChannel, Result, TemperatureUnit,
};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter("warn,envsense_ble=debug")
        .init();

    println!("Environmental Sensor Monitor");
    println!("============================\n");

    let args: Vec<String> = std::env::args().collect();
    let name_filter = args
        .iter()
        .position(|arg| arg == "--name")
        .and_then(|i| args.get(i + 1))
        .cloned();
    let unit = if args.iter().any(|arg| arg == "--fahrenheit") {
        TemperatureUnit::Fahrenheit
    } else {
        TemperatureUnit::Celsius
    };

    let manager = DeviceManager::new().await?;
    manager.start_scanning().await?;

    println!("Scanning...\n");
    tokio::time::sleep(Duration::from_secs(5)).await;

    let candidates = manager.devices_by_signal();
    for candidate in &candidates {
        println!("  {} at {} dBm", candidate.device, candidate.rssi);
    }

    let target = candidates
        .iter()
        .find(|c| match (&name_filter, c.device.name()) {
            (Some(filter), Some(name)) => name.contains(filter.as_str()),
            (None, _) => true,
            (Some(_), None) => false,
        })
        .ok_or_else(|| Error::DeviceNotFound {
            address: name_filter.clone().unwrap_or_else(|| "any".to_string()),
        })?;

    println!("\nConnecting to {}...", target.device);

    let _state_handle = manager.on_state_change(|state| match state {
        ConnectionState::Error(kind) => println!("Connection error: {}", kind),
        state => println!("State: {}", state),
    });
    let _reading_handle = manager.on_reading(move |reading| match reading.channel {
        MeasurementChannel::Temperature => println!(
            "  temperature: {:.1} {}",
            unit.convert_celsius(reading.value),
            unit.symbol()
        ),
        _ => println!("  {}", reading),
    });

    let mut status = manager.subscribe_status();
    tokio::spawn(async move {
        while let Ok(event) = status.recv().await {
            println!("Status: {}", event);
        }
    });

    manager.select_device(target.address()).await?;

    println!("Press Ctrl+C to exit.\n");
    tokio::signal::ctrl_c().await.ok();

    println!("\nExiting...");
    manager.shutdown().await?;

    Ok(())
}

//! Scan for BLE advertisements and print them as JSON messages.
//!
//! Run with: cargo run --example scan_beacons -- [service-uuids]
//!
//! The optional argument is a comma-separated service allow-list, e.g.
//! `180f,feaa`. Scanning is paused for five seconds halfway through to show
//! operator commands.

use ble_beacon_scan::{BtleplugAdapter, Notice, Result, ScanConfig, ScanNode};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_beacon_scan=debug".parse().unwrap()),
        )
        .init();

    let services = std::env::args().nth(1).unwrap_or_default();
    let config = ScanConfig::new()
        .with_duplicates(true)
        .with_service_uuid_list(&services)?;

    let adapter = Arc::new(BtleplugAdapter::new().await?);
    let node = ScanNode::new(adapter, config);

    let _messages = node.on_message(|message| {
        if let Some(frame) = message.as_discovery().and_then(|d| d.ibeacon.as_ref()) {
            println!(
                "iBeacon {} major={} minor={} ~{:.2}m ({})",
                frame.proximity_uuid_hex(),
                frame.major,
                frame.minor,
                frame.accuracy,
                frame.proximity
            );
        }
        println!("{}", message.to_json());
    });

    let mut notices = node.subscribe_notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            match notice {
                Notice::Started => println!("-- scanning started"),
                Notice::Stopped => println!("-- scanning stopped"),
                Notice::Warning(warning) => println!("-- warning: {}", warning),
            }
        }
    });

    node.launch().await?;

    println!("Scanning for 30 seconds...");
    println!("Press Ctrl+C to exit early.\n");

    tokio::select! {
        _ = async {
            tokio::time::sleep(Duration::from_secs(12)).await;
            let _ = node.send_message(json!({"payload": {"scan": false}}));
            tokio::time::sleep(Duration::from_secs(5)).await;
            let _ = node.send_message(json!({"payload": {"scan": true}}));
            tokio::time::sleep(Duration::from_secs(13)).await;
        } => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted!");
        }
    }

    node.shutdown().await?;
    println!("\nDone!");

    Ok(())
}

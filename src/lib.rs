// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-beacon-scan
//!
//! Bluetooth Low Energy scanning with iBeacon decoding and adapter-aware
//! scan control.
//!
//! A [`ScanNode`] owns one adapter. It starts scanning when the adapter is
//! powered on, stops when it goes away, and accepts operator commands in the
//! shape `{"payload": {"scan": true | false}}`. Every advertisement received
//! is published as a discovery message; advertisements carrying an iBeacon
//! frame also get its proximity UUID, major/minor, measured power and a
//! distance estimate.
//!
//! ## Features
//!
//! - **iBeacon decoding**: UUID, major, minor, measured power, accuracy and
//!   proximity class from manufacturer data
//! - **Scan control**: redundant start/stop requests are ignored, stale
//!   adapter acknowledgements are discarded
//! - **Adapter awareness**: scanning follows the adapter's power state
//! - **JSON messages**: discovery and status messages serialize to the
//!   documented JSON shapes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_beacon_scan::{BtleplugAdapter, Result, ScanConfig, ScanNode};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let adapter = Arc::new(BtleplugAdapter::new().await?);
//!     let node = ScanNode::new(adapter, ScanConfig::new().with_duplicates(true));
//!
//!     let _handle = node.on_message(|message| {
//!         println!("{}", message.to_json());
//!     });
//!
//!     node.launch().await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!     node.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.

// Public modules
pub mod ble;
pub mod config;
pub mod controller;
pub mod error;
pub mod message;
pub mod scan_node;
pub mod utils;

// Re-exports for convenience
pub use ble::adapter::{AdapterEvent, AdapterState, Advertisement, AdvertisementData, BleAdapter};
pub use ble::ibeacon::{estimate_accuracy, IBeaconFrame, Proximity};
pub use ble::platform::BtleplugAdapter;
pub use config::{ScanConfig, DEFAULT_STARTUP_GRACE};
pub use controller::{ScanState, Trigger};
pub use error::{Error, Result};
pub use message::{DiscoveryMessage, Notice, ScanCommand, ScanMessage, StatusMessage, Warning};
pub use scan_node::{CallbackHandle, ScanNode};

//! Adapter capability boundary.
//!
//! The scan controller only talks to the radio through [`BleAdapter`]. The
//! production implementation lives in [`crate::ble::platform`]; tests use the
//! generated `MockBleAdapter`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use serde::{Serialize, Serializer};
use std::pin::Pin;
use uuid::Uuid;

use crate::ble::ibeacon::IBeaconFrame;
use crate::error::Result;

/// Power state reported by the local Bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AdapterState {
    /// State not yet known.
    #[default]
    Unknown,
    /// The adapter is resetting.
    Resetting,
    /// The platform has no BLE support.
    Unsupported,
    /// The process is not allowed to use Bluetooth.
    Unauthorized,
    /// Bluetooth is switched off.
    PoweredOff,
    /// Bluetooth is on and ready to scan.
    PoweredOn,
}

impl AdapterState {
    /// Check if the adapter can scan.
    pub fn is_powered_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }

    /// Get the state name as reported in status messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Resetting => "resetting",
            Self::Unsupported => "unsupported",
            Self::Unauthorized => "unauthorized",
            Self::PoweredOff => "poweredOff",
            Self::PoweredOn => "poweredOn",
        }
    }
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a scan request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanOptions {
    /// Report every advertisement instead of only the first per device.
    pub allow_duplicates: bool,
    /// Only report devices advertising one of these services. Empty means all.
    pub service_uuids: Vec<Uuid>,
}

/// Raw advertisement fields, as broadcast by the peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertisementData {
    /// Advertised local name.
    pub local_name: Option<String>,
    /// Advertised transmit power in dBm.
    pub tx_power_level: Option<i16>,
    /// Manufacturer-specific data, company identifier first.
    #[serde(serialize_with = "serialize_hex")]
    pub manufacturer_data: Option<Bytes>,
    /// Advertised service UUIDs.
    pub service_uuids: Vec<Uuid>,
}

/// One received advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Advertisement {
    /// Platform identifier of the peripheral.
    pub peripheral_id: String,
    /// Signal strength in dBm.
    pub rssi: i16,
    /// Advertised fields.
    pub data: AdvertisementData,
}

impl Advertisement {
    /// Decode the manufacturer data as an iBeacon frame, if it holds one.
    pub fn ibeacon(&self) -> Option<IBeaconFrame> {
        self.data
            .manufacturer_data
            .as_deref()
            .and_then(|data| IBeaconFrame::decode(data, self.rssi))
    }
}

/// Event delivered by an adapter subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    /// A peripheral advertisement was received.
    Discovered(Advertisement),
    /// The adapter's power state changed.
    StateChanged(AdapterState),
}

/// Stream of adapter events. Dropping it ends the subscription.
pub type AdapterEventStream = Pin<Box<dyn Stream<Item = AdapterEvent> + Send>>;

/// Operations the scan controller needs from a Bluetooth adapter.
///
/// `start_scan` and `stop_scan` resolve once the adapter has acknowledged the
/// request.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Current power state.
    async fn state(&self) -> AdapterState;

    /// Begin scanning with the given options.
    async fn start_scan(&self, options: ScanOptions) -> Result<()>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<()>;

    /// Subscribe to discovery and state-change events.
    async fn events(&self) -> Result<AdapterEventStream>;
}

fn serialize_hex<S: Serializer>(data: &Option<Bytes>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match data {
        Some(bytes) => serializer.serialize_str(&hex::encode(bytes)),
        None => serializer.serialize_none(),
    }
}

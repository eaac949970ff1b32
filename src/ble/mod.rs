//! BLE module.
//!
//! This module provides the adapter boundary the scan controller talks to,
//! its btleplug implementation, and iBeacon decoding of advertisements.

pub mod adapter;
pub mod ibeacon;
pub mod platform;
pub mod uuids;

pub use adapter::{
    AdapterEvent, AdapterEventStream, AdapterState, Advertisement, AdvertisementData, BleAdapter,
    ScanOptions,
};
pub use ibeacon::{IBeaconFrame, Proximity};
pub use platform::BtleplugAdapter;
pub use uuids::*;

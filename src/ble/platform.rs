//! btleplug-backed adapter.
//!
//! Translates btleplug central events into [`AdapterEvent`]s for the scan
//! controller.

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::ble::adapter::{
    AdapterEvent, AdapterEventStream, AdapterState, Advertisement, AdvertisementData, BleAdapter,
    ScanOptions,
};
use crate::ble::uuids::APPLE_COMPANY_ID;
use crate::error::{Error, Result};

impl From<CentralState> for AdapterState {
    fn from(state: CentralState) -> Self {
        match state {
            CentralState::PoweredOn => Self::PoweredOn,
            CentralState::PoweredOff => Self::PoweredOff,
            _ => Self::Unknown,
        }
    }
}

/// [`BleAdapter`] over the platform Bluetooth stack.
pub struct BtleplugAdapter {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    /// Whether repeated advertisements of a known device are forwarded.
    allow_duplicates: Arc<RwLock<bool>>,
}

impl BtleplugAdapter {
    /// Open the first Bluetooth adapter on this system.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Wrap a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            allow_duplicates: Arc::new(RwLock::new(false)),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn translate(
        event: CentralEvent,
        adapter: &Adapter,
        allow_duplicates: bool,
    ) -> Option<AdapterEvent> {
        match event {
            CentralEvent::StateUpdate(state) => {
                debug!("Adapter state update: {:?}", state);
                Some(AdapterEvent::StateChanged(state.into()))
            }
            CentralEvent::DeviceDiscovered(id) => {
                trace!("Device discovered: {:?}", id);
                Self::advertisement(adapter, id).await
            }
            CentralEvent::DeviceUpdated(id) if allow_duplicates => {
                trace!("Device updated: {:?}", id);
                Self::advertisement(adapter, id).await
            }
            _ => None,
        }
    }

    async fn advertisement(adapter: &Adapter, id: PeripheralId) -> Option<AdapterEvent> {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return None,
        };

        let Some(rssi) = properties.rssi else {
            trace!("Skipping {:?}: no RSSI sample", id);
            return None;
        };

        Some(AdapterEvent::Discovered(Advertisement {
            peripheral_id: id.to_string(),
            rssi,
            data: AdvertisementData {
                local_name: properties.local_name,
                tx_power_level: properties.tx_power_level,
                manufacturer_data: on_air_manufacturer_data(&properties.manufacturer_data),
                service_uuids: properties.services,
            },
        }))
    }
}

/// Rebuild manufacturer data as broadcast: company identifier (little-endian)
/// followed by the payload. Apple's entry wins when several are present.
fn on_air_manufacturer_data(entries: &HashMap<u16, Vec<u8>>) -> Option<Bytes> {
    let (company_id, payload) = entries
        .get_key_value(&APPLE_COMPANY_ID)
        .or_else(|| entries.iter().min_by_key(|(id, _)| **id))?;

    let mut data = BytesMut::with_capacity(payload.len() + 2);
    data.put_u16_le(*company_id);
    data.put_slice(payload);
    Some(data.freeze())
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn state(&self) -> AdapterState {
        self.adapter
            .adapter_state()
            .await
            .map(AdapterState::from)
            .unwrap_or_default()
    }

    async fn start_scan(&self, options: ScanOptions) -> Result<()> {
        *self.allow_duplicates.write() = options.allow_duplicates;

        self.adapter
            .start_scan(ScanFilter {
                services: options.service_uuids,
            })
            .await
            .map_err(Error::Bluetooth)
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await.map_err(Error::Bluetooth)
    }

    async fn events(&self) -> Result<AdapterEventStream> {
        let events = self.adapter.events().await.map_err(Error::Bluetooth)?;
        let adapter = self.adapter.clone();
        let allow_duplicates = self.allow_duplicates.clone();

        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let allow_duplicates = *allow_duplicates.read();
            async move { Self::translate(event, &adapter, allow_duplicates).await }
        });

        Ok(Box::pin(stream))
    }
}

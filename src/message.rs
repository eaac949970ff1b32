//! Messages exchanged with the flow: operator commands in, discovery and
//! status messages out, plus notices for the operator.

use serde::Serialize;
use serde_json::Value;

use crate::ble::adapter::{AdapterState, Advertisement, AdvertisementData};
use crate::ble::ibeacon::IBeaconFrame;

/// Operator command accepted on the input side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanCommand {
    /// Start scanning.
    Start,
    /// Stop scanning.
    Stop,
}

impl ScanCommand {
    /// Parse `{ "payload": { "scan": true | false } }`.
    ///
    /// Any other shape yields `None`.
    pub fn from_message(message: &Value) -> Option<Self> {
        let scan = message.get("payload")?.as_object()?.get("scan")?.as_bool()?;
        Some(if scan { Self::Start } else { Self::Stop })
    }
}

/// Output message for one received advertisement.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryMessage {
    /// Platform identifier of the peripheral.
    pub peripheral_uuid: String,
    /// Advertised local name.
    pub local_name: Option<String>,
    /// Reception time, milliseconds since the Unix epoch.
    pub detected_at: i64,
    /// Identifier of the host that received the advertisement.
    pub detected_by: String,
    /// Raw advertisement fields.
    pub advertisement: AdvertisementData,
    /// Signal strength in dBm.
    pub rssi: i16,
    /// iBeacon fields, present only when the manufacturer data decodes.
    #[serde(flatten)]
    pub ibeacon: Option<IBeaconFrame>,
}

impl DiscoveryMessage {
    /// Build a discovery message, decoding iBeacon data if present.
    pub fn new(advertisement: Advertisement, detected_by: &str, detected_at: i64) -> Self {
        let ibeacon = advertisement.ibeacon();
        Self {
            peripheral_uuid: advertisement.peripheral_id,
            local_name: advertisement.data.local_name.clone(),
            detected_at,
            detected_by: detected_by.to_string(),
            rssi: advertisement.rssi,
            advertisement: advertisement.data,
            ibeacon,
        }
    }
}

/// Output message describing a scan state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    /// Always `true`; marks the message as a status update.
    pub status_update: bool,
    /// The transition was caused by, or ended in, a failure.
    pub error: bool,
    /// The transition was driven by an adapter state change.
    pub state_change: bool,
    /// Adapter state at the time of the transition.
    pub state: AdapterState,
}

impl StatusMessage {
    /// Create a status message.
    pub fn new(error: bool, state_change: bool, state: AdapterState) -> Self {
        Self {
            status_update: true,
            error,
            state_change,
            state,
        }
    }
}

/// Anything sent to the output side.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScanMessage {
    /// An advertisement was received.
    Discovery(DiscoveryMessage),
    /// Scanning is about to change state, or could not.
    Status(StatusMessage),
}

impl ScanMessage {
    /// Get the status message, if this is one.
    pub fn as_status(&self) -> Option<&StatusMessage> {
        match self {
            Self::Status(status) => Some(status),
            Self::Discovery(_) => None,
        }
    }

    /// Get the discovery message, if this is one.
    pub fn as_discovery(&self) -> Option<&DiscoveryMessage> {
        match self {
            Self::Discovery(discovery) => Some(discovery),
            Self::Status(_) => None,
        }
    }

    /// Serialize to a JSON value.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Operator-facing warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// Scanning could not start because the adapter is not powered on.
    AdapterUnavailable {
        /// Adapter state at the time.
        state: AdapterState,
    },
    /// Scanning was stopped because the adapter left the powered-on state.
    StoppedByStateChange,
    /// An input message had an unrecognized shape.
    InvalidCommand,
    /// The adapter rejected a start request.
    StartFailed {
        /// Adapter error text.
        reason: String,
    },
    /// The adapter rejected a stop request.
    StopFailed {
        /// Adapter error text.
        reason: String,
    },
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdapterUnavailable { state } => {
                write!(f, "Unable to start BLE scan. Adapter state: {}", state)
            }
            Self::StoppedByStateChange => {
                write!(f, "BLE scanning stopped due to change in adapter state.")
            }
            Self::InvalidCommand => write!(f, "Incorrect input, ignoring."),
            Self::StartFailed { reason } => write!(f, "BLE scan failed to start: {}", reason),
            Self::StopFailed { reason } => write!(f, "BLE scan failed to stop: {}", reason),
        }
    }
}

/// Status indicators and warnings for the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The adapter acknowledged the start request.
    Started,
    /// The adapter acknowledged the stop request.
    Stopped,
    /// Something needs the operator's attention.
    Warning(Warning),
}

//! iBeacon manufacturer-data decoding.
//!
//! An iBeacon advertisement carries its payload in the manufacturer-specific
//! data field, laid out as received on air:
//!
//! | Offset | Size | Field                                  |
//! |--------|------|----------------------------------------|
//! | 0      | 2    | Company identifier (little-endian)     |
//! | 2      | 1    | Frame type (`0x02`)                    |
//! | 3      | 1    | Body length (`0x15`)                   |
//! | 4      | 16   | Proximity UUID                         |
//! | 20     | 2    | Major (big-endian)                     |
//! | 22     | 2    | Minor (big-endian)                     |
//! | 24     | 1    | Measured power at 1 m (signed, dBm)    |
//!
//! Only the length is checked; any buffer of at least 25 bytes is read with
//! this layout.

use serde::{Serialize, Serializer};
use uuid::Uuid;

/// Minimum manufacturer-data length that can hold an iBeacon frame.
pub const IBEACON_MIN_LEN: usize = 25;

/// Accuracy reported when no estimate can be made.
pub const UNKNOWN_ACCURACY: f64 = -1.0;

/// Coarse distance classification derived from the accuracy estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Proximity {
    /// No usable estimate.
    #[default]
    Unknown,
    /// Closer than half a meter.
    Immediate,
    /// Within four meters.
    Near,
    /// Four meters or more.
    Far,
}

impl Proximity {
    /// Classify an accuracy estimate in meters.
    pub fn from_accuracy(accuracy: f64) -> Self {
        if accuracy < 0.0 {
            Self::Unknown
        } else if accuracy < 0.5 {
            Self::Immediate
        } else if accuracy < 4.0 {
            Self::Near
        } else {
            Self::Far
        }
    }

    /// Get the classification as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Immediate => "immediate",
            Self::Near => "near",
            Self::Far => "far",
        }
    }
}

impl std::fmt::Display for Proximity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Estimate the distance to a beacon in meters.
///
/// `12.0 * (rssi / measured_power - 1) ^ 1.5`
///
/// Returns [`UNKNOWN_ACCURACY`] when either value is zero. A signal stronger
/// than the calibration constant clamps to zero.
pub fn estimate_accuracy(rssi: i16, measured_power: i8) -> f64 {
    if rssi == 0 || measured_power == 0 {
        return UNKNOWN_ACCURACY;
    }

    let ratio = f64::from(rssi) / f64::from(measured_power);
    12.0 * (ratio - 1.0).max(0.0).powf(1.5)
}

/// A decoded iBeacon frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IBeaconFrame {
    /// Proximity UUID identifying the beacon deployment.
    #[serde(rename = "manufacturerUuid", serialize_with = "serialize_simple_uuid")]
    pub proximity_uuid: Uuid,
    /// Major identifier.
    pub major: u16,
    /// Minor identifier.
    pub minor: u16,
    /// Calibrated signal strength at one meter, in dBm.
    pub measured_power: i8,
    /// Estimated distance in meters, negative when unknown.
    pub accuracy: f64,
    /// Distance classification.
    pub proximity: Proximity,
}

impl IBeaconFrame {
    /// Decode an iBeacon frame from manufacturer data.
    ///
    /// # Arguments
    ///
    /// * `data` - Manufacturer data including the company identifier
    /// * `rssi` - Signal strength the advertisement was received at
    ///
    /// # Returns
    ///
    /// `None` if the buffer is too short to hold a frame.
    pub fn decode(data: &[u8], rssi: i16) -> Option<Self> {
        if data.len() < IBEACON_MIN_LEN {
            return None;
        }

        let proximity_uuid = Uuid::from_slice(&data[4..20]).ok()?;
        let major = u16::from_be_bytes([data[20], data[21]]);
        let minor = u16::from_be_bytes([data[22], data[23]]);
        let measured_power = data[24] as i8;

        let accuracy = estimate_accuracy(rssi, measured_power);

        Some(Self {
            proximity_uuid,
            major,
            minor,
            measured_power,
            accuracy,
            proximity: Proximity::from_accuracy(accuracy),
        })
    }

    /// The proximity UUID as 32 lowercase hex characters.
    pub fn proximity_uuid_hex(&self) -> String {
        self.proximity_uuid.simple().to_string()
    }
}

fn serialize_simple_uuid<S: Serializer>(uuid: &Uuid, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&uuid.simple())
}

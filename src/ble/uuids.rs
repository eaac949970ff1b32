//! Bluetooth identifiers and service UUID parsing.
//!
//! Service allow-lists may use the 16-bit and 32-bit short forms assigned by
//! the Bluetooth SIG (`180a`, `0000180a`) as well as full 128-bit UUIDs, with
//! or without hyphens.

use uuid::Uuid;

use crate::error::{Error, Result};

/// Apple's Bluetooth company identifier, used by iBeacon frames.
pub const APPLE_COMPANY_ID: u16 = 0x004C;

/// Bluetooth Base UUID that short UUIDs expand into.
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0000_1000_8000_00805f9b34fb);

/// Expand a 16-bit assigned number into a full UUID.
pub fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// Expand a 32-bit assigned number into a full UUID.
pub fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((short as u128) << 96))
}

/// Parse one service UUID in short or full form.
///
/// # Errors
///
/// Returns [`Error::InvalidParameter`] if the value is not a valid UUID.
pub fn parse_service_uuid(value: &str) -> Result<Uuid> {
    let trimmed = value.trim();
    let invalid = || Error::InvalidParameter {
        name: "service_uuid".to_string(),
        value: value.to_string(),
    };

    match trimmed.len() {
        4 => u16::from_str_radix(trimmed, 16)
            .map(uuid_from_u16)
            .map_err(|_| invalid()),
        8 => u32::from_str_radix(trimmed, 16)
            .map(uuid_from_u32)
            .map_err(|_| invalid()),
        _ => Uuid::parse_str(trimmed).map_err(|_| invalid()),
    }
}

/// Parse a comma-separated service allow-list, keeping its order.
///
/// Blank entries are skipped, so an empty string yields an empty list
/// (scan for all services).
pub fn parse_service_uuid_list(list: &str) -> Result<Vec<Uuid>> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_service_uuid)
        .collect()
}

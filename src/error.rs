//! Error types for the ble-beacon-scan crate.

use thiserror::Error;

/// The main error type for this crate.
///
/// Scan failures reported to subscribers (adapter powered off, scan stopped
/// by a state change, malformed commands) are surfaced as status messages and
/// warnings, not as errors. This type covers failures of the API calls
/// themselves.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// An invalid parameter was provided.
    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// The scan node is not running (never launched, or already shut down).
    #[error("Scan node is not running")]
    NotRunning,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

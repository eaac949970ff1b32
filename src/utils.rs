//! Utility functions for the ble-beacon-scan crate.

/// Current wall-clock time as milliseconds since the Unix epoch.
#[inline]
pub fn epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Name of this host, used as the `detectedBy` field of discovery messages.
///
/// Falls back to `"localhost"` when the system reports no name.
pub fn default_host_identifier() -> String {
    let name = gethostname::gethostname();
    let name = name.to_string_lossy();
    let name = name.trim();
    if name.is_empty() {
        "localhost".to_string()
    } else {
        name.to_string()
    }
}

//! Scan configuration.

use std::time::Duration;
use uuid::Uuid;

use crate::ble::adapter::ScanOptions;
use crate::ble::uuids::parse_service_uuid_list;
use crate::error::Result;
use crate::utils::default_host_identifier;

/// How long to wait for a late adapter-ready signal before reporting that
/// scanning could not start.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(3000);

/// Configuration of a scan node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// Report every advertisement instead of only the first per device.
    pub allow_duplicates: bool,
    /// Service allow-list, in the order given. Empty scans for all services.
    pub service_uuids: Vec<Uuid>,
    /// Delay before reporting an adapter that was not ready at startup.
    pub startup_grace: Duration,
    /// Value of the `detectedBy` field of discovery messages.
    pub detected_by: String,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            allow_duplicates: false,
            service_uuids: Vec::new(),
            startup_grace: DEFAULT_STARTUP_GRACE,
            detected_by: default_host_identifier(),
        }
    }
}

impl ScanConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether duplicate advertisements are reported.
    pub fn with_duplicates(mut self, allow_duplicates: bool) -> Self {
        self.allow_duplicates = allow_duplicates;
        self
    }

    /// Set the service allow-list.
    pub fn with_service_uuids(mut self, service_uuids: Vec<Uuid>) -> Self {
        self.service_uuids = service_uuids;
        self
    }

    /// Set the service allow-list from a comma-separated string such as
    /// `"180f,180a"`.
    ///
    /// # Errors
    ///
    /// Returns an error if any entry is not a valid UUID.
    pub fn with_service_uuid_list(mut self, list: &str) -> Result<Self> {
        self.service_uuids = parse_service_uuid_list(list)?;
        Ok(self)
    }

    /// Set the startup grace period.
    pub fn with_startup_grace(mut self, startup_grace: Duration) -> Self {
        self.startup_grace = startup_grace;
        self
    }

    /// Set the host identifier reported in discovery messages.
    pub fn with_detected_by(mut self, detected_by: impl Into<String>) -> Self {
        self.detected_by = detected_by.into();
        self
    }

    /// Options passed to the adapter when scanning starts.
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            allow_duplicates: self.allow_duplicates,
            service_uuids: self.service_uuids.clone(),
        }
    }
}

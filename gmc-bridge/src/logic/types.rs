use chrono::{DateTime, Utc};
use std::fmt;

/// Device presence as published on `base/device_id/status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Online,  // Report accepted within the offline threshold
    Offline, // Marked stale by the sweep
}

impl DeviceStatus {
    /// Retained MQTT payload for this status
    pub fn payload(self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.payload())
    }
}

/// Device ↔ last_seen record kept by the presence tracker
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub id: String,
    pub last_seen: DateTime<Utc>,
    pub online: bool,
}

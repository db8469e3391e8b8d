//! Utility functions for building per-device MQTT topics
//!
//! Topics are laid out as `base/device_id/suffix`. Construction never rejects
//! anything: the device id comes straight from the request, so callers must
//! run the joined topic through `validation::is_valid_topic` before publishing.

/// Retained presence topic suffix (`online` / `offline`)
pub const STATUS_SUFFIX: &str = "status";

/// Timestamp topic suffix, published once per accepted report
pub const LAST_UPDATE_SUFFIX: &str = "last_update";

/// Device id used when a report carries no usable `GID`
pub const UNKNOWN_DEVICE: &str = "unknown";

/// Join base topic, device id and suffix into `base/device_id/suffix`.
pub fn build_topic(base: &str, device_id: &str, suffix: &str) -> String {
    format!("{}/{}/{}", base, device_id, suffix)
}

pub fn status_topic(base: &str, device_id: &str) -> String {
    build_topic(base, device_id, STATUS_SUFFIX)
}

pub fn last_update_topic(base: &str, device_id: &str) -> String {
    build_topic(base, device_id, LAST_UPDATE_SUFFIX)
}

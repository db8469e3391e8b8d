use crate::logic::serve::publisher::Publisher;
use crate::logic::topic::status_topic;
use crate::logic::types::{DeviceState, DeviceStatus};
use crate::logic::validation::is_valid_topic;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// `None` until the first accepted report has been recorded
type DeviceSlot = Arc<AsyncMutex<Option<DeviceState>>>;
type SlotGuard = OwnedMutexGuard<Option<DeviceState>>;

/// Online/offline bookkeeping for every device that has reported since startup.
///
/// The outer map lock is only held to find or insert a device's slot; the
/// per-device lock is held across the state change and its status publish, so
/// transitions for one device are totally ordered while other devices proceed.
/// A status publish runs on its own task that owns the device lock, so a
/// caller that gives up mid-publish cannot leave a transition unannounced.
pub struct PresenceTracker {
    devices: Mutex<HashMap<String, DeviceSlot>>,
    publisher: Arc<dyn Publisher>,
    base_topic: String,
    offline_threshold: Duration,
}

impl PresenceTracker {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        base_topic: impl Into<String>,
        offline_threshold: Duration,
    ) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            publisher,
            base_topic: base_topic.into(),
            offline_threshold,
        }
    }

    /// Record a report from `device_id`; returns true if the device went online.
    pub async fn touch(&self, device_id: &str) -> bool {
        self.touch_at(device_id, Utc::now()).await
    }

    pub async fn touch_at(&self, device_id: &str, now: DateTime<Utc>) -> bool {
        let mut guard = self.slot(device_id).lock_owned().await;

        if let Some(state) = guard.as_mut() {
            state.last_seen = now;
            if state.online {
                return false;
            }
            state.online = true;
            info!(device = device_id, "device {} came back online", device_id);
        } else {
            *guard = Some(DeviceState {
                id: device_id.to_string(),
                last_seen: now,
                online: true,
            });
            info!(device = device_id, "device {} marked as online", device_id);
        }
        self.publish_status(guard, device_id, DeviceStatus::Online).await;
        true
    }

    /// Mark every online device not heard from within the threshold as offline.
    ///
    /// Returns how many devices went offline during this pass.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut marked = 0;
        for slot in self.slots() {
            let mut guard = slot.lock_owned().await;
            let Some(state) = guard.as_mut() else {
                continue;
            };
            if !state.online || !self.is_stale(state.last_seen, now) {
                continue;
            }

            state.online = false;
            let device_id = state.id.clone();
            warn!(
                device = %device_id,
                "device {} marked as offline (last seen: {})",
                device_id,
                state.last_seen.to_rfc3339_opts(SecondsFormat::Secs, true)
            );
            self.publish_status(guard, &device_id, DeviceStatus::Offline).await;
            marked += 1;
        }
        marked
    }

    /// Point-in-time copy of all materialized device states
    pub async fn snapshot(&self) -> Vec<DeviceState> {
        let mut states = Vec::new();
        for slot in self.slots() {
            if let Some(state) = slot.lock().await.clone() {
                states.push(state);
            }
        }
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    fn is_stale(&self, last_seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        // negative elapsed time (clock went backwards) never counts as stale
        now.signed_duration_since(last_seen)
            .to_std()
            .map(|elapsed| elapsed > self.offline_threshold)
            .unwrap_or(false)
    }

    fn slot(&self, device_id: &str) -> DeviceSlot {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        devices
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone()
    }

    fn slots(&self) -> Vec<DeviceSlot> {
        let devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        devices.values().cloned().collect()
    }

    /// Publish a retained status while still holding the device's lock.
    ///
    /// Failures are logged and never undo the transition.
    async fn publish_status(&self, guard: SlotGuard, device_id: &str, status: DeviceStatus) {
        let topic = status_topic(&self.base_topic, device_id);
        if !is_valid_topic(&topic) {
            warn!(security = true, topic = %topic, "Invalid status topic for device {}", device_id);
            return;
        }

        let publisher = self.publisher.clone();
        let device_id = device_id.to_string();
        let task = tokio::spawn(async move {
            let _guard = guard;
            match publisher.publish(&topic, status.payload(), true).await {
                Ok(()) => debug!(topic = %topic, "published status {}", status),
                Err(e) => error!(
                    "failed to publish {} status for device {}: {}",
                    status, device_id, e
                ),
            }
        });
        if let Err(e) = task.await {
            error!(error = %e, "status publish task failed");
        }
    }
}

/// Run the presence sweep every `interval` until shutdown is signalled.
///
/// A sweep that has started always runs to completion before the signal is
/// looked at again.
pub async fn run_sweeper(
    tracker: Arc<PresenceTracker>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // the first tick fires immediately, nothing can be stale yet
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let marked = tracker.sweep().await;
                debug!(marked, "presence sweep finished");
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("presence sweeper stopping");
                    break;
                }
            }
        }
    }
}

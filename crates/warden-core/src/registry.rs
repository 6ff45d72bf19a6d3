//! Pending add/remove requests and the set of active devices.
//!
//! Both structures are guarded by a plain `std::sync::Mutex`: critical
//! sections are a push, a swap, or a map lookup, and no lock is ever held
//! across an `.await`.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{Device, DeviceId};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Pending requests
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PendingRequests {
    add: Vec<Device>,
    remove: Vec<Device>,
}

/// Requests drained in one reconciliation tick, in submission order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PendingBatch {
    pub to_add: Vec<Device>,
    pub to_remove: Vec<Device>,
}

impl PendingBatch {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Holding area for add/remove requests submitted by the host.
///
/// Requests are neither validated nor deduplicated here; the manager loop
/// applies the dedup policy when it drains a batch.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    pending: Mutex<PendingRequests>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a device for activation.
    pub fn add(&self, device: Device) {
        lock(&self.pending).add.push(device);
    }

    /// Queue a device for deactivation.
    pub fn remove(&self, device: Device) {
        lock(&self.pending).remove.push(device);
    }

    /// Swap both queues with empty ones and return what they held.
    ///
    /// Every request is returned by exactly one call.
    pub fn drain_pending(&self) -> PendingBatch {
        let mut pending = lock(&self.pending);
        PendingBatch {
            to_add: mem::take(&mut pending.add),
            to_remove: mem::take(&mut pending.remove),
        }
    }

    /// Number of queued `(add, remove)` requests.
    pub fn pending_len(&self) -> (usize, usize) {
        let pending = lock(&self.pending);
        (pending.add.len(), pending.remove.len())
    }
}

// ---------------------------------------------------------------------------
// Active device set
// ---------------------------------------------------------------------------

/// The devices that should currently be running.
///
/// Cheap to clone; every clone shares the same set. Workers poll
/// [`ActiveDevices::contains`] to decide whether to keep going.
#[derive(Debug, Clone, Default)]
pub struct ActiveDevices {
    devices: Arc<Mutex<HashMap<DeviceId, Device>>>,
}

impl ActiveDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a device active. Returns `false` if it already was; the stored
    /// device is replaced either way.
    pub fn insert(&self, device: Device) -> bool {
        lock(&self.devices)
            .insert(device.udid.clone(), device)
            .is_none()
    }

    /// Withdraw a device. Returns `true` if it was active.
    pub fn remove(&self, udid: &DeviceId) -> bool {
        lock(&self.devices).remove(udid).is_some()
    }

    pub fn contains(&self, udid: &DeviceId) -> bool {
        lock(&self.devices).contains_key(udid)
    }

    pub fn len(&self) -> usize {
        lock(&self.devices).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.devices).is_empty()
    }

    /// Active devices sorted by identifier.
    pub fn snapshot(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = lock(&self.devices).values().cloned().collect();
        devices.sort_by(|a, b| a.udid.cmp(&b.udid));
        devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn device(udid: &str) -> Device {
        Device::new(udid.parse().unwrap(), udid)
    }

    #[test]
    fn drain_returns_requests_in_order_and_empties_queues() {
        let registry = DeviceRegistry::new();
        registry.add(device("a"));
        registry.add(device("b"));
        registry.remove(device("c"));
        assert_eq!(registry.pending_len(), (2, 1));

        let batch = registry.drain_pending();
        assert_eq!(batch.to_add, vec![device("a"), device("b")]);
        assert_eq!(batch.to_remove, vec![device("c")]);
        assert_eq!(registry.pending_len(), (0, 0));
        assert!(registry.drain_pending().is_empty());
    }

    #[test]
    fn add_does_not_deduplicate() {
        let registry = DeviceRegistry::new();
        registry.add(device("a"));
        registry.add(device("a"));
        assert_eq!(registry.drain_pending().to_add.len(), 2);
    }

    #[test]
    fn concurrent_adds_are_never_lost_or_duplicated() {
        let registry = Arc::new(DeviceRegistry::new());
        let writers: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..250 {
                        registry.add(device(&format!("dev-{t}-{i}")));
                    }
                })
            })
            .collect();

        let mut drained = Vec::new();
        while writers.iter().any(|w| !w.is_finished()) {
            drained.extend(registry.drain_pending().to_add);
        }
        for writer in writers {
            writer.join().unwrap();
        }
        drained.extend(registry.drain_pending().to_add);

        assert_eq!(drained.len(), 2000);
        let unique: std::collections::HashSet<_> = drained.into_iter().collect();
        assert_eq!(unique.len(), 2000);
    }

    #[test]
    fn active_set_membership_is_by_identifier() {
        let active = ActiveDevices::new();
        assert!(active.insert(device("a")));
        assert!(!active.insert(Device::new("a".parse().unwrap(), "renamed")));
        assert_eq!(active.len(), 1);
        assert_eq!(active.snapshot()[0].name, "renamed");

        let shared = active.clone();
        assert!(shared.contains(&"a".parse().unwrap()));
        assert!(shared.remove(&"a".parse().unwrap()));
        assert!(!active.remove(&"a".parse().unwrap()));
        assert!(active.is_empty());
    }

    #[test]
    fn snapshot_is_sorted() {
        let active = ActiveDevices::new();
        for udid in ["c", "a", "b"] {
            active.insert(device(udid));
        }
        let ids: Vec<String> = active.snapshot().iter().map(|d| d.udid.to_string()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}

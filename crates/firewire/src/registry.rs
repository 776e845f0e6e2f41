//! Device registry
//!
//! Tracks every device the bus monitor has matched, keyed by GUID. Records
//! are created on first attach, refreshed on later notifications for the
//! same GUID, and deliberately never evicted: a detach is logged by the
//! power-message path and the record stays so a transient disconnect mid
//! recording does not forget the device. The registry has the lifetime of
//! its monitor instance, which bounds growth.
//!
//! The native handle never leaves the registry; callers operate on it
//! through closures under the registry lock.

use crate::bus::AvcHandle;
use protocol::{CapabilitySet, DeviceDescriptor, Guid};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Shared, insertion-ordered device registry
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

struct RegistryInner {
    records: HashMap<Guid, DeviceRecord>,
    /// GUIDs in first-seen order, for stable list output
    order: Vec<Guid>,
}

struct DeviceRecord {
    capabilities: CapabilitySet,
    handle: Box<dyn AvcHandle>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry {
            inner: Arc::new(Mutex::new(RegistryInner {
                records: HashMap::new(),
                order: Vec::new(),
            })),
        }
    }

    /// Insert or refresh the record for `guid`
    ///
    /// Capabilities are always re-read from the fresh handle. The stored
    /// handle is only replaced while it is not open, so an open session
    /// keeps its handle across re-announcements.
    pub fn upsert(&self, guid: Guid, handle: Box<dyn AvcHandle>) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");

        let capabilities = handle.capabilities();
        match inner.records.get_mut(&guid) {
            Some(record) => {
                debug!("Updating device {}", guid);
                record.capabilities = capabilities;
                if !record.handle.is_open() {
                    record.handle = handle;
                }
            }
            None => {
                info!("Adding device {}", guid);
                inner.records.insert(
                    guid,
                    DeviceRecord {
                        capabilities,
                        handle,
                    },
                );
                inner.order.push(guid);
            }
        }
    }

    /// Whether a record exists for `guid`
    pub fn contains(&self, guid: Guid) -> bool {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.records.contains_key(&guid)
    }

    /// Capability set recorded for `guid`
    pub fn capabilities(&self, guid: Guid) -> Option<CapabilitySet> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.records.get(&guid).map(|r| r.capabilities)
    }

    /// All devices whose capabilities cover `required`, in first-seen order
    pub fn list_matching(&self, required: CapabilitySet) -> Vec<DeviceDescriptor> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .order
            .iter()
            .filter_map(|guid| inner.records.get(guid).map(|r| (guid, r)))
            .filter(|(_, r)| r.capabilities.is_superset_of(required))
            .map(|(guid, r)| DeviceDescriptor {
                guid: *guid,
                capabilities: r.capabilities,
            })
            .collect()
    }

    /// Run `f` against the device's handle, if a record exists
    pub fn with_handle<R>(&self, guid: Guid, f: impl FnOnce(&dyn AvcHandle) -> R) -> Option<R> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.records.get(&guid).map(|r| f(r.handle.as_ref()))
    }

    /// Run `f` against the device's handle with mutable access
    pub fn with_handle_mut<R>(
        &self,
        guid: Guid,
        f: impl FnOnce(&mut dyn AvcHandle) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.records.get_mut(&guid).map(|r| f(r.handle.as_mut()))
    }

    /// Number of known devices
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.records.len()
    }

    /// True when no device has been seen yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

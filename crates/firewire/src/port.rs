//! Port controller
//!
//! Opens and closes the logical connection to one device. Concurrent
//! callers share a single native open: the handle is opened on the 0 to 1
//! reference transition and closed on the 1 to 0 transition, and a close
//! on an already-closed port is rejected rather than clamped.
//!
//! Opening also brings up the bus monitor when it is not already running;
//! a hard failure later in the open sequence rolls that back so a failed
//! open leaves no state behind.

use crate::bus::BusError;
use crate::monitor::{BusMonitor, MonitorError};
use crate::plug::LinkState;
use crate::registry::DeviceRegistry;
use protocol::{CapabilitySet, Guid, NodeId};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};

/// Port open failures
#[derive(Debug, Error)]
pub enum PortError {
    /// The bus monitor could not be brought up
    #[error(transparent)]
    Monitor(#[from] MonitorError),

    /// No registry record for the device
    #[error("Device {0} has not been discovered")]
    DeviceNotFound(Guid),

    /// The device lacks a required subunit
    #[error("Device {guid} does not provide the required subunits")]
    MissingCapability { guid: Guid },

    /// The native open call failed
    #[error(transparent)]
    Open(#[from] BusError),
}

struct PortState {
    ref_count: u32,
}

/// Reference-counted open/close for one device
pub struct PortController {
    registry: DeviceRegistry,
    monitor: Arc<BusMonitor>,
    link: Arc<Mutex<LinkState>>,
    guid: Guid,
    required: CapabilitySet,
    state: Mutex<PortState>,
}

impl PortController {
    pub fn new(
        registry: DeviceRegistry,
        monitor: Arc<BusMonitor>,
        link: Arc<Mutex<LinkState>>,
        guid: Guid,
        required: CapabilitySet,
    ) -> Self {
        PortController {
            registry,
            monitor,
            link,
            guid,
            required,
            state: Mutex::new(PortState { ref_count: 0 }),
        }
    }

    /// Open the port, sharing an existing open when one is outstanding
    pub fn open(&self) -> Result<(), PortError> {
        let mut state = self.state.lock().expect("port state lock poisoned");
        if state.ref_count > 0 {
            state.ref_count += 1;
            info!("Port already open ({} refs)", state.ref_count);
            return Ok(());
        }

        let started_monitor = !self.monitor.is_running();
        if started_monitor {
            self.monitor.start()?;
        }

        match self.open_device() {
            Ok(()) => {
                state.ref_count = 1;
                info!("Port opened for device {}", self.guid);
                Ok(())
            }
            Err(e) => {
                if started_monitor && let Err(stop_err) = self.monitor.stop() {
                    warn!("Failed to stop monitor after open failure: {}", stop_err);
                }
                Err(e)
            }
        }
    }

    fn open_device(&self) -> Result<(), PortError> {
        let capabilities = self
            .registry
            .capabilities(self.guid)
            .ok_or(PortError::DeviceNotFound(self.guid))?;
        if !capabilities.is_superset_of(self.required) {
            return Err(PortError::MissingCapability { guid: self.guid });
        }

        self.registry
            .with_handle_mut(self.guid, |h| h.open())
            .ok_or(PortError::DeviceNotFound(self.guid))??;

        // Node addressing is best effort; plug updates against node 0 still
        // work on single-device buses.
        let (local, remote) = self
            .registry
            .with_handle(self.guid, |h| h.node_ids())
            .ok_or(PortError::DeviceNotFound(self.guid))?
            .unwrap_or_else(|e| {
                warn!("Node position query failed, defaulting to node 0: {}", e);
                (NodeId(0), NodeId(0))
            });
        let mut link = self.link.lock().expect("link state lock poisoned");
        link.local_node = Some(local);
        link.remote_node = Some(remote);
        Ok(())
    }

    /// Release one reference; returns whether the native handle was closed
    ///
    /// A call with no outstanding open is rejected and returns `false`.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock().expect("port state lock poisoned");
        if state.ref_count == 0 {
            warn!("Port close without a matching open");
            return false;
        }

        state.ref_count -= 1;
        if state.ref_count > 0 {
            info!("Port still open ({} refs)", state.ref_count);
            return false;
        }

        self.registry.with_handle_mut(self.guid, |h| h.close());
        self.link
            .lock()
            .expect("link state lock poisoned")
            .clear_nodes();
        if let Err(e) = self.monitor.stop() {
            warn!("Failed to stop monitor on close: {}", e);
        }
        info!("Port closed for device {}", self.guid);
        true
    }

    /// Whether the native handle reports open
    ///
    /// Asks the handle, not the reference count, so an externally closed
    /// service is detected.
    pub fn is_open(&self) -> bool {
        self.registry
            .with_handle(self.guid, |h| h.is_open())
            .unwrap_or(false)
    }
}

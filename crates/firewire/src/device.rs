//! Set-top device facade
//!
//! Wires the registry, monitor, port, plug, watchdog and stream components
//! together for one device and exposes the small surface the surrounding
//! recorder uses: discovery, port open/close, listener registration, and
//! the command/response exchange for tuning.

use crate::bus::{Bus, BusError};
use crate::config::DeviceConfig;
use crate::monitor::{BusMonitor, MonitorError, PowerObserver};
use crate::plug::{LinkState, PlugRegisterManager};
use crate::port::{PortController, PortError};
use crate::registry::DeviceRegistry;
use crate::reset::BusResetHandler;
use crate::stream::{PacketListener, StreamController, StreamError};
use crate::watchdog::NoDataWatchdog;
use bytes::Bytes;
use protocol::{CapabilitySet, DeviceDescriptor, Guid, PowerMessage, SubunitType};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Subunits a usable set-top device must expose
pub fn stb_requirements() -> CapabilitySet {
    [SubunitType::Tuner, SubunitType::Panel].into_iter().collect()
}

/// Command/response exchange failures
#[derive(Debug, Error)]
pub enum CommandError {
    /// No registry record for the device
    #[error("Device {0} has not been discovered")]
    DeviceNotFound(Guid),

    /// Every attempt failed; holds the last bus error
    #[error("Command failed after {attempts} attempts: {source}")]
    Failed {
        attempts: u32,
        #[source]
        source: BusError,
    },
}

/// One external tuner/set-top device on the serial bus
pub struct StbDevice {
    bus: Arc<dyn Bus>,
    guid: Guid,
    config: DeviceConfig,
    registry: DeviceRegistry,
    port: PortController,
    stream: Arc<StreamController>,
}

impl StbDevice {
    pub fn new(bus: Arc<dyn Bus>, guid: Guid, config: DeviceConfig) -> Self {
        let registry = DeviceRegistry::new();
        let link = Arc::new(Mutex::new(LinkState::new(config.speed)));
        let plug = Arc::new(PlugRegisterManager::new(Arc::clone(&bus), link.clone()));

        let reset_handler = Arc::new(BusResetHandler::new(
            plug.clone(),
            link.clone(),
            config.plug_number,
            config.plug_retry_count,
        ));
        let monitor = Arc::new(BusMonitor::new(
            Arc::clone(&bus),
            registry.clone(),
            reset_handler,
            config.monitor_timings(),
        ));

        let port = PortController::new(
            registry.clone(),
            monitor,
            link.clone(),
            guid,
            stb_requirements(),
        );

        let watchdog = Arc::new(NoDataWatchdog::new(
            config.no_data_timeout(),
            config.reset_timeout(),
        ));
        let stream = Arc::new(StreamController::new(
            Arc::clone(&bus),
            registry.clone(),
            guid,
            plug,
            link,
            watchdog,
            config.stream_settings(),
        ));

        StbDevice {
            bus,
            guid,
            config,
            registry,
            port,
            stream,
        }
    }

    /// Stable id of the device this facade drives
    pub fn guid(&self) -> Guid {
        self.guid
    }

    /// Open the port (shared across concurrent callers)
    pub fn open(&self) -> Result<(), PortError> {
        self.port.open()
    }

    /// Release one open reference; true when the handle was closed
    pub fn close(&self) -> bool {
        self.port.close()
    }

    /// Whether the native handle reports open
    pub fn is_port_open(&self) -> bool {
        self.port.is_open()
    }

    /// Register a packet listener; the first one starts streaming
    pub fn add_listener(&self, listener: Arc<dyn PacketListener>) -> Result<(), StreamError> {
        self.stream.add_listener(listener)
    }

    /// Unregister a packet listener; the last one closes the stream
    pub fn remove_listener(&self, listener: &Arc<dyn PacketListener>) -> Result<(), StreamError> {
        self.stream.remove_listener(listener)
    }

    /// Whether packets are currently flowing
    pub fn is_streaming(&self) -> bool {
        self.stream.is_streaming()
    }

    /// Execute one command/response exchange, retrying transient failures
    ///
    /// Uses the configured retry count; callers with their own retry policy
    /// go through [`StbDevice::send_command_with_retry`].
    pub fn send_command(&self, command: &[u8]) -> Result<Bytes, CommandError> {
        self.send_command_with_retry(command, self.config.command_retry_count)
    }

    /// Execute one command/response exchange with an explicit attempt bound
    pub fn send_command_with_retry(
        &self,
        command: &[u8],
        retry_count: u32,
    ) -> Result<Bytes, CommandError> {
        let attempts = retry_count.max(1);
        let mut last = BusError::NoDevice;
        for attempt in 1..=attempts {
            let outcome = self
                .registry
                .with_handle(self.guid, |h| h.send_command(command))
                .ok_or(CommandError::DeviceNotFound(self.guid))?;
            match outcome {
                Ok(response) => return Ok(response),
                Err(e) => {
                    debug!("Command attempt {} failed: {}", attempt, e);
                    last = e;
                }
            }
        }
        Err(CommandError::Failed {
            attempts,
            source: last,
        })
    }

    /// Force a bus-wide reset; true on success
    pub fn reset_bus(&self) -> bool {
        info!("Resetting bus on request");
        match self.bus.bus_reset() {
            Ok(()) => true,
            Err(e) => {
                warn!("Bus reset failed: {}", e);
                false
            }
        }
    }
}

struct DiscoveryObserver;

impl PowerObserver for DiscoveryObserver {
    fn on_power_message(&self, message: PowerMessage) {
        debug!("Notification during discovery: {:?}", message);
    }
}

/// Enumerate devices on `bus` whose capabilities cover `required`
///
/// Runs a short-lived monitor so the returned snapshot includes every
/// device present at the time of the call, in first-seen order.
pub fn discover(
    bus: Arc<dyn Bus>,
    required: CapabilitySet,
    config: &DeviceConfig,
) -> Result<Vec<DeviceDescriptor>, MonitorError> {
    let registry = DeviceRegistry::new();
    let monitor = BusMonitor::new(
        bus,
        registry.clone(),
        Arc::new(DiscoveryObserver),
        config.monitor_timings(),
    );

    monitor.start()?;
    let devices = registry.list_matching(required);
    monitor.stop()?;

    info!("Discovery found {} matching devices", devices.len());
    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBus;

    fn short_config() -> DeviceConfig {
        DeviceConfig {
            poll_interval_ms: 10,
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn test_discover_filters_by_capability() {
        let bus = Arc::new(MockBus::new());
        bus.add_device(Guid(0xABC123), stb_requirements());
        bus.add_device(Guid(0x999), [SubunitType::Camera].into_iter().collect());

        let found = discover(bus, stb_requirements(), &short_config()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].guid, Guid(0xABC123));
    }

    #[test]
    fn test_open_close_facade() {
        let bus = Arc::new(MockBus::new());
        bus.add_device(Guid(0xABC123), stb_requirements());
        let device = StbDevice::new(bus, Guid(0xABC123), short_config());

        assert!(!device.is_port_open());
        device.open().unwrap();
        assert!(device.is_port_open());
        assert!(device.close());
        assert!(!device.is_port_open());
    }

    #[test]
    fn test_send_command_scripted_response() {
        let bus = Arc::new(MockBus::new());
        let state = bus.add_device(Guid(0xABC123), stb_requirements());
        let device = StbDevice::new(bus, Guid(0xABC123), short_config());
        device.open().unwrap();

        state.push_command_response(vec![0x0C, 0xA8, 0x00]);
        let response = device.send_command(&[0x01, 0xA8, 0x00]).unwrap();
        assert_eq!(response.as_ref(), &[0x0C, 0xA8, 0x00]);
        device.close();
    }

    #[test]
    fn test_send_command_retries_transient_failure() {
        let bus = Arc::new(MockBus::new());
        let state = bus.add_device(Guid(0xABC123), stb_requirements());
        let device = StbDevice::new(bus, Guid(0xABC123), short_config());
        device.open().unwrap();

        state.fail_commands(2);
        state.push_command_response(vec![0x0C]);
        // default command_retry_count is 3; two failures then the response
        let response = device.send_command(&[0x01]).unwrap();
        assert_eq!(response.as_ref(), &[0x0C]);
        device.close();
    }

    #[test]
    fn test_send_command_exhausts_retries() {
        let bus = Arc::new(MockBus::new());
        let state = bus.add_device(Guid(0xABC123), stb_requirements());
        let device = StbDevice::new(bus, Guid(0xABC123), short_config());
        device.open().unwrap();

        state.fail_commands(10);
        let err = device.send_command(&[0x01]).unwrap_err();
        assert!(matches!(err, CommandError::Failed { attempts: 3, .. }));
        device.close();
    }

    #[test]
    fn test_send_command_with_explicit_retry_bound() {
        let bus = Arc::new(MockBus::new());
        let state = bus.add_device(Guid(0xABC123), stb_requirements());
        let device = StbDevice::new(bus, Guid(0xABC123), short_config());
        device.open().unwrap();

        // a single-attempt call does not absorb the failure
        state.fail_commands(1);
        let err = device.send_command_with_retry(&[0x01], 1).unwrap_err();
        assert!(matches!(err, CommandError::Failed { attempts: 1, .. }));

        // a two-attempt call does
        state.fail_commands(1);
        state.push_command_response(vec![0x0C]);
        let response = device.send_command_with_retry(&[0x01], 2).unwrap();
        assert_eq!(response.as_ref(), &[0x0C]);
        device.close();
    }

    #[test]
    fn test_send_command_unknown_device() {
        let bus = Arc::new(MockBus::new());
        let device = StbDevice::new(bus, Guid(0xBEEF), short_config());
        let err = device.send_command(&[0x01]).unwrap_err();
        assert!(matches!(err, CommandError::DeviceNotFound(Guid(0xBEEF))));
    }

    #[test]
    fn test_reset_bus() {
        let bus = Arc::new(MockBus::new());
        bus.add_device(Guid(0xABC123), stb_requirements());
        let device = StbDevice::new(bus.clone(), Guid(0xABC123), short_config());
        assert!(device.reset_bus());
        assert_eq!(bus.bus_reset_count(), 1);
    }
}

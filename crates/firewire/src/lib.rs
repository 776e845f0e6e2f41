//! Isochronous MPEG-2 capture from FireWire set-top devices
//!
//! This crate discovers tuner/set-top devices on an IEEE 1394 bus, opens a
//! reference-counted port to one of them, reserves an isochronous channel
//! through the device's plug control register, and streams 188-byte
//! transport packets to registered listeners. A background monitor thread
//! tracks attach and power notifications; a no-data watchdog escalates
//! prolonged silence to a bus reset, and the reset handler re-acquires the
//! channel afterwards.
//!
//! The platform bindings sit behind the traits in [`bus`]; [`mock`]
//! provides an in-memory implementation for tests. [`device::StbDevice`]
//! is the assembled facade most callers want.

pub mod bus;
pub mod config;
pub mod device;
pub mod mock;
pub mod monitor;
pub mod plug;
pub mod port;
pub mod registry;
pub mod reset;
pub mod stream;
pub mod watchdog;

pub use bus::{AvcHandle, Bus, BusError, BusPoll, IsochReceiver, ReceiverSink};
pub use config::DeviceConfig;
pub use device::{CommandError, StbDevice, discover, stb_requirements};
pub use monitor::{BusMonitor, MonitorError, MonitorTimings, PowerObserver, RunState};
pub use plug::{LinkState, PlugError, PlugRegisterManager};
pub use port::{PortController, PortError};
pub use registry::DeviceRegistry;
pub use reset::BusResetHandler;
pub use stream::{PacketListener, StreamController, StreamError, StreamSettings};
pub use watchdog::{NoDataWatchdog, WatchdogVerdict};

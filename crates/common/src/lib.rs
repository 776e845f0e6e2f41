//! Common utilities for the FireWire STB capture subsystem
//!
//! Shared plumbing between the protocol types and the device core: the
//! workspace-level error type, tracing setup, and the control-channel bridge
//! into the bus-monitor thread.

pub mod channel;
pub mod error;
pub mod logging;

pub use channel::{MonitorCommand, MonitorHandle, MonitorWorker, create_monitor_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;

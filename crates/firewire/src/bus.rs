//! Hardware abstraction for the serial bus
//!
//! Everything below this seam is platform plumbing: asynchronous register
//! transactions, isochronous DMA, and service-matching notifications. The
//! subsystem only ever talks to these traits, so tests run against the
//! in-memory implementation in [`crate::mock`] and a production build plugs
//! in the platform bindings.
//!
//! Callback surfaces are typed closures bundled in [`ReceiverSink`] rather
//! than raw function pointers with context arguments; the receiver invokes
//! them from its own thread, so they must be quick and must not call back
//! into the receiver.

use bytes::Bytes;
use protocol::{
    BusAddress, CapabilitySet, Guid, IsochChannel, NodeId, PowerMessage, ReceiverMessage, Speed,
    TsPacket,
};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the bus layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// Transient transaction failure (read, write, lock request)
    #[error("Bus I/O failure: {0}")]
    Io(String),

    /// The addressed device is no longer reachable
    #[error("Device not reachable on the bus")]
    NoDevice,

    /// Operation requires an open device handle
    #[error("Device handle is not open")]
    NotOpen,

    /// Node positions could not be resolved in the current generation
    #[error("Node addressing unavailable: {0}")]
    NodeQuery(String),
}

/// One event delivered by the bus event loop
pub enum BusPoll {
    /// A device matching the service filter appeared (or re-announced itself)
    DeviceMatched {
        /// Stable 64-bit id of the matched device
        guid: Guid,
        /// Fresh native handle for the device
        handle: Box<dyn AvcHandle>,
    },
    /// Power/topology notification for an already-known service
    Power(PowerMessage),
}

/// Callbacks the isochronous receiver drives
///
/// `on_packets` gets each batch of validated 188-byte packets in arrival
/// order. `on_message` reports port allocation and integrity events.
/// `on_no_data` fires when no packet arrived within the receiver's no-data
/// timeout.
pub struct ReceiverSink {
    pub on_packets: Box<dyn FnMut(&[TsPacket]) + Send>,
    pub on_message: Box<dyn FnMut(ReceiverMessage) + Send>,
    pub on_no_data: Box<dyn FnMut() + Send>,
}

/// An MPEG-2 receiver bound to one device's isochronous input
pub trait IsochReceiver: Send {
    /// Select the channel to listen on for the next `start`
    fn set_channel(&mut self, channel: IsochChannel);

    /// Select the receive speed for the next `start`
    fn set_speed(&mut self, speed: Speed);

    /// Begin reception; packets flow into the sink until `stop`
    fn start(&mut self) -> Result<(), BusError>;

    /// Halt reception
    fn stop(&mut self) -> Result<(), BusError>;
}

/// Native handle for one AV/C device service
pub trait AvcHandle: Send {
    /// Open the underlying service for exclusive use
    fn open(&mut self) -> Result<(), BusError>;

    /// Close the service; idempotent
    fn close(&mut self);

    /// Whether the service currently reports open
    fn is_open(&self) -> bool;

    /// Subunit capabilities advertised by the device
    fn capabilities(&self) -> CapabilitySet;

    /// Resolve (local, remote) node positions for the current generation
    fn node_ids(&self) -> Result<(NodeId, NodeId), BusError>;

    /// Execute one command/response exchange with the device
    fn send_command(&self, command: &[u8]) -> Result<Bytes, BusError>;

    /// Create an isochronous receiver bound to this device
    ///
    /// `no_data_timeout` is the silence interval after which the receiver
    /// fires the sink's no-data callback.
    fn create_receiver(
        &self,
        sink: ReceiverSink,
        no_data_timeout: Duration,
    ) -> Result<Box<dyn IsochReceiver>, BusError>;
}

/// The serial bus itself
pub trait Bus: Send + Sync {
    /// Devices matching the service filter at subscription time
    ///
    /// Called once by the monitor thread before it reports running, so a
    /// successful monitor start implies the registry holds every device
    /// already present on the bus.
    fn enumerate(&self) -> Result<Vec<(Guid, Box<dyn AvcHandle>)>, BusError>;

    /// Wait up to `timeout` for the next attach or power notification
    fn poll_event(&self, timeout: Duration) -> Result<Option<BusPoll>, BusError>;

    /// Read one quadlet from a device's CSR space
    fn read_quadlet(&self, node: NodeId, addr: BusAddress) -> Result<u32, BusError>;

    /// Atomic compare-and-swap on a CSR quadlet
    ///
    /// Returns `Ok(false)` when the register no longer holds `expected`;
    /// that is a detected concurrent writer, not an I/O failure.
    fn compare_swap(
        &self,
        node: NodeId,
        addr: BusAddress,
        expected: u32,
        new: u32,
    ) -> Result<bool, BusError>;

    /// Force a bus-wide reset and topology renegotiation
    fn bus_reset(&self) -> Result<(), BusError>;

    /// Current bus generation counter
    fn generation(&self) -> Result<u32, BusError>;

    /// Maximum common speed between two nodes in the given generation
    fn speed_between_nodes(
        &self,
        generation: u32,
        remote: NodeId,
        local: NodeId,
    ) -> Result<Speed, BusError>;

    /// Version of the platform bus interface
    ///
    /// Interfaces older than 4 cannot answer [`Bus::speed_between_nodes`];
    /// callers fall back to reading the device's master plug register.
    fn interface_version(&self) -> u32;
}

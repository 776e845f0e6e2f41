//! Stream controller
//!
//! Owns the isochronous receiver for one device and fans received transport
//! packets out to registered listeners. The hardware resource follows
//! demand: the first listener starts reception, removing the last one stops
//! it and tears the receiver down.
//!
//! The receiver reports port allocation requests and integrity events
//! through typed messages; allocation is delegated to the plug register
//! manager, silence is delegated to the watchdog and may escalate to a bus
//! reset. Listener callbacks run synchronously on the receiver's thread in
//! packet arrival order and must not block.

use crate::bus::{Bus, BusError, IsochReceiver, ReceiverSink};
use crate::plug::{LinkState, PlugRegisterManager};
use crate::registry::DeviceRegistry;
use crate::watchdog::{NoDataWatchdog, WatchdogVerdict};
use protocol::{
    BusAddress, Guid, IsochChannel, OMPR_ADDRESS_LO, PlugRegister, ReceiverMessage, Speed,
    TsPacket, opcr_address,
};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Receives transport packets from a streaming device
///
/// Called on the receiver's thread for every packet, in arrival order.
/// Implementations must return quickly; a slow listener stalls delivery to
/// every other listener on the same device.
pub trait PacketListener: Send + Sync {
    fn on_packet(&self, packet: &TsPacket);
}

/// Streaming errors
#[derive(Debug, Error)]
pub enum StreamError {
    /// No registry record for the device
    #[error("Device {0} is not registered")]
    DeviceNotFound(Guid),

    /// Underlying bus/receiver failure
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Per-device streaming parameters, taken from the device config
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    /// Speed to request; clamped to the device's negotiated maximum
    pub requested_speed: Speed,
    /// Output plug the connection is made on
    pub plug_number: u32,
    /// Retry bound for plug register updates
    pub plug_retry_count: u32,
    /// Silence interval before the receiver fires a no-data event
    pub no_data_timeout: Duration,
}

/// Receiver, streaming flag and listener list, guarded as a unit
#[derive(Default)]
struct SessionState {
    receiver: Option<Box<dyn IsochReceiver>>,
    streaming: bool,
    listeners: Vec<Arc<dyn PacketListener>>,
}

/// Manages one device's isochronous session and its listeners
pub struct StreamController {
    bus: Arc<dyn Bus>,
    registry: DeviceRegistry,
    guid: Guid,
    plug: Arc<PlugRegisterManager>,
    link: Arc<Mutex<LinkState>>,
    watchdog: Arc<NoDataWatchdog>,
    settings: StreamSettings,
    session: Mutex<SessionState>,
}

impl StreamController {
    pub fn new(
        bus: Arc<dyn Bus>,
        registry: DeviceRegistry,
        guid: Guid,
        plug: Arc<PlugRegisterManager>,
        link: Arc<Mutex<LinkState>>,
        watchdog: Arc<NoDataWatchdog>,
        settings: StreamSettings,
    ) -> Self {
        StreamController {
            bus,
            registry,
            guid,
            plug,
            link,
            watchdog,
            settings,
            session: Mutex::new(SessionState::default()),
        }
    }

    /// Whether packets are currently flowing
    pub fn is_streaming(&self) -> bool {
        self.session.lock().expect("session lock poisoned").streaming
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.session.lock().expect("session lock poisoned").listeners.len()
    }

    /// Create the receiver; no-op if the stream is already open
    ///
    /// Negotiates the receive speed first: the requested speed is clamped to
    /// the device's maximum, and a failed speed query keeps the requested
    /// value with a warning.
    pub fn open_stream(self: &Arc<Self>) -> Result<(), StreamError> {
        let mut session = self.session.lock().expect("session lock poisoned");
        if session.receiver.is_some() {
            return Ok(());
        }

        let speed = self.negotiate_speed();
        self.link.lock().expect("link state lock poisoned").speed = speed;

        if let Some(channel) = self.active_stream_channel() {
            info!("Device is already streaming on channel {}", channel);
        }

        let sink = self.make_sink();
        let receiver = self
            .registry
            .with_handle(self.guid, |h| {
                h.create_receiver(sink, self.settings.no_data_timeout)
            })
            .ok_or(StreamError::DeviceNotFound(self.guid))?
            .map_err(StreamError::Bus)?;
        session.receiver = Some(receiver);

        info!("Stream open at {}", speed);
        Ok(())
    }

    /// Begin reception; opens the stream first if needed. Idempotent.
    pub fn start_streaming(self: &Arc<Self>) -> Result<(), StreamError> {
        self.open_stream()?;

        let mut session = self.session.lock().expect("session lock poisoned");
        if session.streaming {
            return Ok(());
        }
        let speed = self.link.lock().expect("link state lock poisoned").speed;
        let receiver = session.receiver.as_mut().ok_or(BusError::NotOpen)?;

        // Channel allocation happens inside start, reported back through an
        // allocate-port message; we only pin the speed here.
        receiver.set_channel(IsochChannel::Any);
        receiver.set_speed(speed);
        receiver.start()?;
        session.streaming = true;

        info!("Streaming started");
        Ok(())
    }

    /// Halt reception; the receiver stays open. Idempotent.
    pub fn stop_streaming(&self) -> Result<(), StreamError> {
        let mut session = self.session.lock().expect("session lock poisoned");
        if !session.streaming {
            return Ok(());
        }
        if let Some(receiver) = session.receiver.as_mut() {
            receiver.stop()?;
        }
        session.streaming = false;

        info!("Streaming stopped");
        Ok(())
    }

    /// Stop streaming and destroy the receiver
    pub fn close_stream(&self) {
        let mut session = self.session.lock().expect("session lock poisoned");
        if session.streaming {
            if let Some(receiver) = session.receiver.as_mut()
                && let Err(e) = receiver.stop()
            {
                warn!("Failed to stop reception on close: {}", e);
            }
            session.streaming = false;
        }
        if session.receiver.take().is_some() {
            info!("Stream closed");
        }
    }

    /// Register a listener; the first one starts streaming
    ///
    /// Registration is by identity and idempotent. The listener stays
    /// registered even when the start fails, so a later retry or a bus reset
    /// can resume delivery without re-registration.
    pub fn add_listener(
        self: &Arc<Self>,
        listener: Arc<dyn PacketListener>,
    ) -> Result<(), StreamError> {
        let count = {
            let mut session = self.session.lock().expect("session lock poisoned");
            if session.listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
                return Ok(());
            }
            session.listeners.push(listener);
            session.listeners.len()
        };
        debug!("Added listener ({} total)", count);

        if count == 1 {
            self.start_streaming()?;
        }
        Ok(())
    }

    /// Unregister a listener; removing the last one closes the stream
    ///
    /// Teardown is unconditional: even when the stop fails, the receiver is
    /// destroyed and the session ends, and the error is reported afterwards.
    pub fn remove_listener(&self, listener: &Arc<dyn PacketListener>) -> Result<(), StreamError> {
        let remaining = {
            let mut session = self.session.lock().expect("session lock poisoned");
            let before = session.listeners.len();
            session.listeners.retain(|l| !Arc::ptr_eq(l, listener));
            if session.listeners.len() == before {
                return Ok(());
            }
            session.listeners.len()
        };
        debug!("Removed listener ({} remaining)", remaining);

        if remaining == 0 {
            let stopped = self.stop_streaming();
            self.close_stream();
            stopped?;
        }
        Ok(())
    }

    /// Deliver a batch of packets to every listener, in order
    fn broadcast(&self, packets: &[TsPacket]) {
        let session = self.session.lock().expect("session lock poisoned");
        for packet in packets {
            for listener in &session.listeners {
                listener.on_packet(packet);
            }
        }
    }

    /// React to a receiver port/integrity message
    fn handle_receiver_message(&self, message: ReceiverMessage) {
        match message {
            ReceiverMessage::AllocateIsochPort { speed, channel } => {
                info!("Allocating isoch port: speed {}, channel {}", speed, channel);
                if let Err(e) = self.plug.update(
                    self.settings.plug_number,
                    channel,
                    Some(speed),
                    true,
                    false,
                    self.settings.plug_retry_count,
                ) {
                    warn!("Isoch port allocation failed: {}", e);
                }
            }
            ReceiverMessage::ReleaseIsochPort => {
                info!("Releasing isoch port");
                if let Err(e) = self.plug.update(
                    self.settings.plug_number,
                    IsochChannel::Any,
                    None,
                    false,
                    true,
                    self.settings.plug_retry_count,
                ) {
                    warn!("Isoch port release failed: {}", e);
                }
            }
            ReceiverMessage::DclOverrun => error!("DCL overrun, packets lost"),
            ReceiverMessage::BadPacket => error!("Malformed packet on the isochronous channel"),
            ReceiverMessage::Unknown(code) => {
                debug!("Unhandled receiver message 0x{:08x}", code);
            }
        }
    }

    /// React to a no-data event; sustained silence resets the bus
    fn handle_no_data(&self) {
        match self.watchdog.on_no_data() {
            WatchdogVerdict::Silence(_) => {}
            WatchdogVerdict::TriggerReset => {
                warn!("Resetting bus");
                if let Err(e) = self.bus.bus_reset() {
                    warn!("Bus reset failed: {}", e);
                }
            }
        }
    }

    /// Build the callback bundle handed to the receiver
    ///
    /// Closures hold weak references so a receiver outliving its controller
    /// delivers into the void instead of keeping the controller alive.
    fn make_sink(self: &Arc<Self>) -> ReceiverSink {
        let packets: Weak<Self> = Arc::downgrade(self);
        let messages = packets.clone();
        let silence = packets.clone();
        ReceiverSink {
            on_packets: Box::new(move |batch| {
                if let Some(ctl) = packets.upgrade() {
                    ctl.broadcast(batch);
                }
            }),
            on_message: Box::new(move |message| {
                if let Some(ctl) = messages.upgrade() {
                    ctl.handle_receiver_message(message);
                }
            }),
            on_no_data: Box::new(move || {
                if let Some(ctl) = silence.upgrade() {
                    ctl.handle_no_data();
                }
            }),
        }
    }

    fn negotiate_speed(&self) -> Speed {
        let requested = self.settings.requested_speed;
        match self.max_speed() {
            Ok(max) if max < requested => {
                info!("Device maximum speed {} is below requested {}", max, requested);
                max
            }
            Ok(_) => requested,
            Err(e) => {
                warn!("Speed query failed, keeping {}: {}", requested, e);
                requested
            }
        }
    }

    /// Maximum speed usable towards the device
    ///
    /// Newer bus interfaces answer a generation-aware speed-between-nodes
    /// query; older ones expose only the device's transmit capability in the
    /// top bits of its master plug register.
    fn max_speed(&self) -> Result<Speed, BusError> {
        let (local, remote) = {
            let link = self.link.lock().expect("link state lock poisoned");
            (
                link.local_node.ok_or(BusError::NotOpen)?,
                link.remote_node.ok_or(BusError::NotOpen)?,
            )
        };

        if self.bus.interface_version() < 4 {
            let raw = self
                .bus
                .read_quadlet(remote, BusAddress::register(OMPR_ADDRESS_LO))?;
            return Speed::from_code(raw >> 30).map_err(|e| BusError::Io(e.to_string()));
        }

        let generation = self.bus.generation()?;
        self.bus.speed_between_nodes(generation, remote, local)
    }

    /// Channel the device's output plug is already streaming on, if any
    fn active_stream_channel(&self) -> Option<u8> {
        let remote = self
            .link
            .lock()
            .expect("link state lock poisoned")
            .remote_node?;
        match self
            .bus
            .read_quadlet(remote, opcr_address(self.settings.plug_number))
        {
            Ok(raw) => {
                let reg = PlugRegister::new(raw);
                reg.in_use().then(|| reg.channel())
            }
            Err(e) => {
                debug!("Output plug probe failed: {}", e);
                None
            }
        }
    }
}

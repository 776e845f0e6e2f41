//! In-memory bus implementation
//!
//! A scriptable stand-in for the platform bus bindings: devices are added
//! programmatically, CSR registers live in a hash map, and compare-swap
//! interference can be injected to exercise the retry paths. Used by the
//! test suites in this crate and available to downstream integration tests,
//! which is why it is a regular module rather than test-gated.

use crate::bus::{AvcHandle, Bus, BusError, BusPoll, IsochReceiver, ReceiverSink};
use bytes::Bytes;
use protocol::{
    BusAddress, CapabilitySet, Guid, IsochChannel, NodeId, PowerMessage, ReceiverMessage, Speed,
    TsPacket,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scriptable in-memory serial bus
pub struct MockBus {
    devices: Mutex<Vec<(Guid, Arc<MockDeviceState>)>>,
    registers: Mutex<HashMap<(NodeId, BusAddress), u32>>,
    /// Remaining injected external writes; each one defeats one compare-swap
    cas_interference: Mutex<u32>,
    events_tx: Sender<BusPoll>,
    events_rx: Mutex<Receiver<BusPoll>>,
    bus_resets: AtomicU32,
    generation: AtomicU32,
    interface_version: AtomicU32,
    max_speed: Mutex<Speed>,
}

impl MockBus {
    pub fn new() -> Self {
        let (events_tx, events_rx) = channel();
        MockBus {
            devices: Mutex::new(Vec::new()),
            registers: Mutex::new(HashMap::new()),
            cas_interference: Mutex::new(0),
            events_tx,
            events_rx: Mutex::new(events_rx),
            bus_resets: AtomicU32::new(0),
            generation: AtomicU32::new(1),
            interface_version: AtomicU32::new(4),
            max_speed: Mutex::new(Speed::S400),
        }
    }

    /// Add a device without raising an attach event (present at enumerate)
    pub fn add_device(&self, guid: Guid, capabilities: CapabilitySet) -> Arc<MockDeviceState> {
        let state = Arc::new(MockDeviceState::new(capabilities));
        self.devices
            .lock()
            .expect("mock devices lock poisoned")
            .push((guid, state.clone()));
        state
    }

    /// Add a device and raise an attach event for the monitor loop
    pub fn attach_device(&self, guid: Guid, capabilities: CapabilitySet) -> Arc<MockDeviceState> {
        let state = self.add_device(guid, capabilities);
        self.events_tx
            .send(BusPoll::DeviceMatched {
                guid,
                handle: Box::new(MockAvcHandle {
                    state: state.clone(),
                }),
            })
            .expect("mock event channel closed");
        state
    }

    /// Queue a power/topology notification for the monitor loop
    pub fn push_power_message(&self, message: PowerMessage) {
        self.events_tx
            .send(BusPoll::Power(message))
            .expect("mock event channel closed");
    }

    /// Write a CSR register directly, bypassing the compare-swap protocol
    pub fn set_register(&self, node: NodeId, addr: BusAddress, value: u32) {
        self.registers
            .lock()
            .expect("mock registers lock poisoned")
            .insert((node, addr), value);
    }

    /// Current CSR register value (unwritten registers read as zero)
    pub fn register(&self, node: NodeId, addr: BusAddress) -> u32 {
        *self
            .registers
            .lock()
            .expect("mock registers lock poisoned")
            .get(&(node, addr))
            .unwrap_or(&0)
    }

    /// Make the next `count` compare-swaps lose to a simulated external
    /// writer that bumps the register value by one
    pub fn set_compare_swap_interference(&self, count: u32) {
        *self
            .cas_interference
            .lock()
            .expect("mock interference lock poisoned") = count;
    }

    /// Speed reported by the speed-between-nodes query
    pub fn set_max_speed(&self, speed: Speed) {
        *self.max_speed.lock().expect("mock speed lock poisoned") = speed;
    }

    /// Platform interface version (values below 4 force the legacy
    /// master-plug-register speed path)
    pub fn set_interface_version(&self, version: u32) {
        self.interface_version.store(version, Ordering::SeqCst);
    }

    /// Number of bus resets requested so far
    pub fn bus_reset_count(&self) -> u32 {
        self.bus_resets.load(Ordering::SeqCst)
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for MockBus {
    fn enumerate(&self) -> Result<Vec<(Guid, Box<dyn AvcHandle>)>, BusError> {
        let devices = self.devices.lock().expect("mock devices lock poisoned");
        Ok(devices
            .iter()
            .map(|(guid, state)| {
                let handle: Box<dyn AvcHandle> = Box::new(MockAvcHandle {
                    state: state.clone(),
                });
                (*guid, handle)
            })
            .collect())
    }

    fn poll_event(&self, timeout: Duration) -> Result<Option<BusPoll>, BusError> {
        let rx = self.events_rx.lock().expect("mock event lock poisoned");
        match rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                Err(BusError::Io("event channel closed".to_string()))
            }
        }
    }

    fn read_quadlet(&self, node: NodeId, addr: BusAddress) -> Result<u32, BusError> {
        Ok(self.register(node, addr))
    }

    fn compare_swap(
        &self,
        node: NodeId,
        addr: BusAddress,
        expected: u32,
        new: u32,
    ) -> Result<bool, BusError> {
        let mut registers = self.registers.lock().expect("mock registers lock poisoned");
        let slot = registers.entry((node, addr)).or_insert(0);

        let mut interference = self
            .cas_interference
            .lock()
            .expect("mock interference lock poisoned");
        if *interference > 0 {
            *interference -= 1;
            // another controller on the bus got there first
            *slot = slot.wrapping_add(1);
        }

        if *slot == expected {
            *slot = new;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn bus_reset(&self) -> Result<(), BusError> {
        self.bus_resets.fetch_add(1, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn generation(&self) -> Result<u32, BusError> {
        Ok(self.generation.load(Ordering::SeqCst))
    }

    fn speed_between_nodes(
        &self,
        _generation: u32,
        _remote: NodeId,
        _local: NodeId,
    ) -> Result<Speed, BusError> {
        Ok(*self.max_speed.lock().expect("mock speed lock poisoned"))
    }

    fn interface_version(&self) -> u32 {
        self.interface_version.load(Ordering::SeqCst)
    }
}

/// Shared state for one mock device, observable from tests
pub struct MockDeviceState {
    inner: Mutex<DeviceInner>,
}

struct DeviceInner {
    capabilities: CapabilitySet,
    open: bool,
    open_count: u32,
    fail_open: bool,
    node_ids: (NodeId, NodeId),
    fail_node_ids: bool,
    command_responses: VecDeque<Vec<u8>>,
    fail_commands: u32,
    fail_receiver_stops: u32,
    assigned_channel: u8,
    receiver: Option<Arc<ReceiverShared>>,
}

impl MockDeviceState {
    fn new(capabilities: CapabilitySet) -> Self {
        MockDeviceState {
            inner: Mutex::new(DeviceInner {
                capabilities,
                open: false,
                open_count: 0,
                fail_open: false,
                node_ids: (NodeId(0), NodeId(1)),
                fail_node_ids: false,
                command_responses: VecDeque::new(),
                fail_commands: 0,
                fail_receiver_stops: 0,
                assigned_channel: 1,
                receiver: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceInner> {
        self.inner.lock().expect("mock device lock poisoned")
    }

    /// Change the advertised subunits (takes effect on the next handle)
    pub fn set_capabilities(&self, capabilities: CapabilitySet) {
        self.lock().capabilities = capabilities;
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Number of successful native opens so far
    pub fn open_count(&self) -> u32 {
        self.lock().open_count
    }

    /// Make subsequent open calls fail
    pub fn fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    pub fn set_node_ids(&self, local: NodeId, remote: NodeId) {
        self.lock().node_ids = (local, remote);
    }

    /// Make node position queries fail
    pub fn fail_node_ids(&self, fail: bool) {
        self.lock().fail_node_ids = fail;
    }

    /// Queue a response for the next command exchange
    pub fn push_command_response(&self, response: Vec<u8>) {
        self.lock().command_responses.push_back(response);
    }

    /// Make the next `count` command exchanges fail
    pub fn fail_commands(&self, count: u32) {
        self.lock().fail_commands = count;
    }

    /// Make the next `count` receiver stop calls fail
    pub fn fail_stops(&self, count: u32) {
        self.lock().fail_receiver_stops = count;
    }

    /// Channel the receiver reports when asked for "any available"
    pub fn set_assigned_channel(&self, channel: u8) {
        self.lock().assigned_channel = channel;
    }

    /// Whether a receiver exists for this device
    pub fn has_receiver(&self) -> bool {
        self.lock().receiver.is_some()
    }

    /// Whether the receiver exists and reception is running
    pub fn receiver_started(&self) -> bool {
        let receiver = self.lock().receiver.clone();
        receiver.is_some_and(|r| r.inner.lock().expect("mock receiver lock poisoned").started)
    }

    /// Push a batch of packets through the receiver's sink
    ///
    /// The started check and the callback run under separate locks so a
    /// delivery never holds receiver state while calling into the session.
    pub fn deliver_packets(&self, packets: &[TsPacket]) {
        let Some(receiver) = self.lock().receiver.clone() else {
            return;
        };
        let started = receiver
            .inner
            .lock()
            .expect("mock receiver lock poisoned")
            .started;
        if started {
            let mut on_packets = receiver
                .on_packets
                .lock()
                .expect("mock sink lock poisoned");
            (on_packets)(packets);
        }
    }

    /// Fire the receiver's no-data callback once
    pub fn trigger_no_data(&self) {
        let Some(receiver) = self.lock().receiver.clone() else {
            return;
        };
        let mut on_no_data = receiver
            .on_no_data
            .lock()
            .expect("mock sink lock poisoned");
        (on_no_data)();
    }
}

struct MockAvcHandle {
    state: Arc<MockDeviceState>,
}

impl AvcHandle for MockAvcHandle {
    fn open(&mut self) -> Result<(), BusError> {
        let mut inner = self.state.lock();
        if inner.fail_open {
            return Err(BusError::Io("simulated open failure".to_string()));
        }
        inner.open = true;
        inner.open_count += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.state.lock().open = false;
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn capabilities(&self) -> CapabilitySet {
        self.state.lock().capabilities
    }

    fn node_ids(&self) -> Result<(NodeId, NodeId), BusError> {
        let inner = self.state.lock();
        if inner.fail_node_ids {
            return Err(BusError::NodeQuery("simulated query failure".to_string()));
        }
        Ok(inner.node_ids)
    }

    fn send_command(&self, command: &[u8]) -> Result<Bytes, BusError> {
        let mut inner = self.state.lock();
        if inner.fail_commands > 0 {
            inner.fail_commands -= 1;
            return Err(BusError::Io("simulated command failure".to_string()));
        }
        // unscripted exchanges echo the command back
        match inner.command_responses.pop_front() {
            Some(response) => Ok(Bytes::from(response)),
            None => Ok(Bytes::copy_from_slice(command)),
        }
    }

    fn create_receiver(
        &self,
        sink: ReceiverSink,
        _no_data_timeout: Duration,
    ) -> Result<Box<dyn IsochReceiver>, BusError> {
        let shared = Arc::new(ReceiverShared {
            inner: Mutex::new(ReceiverInner {
                started: false,
                channel: IsochChannel::Any,
                speed: Speed::S100,
            }),
            on_packets: Mutex::new(sink.on_packets),
            on_message: Mutex::new(sink.on_message),
            on_no_data: Mutex::new(sink.on_no_data),
        });
        self.state.lock().receiver = Some(shared.clone());
        Ok(Box::new(MockReceiver {
            shared,
            state: self.state.clone(),
        }))
    }
}

/// Receiver state and sink, observable from the device after the boxed
/// receiver itself moved into the stream controller
///
/// Each sink callback sits behind its own lock; callbacks are invoked with
/// no other receiver lock held, since they call back into the session.
struct ReceiverShared {
    inner: Mutex<ReceiverInner>,
    on_packets: Mutex<Box<dyn FnMut(&[TsPacket]) + Send>>,
    on_message: Mutex<Box<dyn FnMut(ReceiverMessage) + Send>>,
    on_no_data: Mutex<Box<dyn FnMut() + Send>>,
}

struct ReceiverInner {
    started: bool,
    channel: IsochChannel,
    speed: Speed,
}

struct MockReceiver {
    shared: Arc<ReceiverShared>,
    state: Arc<MockDeviceState>,
}

impl IsochReceiver for MockReceiver {
    fn set_channel(&mut self, channel: IsochChannel) {
        self.shared
            .inner
            .lock()
            .expect("mock receiver lock poisoned")
            .channel = channel;
    }

    fn set_speed(&mut self, speed: Speed) {
        self.shared
            .inner
            .lock()
            .expect("mock receiver lock poisoned")
            .speed = speed;
    }

    fn start(&mut self) -> Result<(), BusError> {
        let assigned = self.state.lock().assigned_channel;
        let (channel, speed) = {
            let mut inner = self.shared.inner.lock().expect("mock receiver lock poisoned");
            if inner.started {
                return Ok(());
            }
            inner.started = true;

            // a real receiver resolves "any available" during port allocation
            let channel = match inner.channel {
                IsochChannel::Any => IsochChannel::Numbered(assigned),
                numbered => numbered,
            };
            (channel, inner.speed)
        };

        let mut on_message = self
            .shared
            .on_message
            .lock()
            .expect("mock sink lock poisoned");
        (on_message)(ReceiverMessage::AllocateIsochPort { speed, channel });
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BusError> {
        {
            let mut device = self.state.lock();
            if device.fail_receiver_stops > 0 {
                device.fail_receiver_stops -= 1;
                return Err(BusError::Io("simulated stop failure".to_string()));
            }
        }
        {
            let mut inner = self.shared.inner.lock().expect("mock receiver lock poisoned");
            if !inner.started {
                return Ok(());
            }
            inner.started = false;
        }

        let mut on_message = self
            .shared
            .on_message
            .lock()
            .expect("mock sink lock poisoned");
        (on_message)(ReceiverMessage::ReleaseIsochPort);
        Ok(())
    }
}

impl Drop for MockReceiver {
    fn drop(&mut self) {
        let mut inner = self.state.lock();
        if let Some(current) = &inner.receiver
            && Arc::ptr_eq(current, &self.shared)
        {
            inner.receiver = None;
        }
    }
}

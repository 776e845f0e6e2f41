//! End-to-end capture scenarios against the in-memory bus

use anyhow::Result;
use firewire::mock::MockBus;
use firewire::{DeviceConfig, PacketListener, StbDevice, discover, stb_requirements};
use protocol::{
    Guid, IsochChannel, NodeId, PlugRegister, PowerMessage, SubunitType, TS_SYNC_BYTE, TsPacket,
    opcr_address,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn fast_config() -> DeviceConfig {
    DeviceConfig {
        poll_interval_ms: 10,
        ..DeviceConfig::default()
    }
}

fn tagged_packet(tag: u8) -> TsPacket {
    let mut buf = [0u8; 188];
    buf[0] = TS_SYNC_BYTE;
    buf[1] = tag;
    TsPacket::from_bytes(&buf).unwrap()
}

fn opcr0(bus: &MockBus) -> PlugRegister {
    PlugRegister::new(bus.register(NodeId(1), opcr_address(0)))
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

struct Recorder(Mutex<Vec<u8>>);

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Recorder(Mutex::new(Vec::new())))
    }
}

impl PacketListener for Recorder {
    fn on_packet(&self, packet: &TsPacket) {
        self.0.lock().unwrap().push(packet.as_bytes()[1]);
    }
}

#[test]
fn test_capture_session_lifecycle() -> Result<()> {
    let bus = Arc::new(MockBus::new());
    let state = bus.add_device(Guid(0xABC123), stb_requirements());
    let device = StbDevice::new(bus.clone(), Guid(0xABC123), fast_config());

    device.open()?;
    assert!(device.is_port_open());

    let recorder = Recorder::new();
    let listener: Arc<dyn PacketListener> = recorder.clone();
    device.add_listener(listener.clone())?;
    assert!(device.is_streaming());
    assert_eq!(opcr0(&bus).connection_count(), 1);

    let batch: Vec<TsPacket> = (0..10).map(tagged_packet).collect();
    state.deliver_packets(&batch);
    assert_eq!(*recorder.0.lock().unwrap(), (0..10).collect::<Vec<u8>>());

    device.remove_listener(&listener)?;
    assert!(!device.is_streaming());
    assert!(!state.has_receiver());
    assert_eq!(opcr0(&bus).connection_count(), 0);

    assert!(device.close());
    assert!(!device.is_port_open());
    Ok(())
}

#[test]
fn test_shared_open_single_native_handle() -> Result<()> {
    let bus = Arc::new(MockBus::new());
    let state = bus.add_device(Guid(0xABC123), stb_requirements());
    let device = StbDevice::new(bus, Guid(0xABC123), fast_config());

    device.open()?;
    device.open()?;
    assert_eq!(state.open_count(), 1);

    assert!(!device.close());
    assert!(state.is_open());
    assert!(device.close());
    assert!(!state.is_open());
    // a third close has nothing to release
    assert!(!device.close());
    Ok(())
}

#[test]
fn test_in_use_channel_survives_second_connection() -> Result<()> {
    use firewire::{Bus, LinkState, PlugRegisterManager};
    use protocol::Speed;

    let bus = Arc::new(MockBus::new());
    bus.set_register(
        NodeId(1),
        opcr_address(0),
        PlugRegister::new(0).with_channel(5).raw(),
    );
    let mut link = LinkState::new(Speed::S100);
    link.local_node = Some(NodeId(0));
    link.remote_node = Some(NodeId(1));
    let plug = PlugRegisterManager::new(
        bus.clone() as Arc<dyn Bus>,
        Arc::new(Mutex::new(link)),
    );

    plug.update(0, IsochChannel::Numbered(7), Some(Speed::S100), true, false, 4)?;
    let reg = opcr0(&bus);
    assert_eq!((reg.channel(), reg.connection_count()), (7, 1));

    // the second connection's channel request loses to the in-use channel
    plug.update(0, IsochChannel::Numbered(9), Some(Speed::S100), true, false, 4)?;
    let reg = opcr0(&bus);
    assert_eq!((reg.channel(), reg.connection_count()), (7, 2));
    Ok(())
}

#[test]
fn test_bus_reset_recovery_reacquires_channel() -> Result<()> {
    let bus = Arc::new(MockBus::new());
    let state = bus.add_device(Guid(0xABC123), stb_requirements());
    state.set_assigned_channel(7);
    let device = StbDevice::new(bus.clone(), Guid(0xABC123), fast_config());

    device.open()?;
    let listener: Arc<dyn PacketListener> = Recorder::new();
    device.add_listener(listener)?;
    assert_eq!(opcr0(&bus).channel(), 7);
    assert_eq!(opcr0(&bus).connection_count(), 1);

    // end of a bus reset; the handler re-requests channel 7
    bus.push_power_message(PowerMessage::Resumed);
    assert!(wait_until(Duration::from_secs(2), || {
        opcr0(&bus).connection_count() == 2
    }));
    assert_eq!(opcr0(&bus).channel(), 7);
    Ok(())
}

#[test]
fn test_sustained_silence_resets_the_bus() -> Result<()> {
    let bus = Arc::new(MockBus::new());
    let state = bus.add_device(Guid(0xABC123), stb_requirements());
    let device = StbDevice::new(bus.clone(), Guid(0xABC123), fast_config());

    device.open()?;
    let listener: Arc<dyn PacketListener> = Recorder::new();
    device.add_listener(listener)?;

    // default policy: 1500 ms of silence at 300 ms granularity, so the
    // sixth back-to-back timeout escalates
    for _ in 0..5 {
        state.trigger_no_data();
    }
    assert_eq!(bus.bus_reset_count(), 0);
    state.trigger_no_data();
    assert_eq!(bus.bus_reset_count(), 1);
    Ok(())
}

#[test]
fn test_discovery_reports_capable_devices_in_order() -> Result<()> {
    let bus = Arc::new(MockBus::new());
    bus.add_device(Guid(0xABC123), stb_requirements());
    bus.add_device(Guid(0x111), [SubunitType::Camera].into_iter().collect());
    bus.add_device(Guid(0xDEF456), stb_requirements());

    let found = discover(bus, stb_requirements(), &fast_config())?;
    let guids: Vec<Guid> = found.iter().map(|d| d.guid).collect();
    assert_eq!(guids, vec![Guid(0xABC123), Guid(0xDEF456)]);
    Ok(())
}

#[test]
fn test_open_rejects_device_without_required_subunits() {
    let bus = Arc::new(MockBus::new());
    bus.add_device(Guid(0x777), [SubunitType::Tuner].into_iter().collect());
    let device = StbDevice::new(bus, Guid(0x777), fast_config());

    assert!(device.open().is_err());
    assert!(!device.is_port_open());
}

#[test]
fn test_tuning_command_roundtrip() -> Result<()> {
    let bus = Arc::new(MockBus::new());
    let state = bus.add_device(Guid(0xABC123), stb_requirements());
    let device = StbDevice::new(bus, Guid(0xABC123), fast_config());
    device.open()?;

    // accepted response to a panel passthrough press
    state.push_command_response(vec![0x09, 0x48, 0x7C, 0x00]);
    let response = device.send_command(&[0x00, 0x48, 0x7C, 0x00])?;
    assert_eq!(response.as_ref(), &[0x09, 0x48, 0x7C, 0x00]);

    device.close();
    Ok(())
}

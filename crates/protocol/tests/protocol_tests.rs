//! Protocol wire-format tests
//!
//! Run with: `cargo test -p protocol --test protocol_tests`

use protocol::{
    CapabilitySet, Guid, IsochChannel, PlugRegister, PowerMessage, Speed, SubunitType,
    TS_PACKET_SIZE, TsPacket, opcr_address,
};

#[test]
fn test_plug_register_full_roundtrip() {
    let reg = PlugRegister::new(0x8000_0000) // online bit, as a real device sets it
        .with_connection_count(1)
        .with_channel(7)
        .with_speed_code(Speed::S400.code());

    let wire = reg.to_be_bytes();
    let back = PlugRegister::from_be_bytes(&wire).unwrap();

    assert_eq!(back.connection_count(), 1);
    assert_eq!(back.channel(), 7);
    assert_eq!(Speed::from_code(back.speed_code() as u32).unwrap(), Speed::S400);
    assert_eq!(back.raw() & 0x8000_0000, 0x8000_0000);
}

#[test]
fn test_plug_register_matches_documented_layout() {
    // Hand-packed value: count=3 at bits 29-24, channel=5 at 21-16, speed=2 at 15-14
    let raw = (3u32 << 24) | (5 << 16) | (2 << 14);
    let reg = PlugRegister::new(raw);

    assert_eq!(reg.connection_count(), 3);
    assert_eq!(reg.channel(), 5);
    assert_eq!(reg.speed_code(), 2);
}

#[test]
fn test_opcr_address_stride() {
    let base = opcr_address(0);
    for plug in 0..4u32 {
        let addr = opcr_address(plug);
        assert_eq!(addr.hi, 0xFFFF);
        assert_eq!(addr.lo, base.lo + 4 * plug);
    }
}

#[test]
fn test_stb_capability_query() {
    let required: CapabilitySet = [SubunitType::Tuner, SubunitType::Panel]
        .into_iter()
        .collect();

    let stb: CapabilitySet = [SubunitType::Tuner, SubunitType::Panel, SubunitType::Ca]
        .into_iter()
        .collect();
    let camcorder: CapabilitySet = [SubunitType::Camera, SubunitType::Tape]
        .into_iter()
        .collect();

    assert!(stb.is_superset_of(required));
    assert!(!camcorder.is_superset_of(required));
}

#[test]
fn test_power_message_unknown_is_preserved() {
    let msg = PowerMessage::from_code(0x1234_5678);
    assert_eq!(msg, PowerMessage::Unknown(0x1234_5678));
}

#[test]
fn test_ts_packet_from_capture_buffer() {
    // A receive callback hands over a batch of contiguous 188-byte packets
    let mut buf = vec![0u8; TS_PACKET_SIZE * 3];
    for (i, chunk) in buf.chunks_mut(TS_PACKET_SIZE).enumerate() {
        chunk[0] = 0x47;
        chunk[1] = i as u8;
    }

    let packets: Vec<TsPacket> = buf
        .chunks(TS_PACKET_SIZE)
        .map(|c| TsPacket::from_bytes(c).unwrap())
        .collect();

    assert_eq!(packets.len(), 3);
    assert!(packets.iter().all(TsPacket::has_sync_byte));
    assert_eq!(packets[2].as_bytes()[1], 2);
}

#[test]
fn test_guid_and_channel_display() {
    assert_eq!(format!("{}", Guid(0xABC123)), "0x0000000000abc123");
    assert_eq!(format!("{}", IsochChannel::Any), "any");
    assert_eq!(format!("{}", IsochChannel::Numbered(7)), "7");
}

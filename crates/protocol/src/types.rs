//! Device identity and streaming type definitions
//!
//! GUIDs, AV/C subunit capability sets, isochronous speed/channel values,
//! and the fixed-size transport-stream packet delivered to listeners.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};

/// Globally unique 64-bit device identifier
///
/// Burned into the device and stable across bus resets and reconnects,
/// unlike node addresses which are renegotiated on every topology change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Guid(pub u64);

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// Physical node address on the bus
///
/// Only valid within one bus generation; a bus reset invalidates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u16);

/// AV/C subunit types
///
/// A device advertises one entry per logical function it exposes. The codes
/// are the standard AV/C subunit type values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubunitType {
    /// Video monitor
    Monitor,
    /// Audio subunit
    Audio,
    /// Printer
    Printer,
    /// Disc recorder/player
    Disc,
    /// Tape recorder/player
    Tape,
    /// Broadcast tuner
    Tuner,
    /// Conditional access module
    Ca,
    /// Camera
    Camera,
    /// Front panel (remote-control target)
    Panel,
    /// Bulletin board
    BulletinBoard,
    /// Vendor unique
    VendorUnique,
}

impl SubunitType {
    /// Standard AV/C subunit type code
    pub fn code(self) -> u8 {
        match self {
            SubunitType::Monitor => 0x00,
            SubunitType::Audio => 0x01,
            SubunitType::Printer => 0x02,
            SubunitType::Disc => 0x03,
            SubunitType::Tape => 0x04,
            SubunitType::Tuner => 0x05,
            SubunitType::Ca => 0x06,
            SubunitType::Camera => 0x07,
            SubunitType::Panel => 0x09,
            SubunitType::BulletinBoard => 0x0A,
            SubunitType::VendorUnique => 0x1C,
        }
    }

    /// Map a subunit type code back to a known subunit type
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(SubunitType::Monitor),
            0x01 => Some(SubunitType::Audio),
            0x02 => Some(SubunitType::Printer),
            0x03 => Some(SubunitType::Disc),
            0x04 => Some(SubunitType::Tape),
            0x05 => Some(SubunitType::Tuner),
            0x06 => Some(SubunitType::Ca),
            0x07 => Some(SubunitType::Camera),
            0x09 => Some(SubunitType::Panel),
            0x0A => Some(SubunitType::BulletinBoard),
            0x1C => Some(SubunitType::VendorUnique),
            _ => None,
        }
    }
}

/// Set of subunit capabilities advertised by one device
///
/// Stored as a bitmask indexed by subunit type code. A set-top box usable for
/// capture must advertise both [`SubunitType::Tuner`] and
/// [`SubunitType::Panel`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(u32);

impl CapabilitySet {
    /// Empty capability set
    pub fn empty() -> Self {
        CapabilitySet(0)
    }

    /// Add a subunit capability
    pub fn insert(&mut self, subunit: SubunitType) {
        self.0 |= 1 << subunit.code();
    }

    /// Check whether the device advertises a subunit
    pub fn contains(self, subunit: SubunitType) -> bool {
        self.0 & (1 << subunit.code()) != 0
    }

    /// True when every capability in `required` is present in `self`
    pub fn is_superset_of(self, required: CapabilitySet) -> bool {
        self.0 & required.0 == required.0
    }

    /// True when no capabilities are set
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<SubunitType> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = SubunitType>>(iter: I) -> Self {
        let mut set = CapabilitySet::empty();
        for subunit in iter {
            set.insert(subunit);
        }
        set
    }
}

/// Isochronous transfer speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Speed {
    /// 100 Mbps
    S100,
    /// 200 Mbps
    S200,
    /// 400 Mbps
    S400,
    /// 800 Mbps
    S800,
}

impl Speed {
    /// Two-bit speed code as carried in the plug register
    pub fn code(self) -> u8 {
        match self {
            Speed::S100 => 0,
            Speed::S200 => 1,
            Speed::S400 => 2,
            Speed::S800 => 3,
        }
    }

    /// Decode a two-bit speed code
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0 => Ok(Speed::S100),
            1 => Ok(Speed::S200),
            2 => Ok(Speed::S400),
            3 => Ok(Speed::S800),
            other => Err(ProtocolError::InvalidSpeedCode(other)),
        }
    }
}

impl std::fmt::Display for Speed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mbps = match self {
            Speed::S100 => 100,
            Speed::S200 => 200,
            Speed::S400 => 400,
            Speed::S800 => 800,
        };
        write!(f, "S{mbps}")
    }
}

/// Isochronous channel selection
///
/// `Any` asks the isochronous resource manager to pick a free channel; it is
/// also the recorded outcome when an allocation could not be confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsochChannel {
    /// Let the bus pick any available channel
    Any,
    /// A specific channel number, 0..=63
    Numbered(u8),
}

impl IsochChannel {
    /// Build a numbered channel, rejecting values outside the 6-bit field
    pub fn numbered(channel: u32) -> Result<Self> {
        if channel > crate::plug::MAX_CHANNEL as u32 {
            return Err(ProtocolError::InvalidChannel(channel));
        }
        Ok(IsochChannel::Numbered(channel as u8))
    }
}

impl std::fmt::Display for IsochChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IsochChannel::Any => write!(f, "any"),
            IsochChannel::Numbered(n) => write!(f, "{n}"),
        }
    }
}

/// Device summary returned by discovery queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Globally unique device id
    pub guid: Guid,
    /// Advertised subunit capabilities
    pub capabilities: CapabilitySet,
}

/// Size of one MPEG-2 transport-stream packet
pub const TS_PACKET_SIZE: usize = 188;

/// Sync byte leading every transport-stream packet
pub const TS_SYNC_BYTE: u8 = 0x47;

/// One fixed-size MPEG-2 transport-stream packet
///
/// The subsystem delivers these raw and in arrival order; demultiplexing is
/// the listener's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsPacket([u8; TS_PACKET_SIZE]);

impl TsPacket {
    /// Wrap a byte slice, rejecting anything that is not exactly 188 bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let data: [u8; TS_PACKET_SIZE] = bytes
            .try_into()
            .map_err(|_| ProtocolError::BadPacketLength { len: bytes.len() })?;
        Ok(TsPacket(data))
    }

    /// Packet contents
    pub fn as_bytes(&self) -> &[u8; TS_PACKET_SIZE] {
        &self.0
    }

    /// True when the packet starts with the standard 0x47 sync byte
    pub fn has_sync_byte(&self) -> bool {
        self.0[0] == TS_SYNC_BYTE
    }
}

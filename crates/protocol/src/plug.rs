//! Plug control register wire format
//!
//! The output plug control registers (oPCR) live in the device's CSR address
//! space and encode how many logical connections are attached to an
//! isochronous output plug, on which channel and at what speed. Updates go
//! through a read / modify / compare-swap protocol so concurrent controllers
//! on the bus are detected rather than clobbered.
//!
//! Register layout (32-bit quadlet, big-endian on the wire):
//!
//! ```text
//!   bit 31      online
//!   bit 30      broadcast connection flag
//!   bits 29-24  point-to-point connection count (0..=63)
//!   bits 21-16  channel number (0..=63)
//!   bits 15-14  speed code (0..=3)
//! ```

use crate::error::{ProtocolError, Result};
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

/// Upper 16 bits of every CSR register-space address
pub const CSR_REGISTER_SPACE_HI: u16 = 0xFFFF;

/// Low 32 bits of the output master plug register (oMPR)
///
/// Bits 31-30 of the oMPR carry the device's maximum transmit speed; older
/// bus interfaces that cannot answer a speed-between-nodes query fall back
/// to reading this register directly.
pub const OMPR_ADDRESS_LO: u32 = 0xF000_0900;

/// Low 32 bits of oPCR[0]; oPCR[n] follows at 4-byte strides
pub const OPCR_BASE_LO: u32 = 0xF000_0904;

/// Largest representable point-to-point connection count
pub const MAX_CONNECTION_COUNT: u8 = 0x3F;

/// Largest representable isochronous channel number
pub const MAX_CHANNEL: u8 = 0x3F;

const BROADCAST_BIT: u32 = 1 << 30;
const COUNT_SHIFT: u32 = 24;
const COUNT_MASK: u32 = 0x3F << COUNT_SHIFT;
const CHANNEL_SHIFT: u32 = 16;
const CHANNEL_MASK: u32 = 0x3F << CHANNEL_SHIFT;
const SPEED_SHIFT: u32 = 14;
const SPEED_MASK: u32 = 0x03 << SPEED_SHIFT;

/// A 48-bit CSR bus address, split into the conventional hi/lo halves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusAddress {
    /// Upper 16 address bits
    pub hi: u16,
    /// Lower 32 address bits
    pub lo: u32,
}

impl BusAddress {
    /// Address within the CSR register space
    pub fn register(lo: u32) -> Self {
        BusAddress {
            hi: CSR_REGISTER_SPACE_HI,
            lo,
        }
    }
}

impl std::fmt::Display for BusAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}:{:08x}", self.hi, self.lo)
    }
}

/// CSR address of output plug control register `plug`
pub fn opcr_address(plug: u32) -> BusAddress {
    BusAddress::register(OPCR_BASE_LO + 4 * plug)
}

/// Decoded view of one plug control register value
///
/// All accessors and builders operate on the raw 32-bit value and preserve
/// every bit they do not explicitly touch, so reserved and vendor bits
/// survive a read-modify-write cycle untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlugRegister(u32);

impl PlugRegister {
    /// Wrap a raw register value
    pub fn new(raw: u32) -> Self {
        PlugRegister(raw)
    }

    /// Decode a big-endian quadlet as read from the bus
    pub fn from_be_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 4 {
            return Err(ProtocolError::ShortQuadlet { len: bytes.len() });
        }
        Ok(PlugRegister(BigEndian::read_u32(bytes)))
    }

    /// Raw register value
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Encode as a big-endian quadlet for a bus write
    pub fn to_be_bytes(self) -> [u8; 4] {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, self.0);
        buf
    }

    /// Point-to-point connection count field
    pub fn connection_count(self) -> u8 {
        ((self.0 & COUNT_MASK) >> COUNT_SHIFT) as u8
    }

    /// Channel number field
    pub fn channel(self) -> u8 {
        ((self.0 & CHANNEL_MASK) >> CHANNEL_SHIFT) as u8
    }

    /// Speed code field
    pub fn speed_code(self) -> u8 {
        ((self.0 & SPEED_MASK) >> SPEED_SHIFT) as u8
    }

    /// Broadcast connection flag
    pub fn broadcast(self) -> bool {
        self.0 & BROADCAST_BIT != 0
    }

    /// True when any connection (point-to-point or broadcast) is attached
    pub fn in_use(self) -> bool {
        self.broadcast() || self.connection_count() > 0
    }

    /// Replace the connection count field, leaving all other bits intact
    pub fn with_connection_count(self, count: u8) -> Self {
        let cleared = self.0 & !COUNT_MASK;
        PlugRegister(cleared | ((count as u32 & 0x3F) << COUNT_SHIFT))
    }

    /// Replace the channel field, leaving all other bits intact
    pub fn with_channel(self, channel: u8) -> Self {
        let cleared = self.0 & !CHANNEL_MASK;
        PlugRegister(cleared | ((channel as u32 & 0x3F) << CHANNEL_SHIFT))
    }

    /// Replace the speed code field, leaving all other bits intact
    pub fn with_speed_code(self, code: u8) -> Self {
        let cleared = self.0 & !SPEED_MASK;
        PlugRegister(cleared | ((code as u32 & 0x03) << SPEED_SHIFT))
    }

    /// Clear the broadcast connection flag
    pub fn clear_broadcast(self) -> Self {
        PlugRegister(self.0 & !BROADCAST_BIT)
    }
}

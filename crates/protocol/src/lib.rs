//! Wire-level types for the FireWire STB capture subsystem
//!
//! This crate defines the identity and register types shared by every other
//! crate in the workspace: 64-bit device GUIDs, AV/C subunit capability sets,
//! isochronous speed codes and channel numbers, the bit-packed plug control
//! register (oPCR) with its CSR addressing, bus/power notification kinds, and
//! the fixed-size MPEG-2 transport-stream packet.
//!
//! # Example
//!
//! ```
//! use protocol::{PlugRegister, Speed};
//!
//! let reg = PlugRegister::new(0)
//!     .with_connection_count(1)
//!     .with_channel(7)
//!     .with_speed_code(Speed::S200.code());
//!
//! assert_eq!(reg.connection_count(), 1);
//! assert_eq!(reg.channel(), 7);
//! assert_eq!(reg.speed_code(), 1);
//! ```

pub mod error;
pub mod messages;
pub mod plug;
pub mod types;

pub use error::{ProtocolError, Result};
pub use messages::{PowerMessage, ReceiverMessage};
pub use plug::{
    BusAddress, CSR_REGISTER_SPACE_HI, MAX_CHANNEL, MAX_CONNECTION_COUNT, OMPR_ADDRESS_LO,
    OPCR_BASE_LO, PlugRegister, opcr_address,
};
pub use types::{
    CapabilitySet, DeviceDescriptor, Guid, IsochChannel, NodeId, Speed, SubunitType,
    TS_PACKET_SIZE, TS_SYNC_BYTE, TsPacket,
};

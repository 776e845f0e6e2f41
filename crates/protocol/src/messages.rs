//! Bus and receiver notification kinds
//!
//! Asynchronous notifications arrive from two places: the bus delivers
//! power/topology messages about the device service, and the isochronous
//! receiver reports allocation and data-integrity events. Both are modeled
//! as exhaustive enums with an `Unknown` tail so every new kind has to be
//! consciously handled at the match site.

use crate::types::{IsochChannel, Speed};
use serde::{Deserialize, Serialize};

/// Power/topology notification about the device service
///
/// Only [`PowerMessage::Resumed`] (the end of a bus reset) triggers active
/// recovery; every other kind is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerMessage {
    /// Device service is gone (detach)
    Terminated,
    /// Another client asked us to close the service
    RequestingClose,
    /// Someone is attempting to open the service
    AttemptingOpen,
    /// Service was closed
    Closed,
    /// Bus reset started; node addressing is about to change
    Suspended,
    /// Bus reset finished; channel/bandwidth may need re-acquisition
    Resumed,
    /// Service busy state changed
    BusyStateChange,
    /// Device finished powering on
    PoweredOn,
    /// Unmapped notification code
    Unknown(u32),
}

impl PowerMessage {
    /// Map a raw service notification code to a message kind
    pub fn from_code(code: u32) -> Self {
        match code {
            0x8000_0010 => PowerMessage::Terminated,
            0x8000_0100 => PowerMessage::RequestingClose,
            0x8000_0101 => PowerMessage::AttemptingOpen,
            0x8000_0110 => PowerMessage::Closed,
            0x8000_0020 => PowerMessage::Suspended,
            0x8000_0030 => PowerMessage::Resumed,
            0x8000_0120 => PowerMessage::BusyStateChange,
            0x8000_0230 => PowerMessage::PoweredOn,
            other => PowerMessage::Unknown(other),
        }
    }
}

/// Notification from the isochronous receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiverMessage {
    /// Receiver bound an isochronous port; the plug register must gain a
    /// connection on the reported channel and speed
    AllocateIsochPort {
        /// Negotiated receive speed
        speed: Speed,
        /// Channel the receiver settled on
        channel: IsochChannel,
    },
    /// Receiver released its isochronous port; the plug connection must be
    /// dropped
    ReleaseIsochPort,
    /// Descriptor list overrun in the receive engine; data was lost
    DclOverrun,
    /// A packet failed basic validation and was discarded
    BadPacket,
    /// Unmapped receiver message code
    Unknown(u32),
}

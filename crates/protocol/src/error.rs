//! Protocol error types

use thiserror::Error;

/// Wire-format validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Channel number outside the 6-bit register field
    #[error("Invalid isochronous channel: {0} (max 63)")]
    InvalidChannel(u32),

    /// Speed code outside the 2-bit register field
    #[error("Invalid speed code: {0} (max 3)")]
    InvalidSpeedCode(u32),

    /// Transport packet of the wrong size
    #[error("Bad transport packet length: {len} bytes (expected 188)")]
    BadPacketLength { len: usize },

    /// Register quadlet of the wrong size
    #[error("Bad quadlet length: {len} bytes (expected 4)")]
    ShortQuadlet { len: usize },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::InvalidChannel(64);
        assert!(format!("{err}").contains("64"));

        let err = ProtocolError::BadPacketLength { len: 204 };
        let msg = format!("{err}");
        assert!(msg.contains("204"));
        assert!(msg.contains("188"));
    }
}

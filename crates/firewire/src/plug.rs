//! Plug register manager
//!
//! Performs the read / modify / compare-swap protocol on the device's output
//! plug control register: bump or drop the connection count, honoring the
//! rule that an in-use plug's channel and speed are immutable. A compare-swap
//! mismatch means another controller on the bus raced us; it is retried like
//! any transient I/O failure, bounded by the caller's retry count. A count
//! that would leave [0, 63] is the caller's logic error and fails
//! immediately.
//!
//! The manager also remembers the "actual channel" — the channel obtained by
//! the last successful update, or "any available" after a total failure —
//! which bus-reset recovery later tries to re-acquire.

use crate::bus::{Bus, BusError};
use protocol::{IsochChannel, NodeId, PlugRegister, Speed, opcr_address};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

/// Node positions and negotiated speed for the open port
///
/// Written by the port controller on open/close and by the stream controller
/// after speed negotiation; read by plug updates and bus-reset recovery.
#[derive(Debug, Clone, Copy)]
pub struct LinkState {
    pub local_node: Option<NodeId>,
    pub remote_node: Option<NodeId>,
    pub speed: Speed,
}

impl LinkState {
    pub fn new(speed: Speed) -> Self {
        LinkState {
            local_node: None,
            remote_node: None,
            speed,
        }
    }

    /// Forget node addressing (port closed or generation invalidated)
    pub fn clear_nodes(&mut self) {
        self.local_node = None;
        self.remote_node = None;
    }
}

/// Plug register update errors
#[derive(Debug, Error)]
pub enum PlugError {
    /// Resulting connection count would leave [0, 63]; rejected, no retry
    #[error("Invalid plug connection count {0}")]
    CountOutOfRange(i32),

    /// No remote node known; the port is not open
    #[error("No remote node; port is not open")]
    NoRemoteNode,

    /// The register changed between read and compare-swap
    #[error("Plug register changed underneath the update")]
    Conflict,

    /// Bus transaction failure
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Every attempt failed with a transient error
    #[error("Plug register update failed after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Serializes connection-count/channel/speed updates for one device
pub struct PlugRegisterManager {
    bus: Arc<dyn Bus>,
    link: Arc<Mutex<LinkState>>,
    actual_channel: Mutex<IsochChannel>,
}

impl PlugRegisterManager {
    pub fn new(bus: Arc<dyn Bus>, link: Arc<Mutex<LinkState>>) -> Self {
        PlugRegisterManager {
            bus,
            link,
            actual_channel: Mutex::new(IsochChannel::Any),
        }
    }

    /// Channel obtained by the last successful update, or `Any` after a
    /// failed one; bus-reset recovery re-requests this first.
    pub fn actual_channel(&self) -> IsochChannel {
        *self.actual_channel.lock().expect("plug channel lock poisoned")
    }

    /// Update the plug register, retrying transient failures
    ///
    /// `channel` of `Any` keeps the register's current channel field; a
    /// `speed` of `None` keeps the current speed field. Requests to change
    /// either while connections are outstanding are coerced to the current
    /// value with a warning rather than failing.
    pub fn update(
        &self,
        plug: u32,
        channel: IsochChannel,
        speed: Option<Speed>,
        add: bool,
        remove: bool,
        retry_count: u32,
    ) -> Result<(), PlugError> {
        let remote = self
            .link
            .lock()
            .expect("link state lock poisoned")
            .remote_node
            .ok_or(PlugError::NoRemoteNode)?;

        let mut last_transient = None;
        for attempt in 1..=retry_count.max(1) {
            match self.try_update(remote, plug, channel, speed, add, remove) {
                Ok(()) => {
                    *self.actual_channel.lock().expect("plug channel lock poisoned") = channel;
                    return Ok(());
                }
                Err(e @ PlugError::CountOutOfRange(_)) => {
                    // Logic error in the request; retrying cannot help.
                    self.record_failure();
                    return Err(e);
                }
                Err(e) => {
                    debug!("Plug update attempt {} failed: {}", attempt, e);
                    last_transient = Some(e);
                }
            }
        }

        self.record_failure();
        match last_transient {
            Some(PlugError::Bus(e)) => Err(PlugError::Bus(e)),
            _ => Err(PlugError::RetriesExhausted {
                attempts: retry_count.max(1),
            }),
        }
    }

    fn record_failure(&self) {
        *self.actual_channel.lock().expect("plug channel lock poisoned") = IsochChannel::Any;
    }

    /// One read / modify / compare-swap cycle
    fn try_update(
        &self,
        remote: NodeId,
        plug: u32,
        channel: IsochChannel,
        speed: Option<Speed>,
        add: bool,
        remove: bool,
    ) -> Result<(), PlugError> {
        let addr = opcr_address(plug);
        let old_raw = self.bus.read_quadlet(remote, addr)?;
        let old = PlugRegister::new(old_raw);

        let new_count =
            old.connection_count() as i32 + if add { 1 } else { 0 } - if remove { 1 } else { 0 };
        if !(0..=protocol::MAX_CONNECTION_COUNT as i32).contains(&new_count) {
            warn!("Invalid plug count {}", new_count);
            return Err(PlugError::CountOutOfRange(new_count));
        }

        let mut new_channel = match channel {
            IsochChannel::Numbered(c) => c,
            IsochChannel::Any => old.channel(),
        };
        if old.connection_count() > 0 && new_channel != old.channel() {
            warn!(
                "Ignoring channel change request ({} -> {}), plug already open",
                old.channel(),
                new_channel
            );
            new_channel = old.channel();
        }

        let mut new_speed = speed.map(Speed::code).unwrap_or_else(|| old.speed_code());
        if old.connection_count() > 0 && new_speed != old.speed_code() {
            warn!(
                "Ignoring speed change request ({} -> {}), plug already open",
                old.speed_code(),
                new_speed
            );
            new_speed = old.speed_code();
        }

        let mut new = old
            .with_connection_count(new_count as u8)
            .with_channel(new_channel)
            .with_speed_code(new_speed);
        if remove {
            new = new.clear_broadcast();
        }

        if self.bus.compare_swap(remote, addr, old_raw, new.raw())? {
            Ok(())
        } else {
            Err(PlugError::Conflict)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBus;
    use protocol::Speed;

    fn manager_with_node(bus: &Arc<MockBus>) -> PlugRegisterManager {
        let mut link = LinkState::new(Speed::S100);
        link.local_node = Some(NodeId(0));
        link.remote_node = Some(NodeId(1));
        PlugRegisterManager::new(bus.clone() as Arc<dyn Bus>, Arc::new(Mutex::new(link)))
    }

    fn opcr0(bus: &MockBus) -> PlugRegister {
        PlugRegister::new(bus.register(NodeId(1), opcr_address(0)))
    }

    #[test]
    fn test_add_connection_sets_channel_and_speed() {
        let bus = Arc::new(MockBus::new());
        bus.set_register(NodeId(1), opcr_address(0), PlugRegister::new(0).with_channel(5).raw());
        let mgr = manager_with_node(&bus);

        mgr.update(0, IsochChannel::Numbered(7), Some(Speed::S200), true, false, 4)
            .unwrap();

        let reg = opcr0(&bus);
        assert_eq!(reg.connection_count(), 1);
        assert_eq!(reg.channel(), 7);
        assert_eq!(reg.speed_code(), Speed::S200.code());
        assert_eq!(mgr.actual_channel(), IsochChannel::Numbered(7));
    }

    #[test]
    fn test_in_use_channel_is_immutable() {
        let bus = Arc::new(MockBus::new());
        let mgr = manager_with_node(&bus);

        mgr.update(0, IsochChannel::Numbered(7), Some(Speed::S100), true, false, 4)
            .unwrap();
        // second connection asks for a different channel and speed
        mgr.update(0, IsochChannel::Numbered(9), Some(Speed::S400), true, false, 4)
            .unwrap();

        let reg = opcr0(&bus);
        assert_eq!(reg.connection_count(), 2);
        assert_eq!(reg.channel(), 7);
        assert_eq!(reg.speed_code(), Speed::S100.code());
    }

    #[test]
    fn test_count_bounds_rejected_without_write() {
        let bus = Arc::new(MockBus::new());
        let mgr = manager_with_node(&bus);
        let before = opcr0(&bus).raw();

        // removing from an empty plug would go negative
        let err = mgr
            .update(0, IsochChannel::Any, None, false, true, 4)
            .unwrap_err();
        assert!(matches!(err, PlugError::CountOutOfRange(-1)));
        assert_eq!(opcr0(&bus).raw(), before);
        assert_eq!(mgr.actual_channel(), IsochChannel::Any);
    }

    #[test]
    fn test_count_upper_bound() {
        let bus = Arc::new(MockBus::new());
        bus.set_register(
            NodeId(1),
            opcr_address(0),
            PlugRegister::new(0).with_connection_count(63).raw(),
        );
        let mgr = manager_with_node(&bus);

        let err = mgr
            .update(0, IsochChannel::Any, None, true, false, 4)
            .unwrap_err();
        assert!(matches!(err, PlugError::CountOutOfRange(64)));
    }

    #[test]
    fn test_compare_swap_conflict_is_retried() {
        let bus = Arc::new(MockBus::new());
        let mgr = manager_with_node(&bus);

        // one interfering external write; second attempt sees the new value
        bus.set_compare_swap_interference(1);
        mgr.update(0, IsochChannel::Numbered(3), Some(Speed::S100), true, false, 4)
            .unwrap();
        assert_eq!(opcr0(&bus).connection_count(), 1);
        assert_eq!(opcr0(&bus).channel(), 3);
    }

    #[test]
    fn test_retries_exhausted_records_any_channel() {
        let bus = Arc::new(MockBus::new());
        let mgr = manager_with_node(&bus);

        mgr.update(0, IsochChannel::Numbered(3), None, true, false, 4)
            .unwrap();
        assert_eq!(mgr.actual_channel(), IsochChannel::Numbered(3));

        bus.set_compare_swap_interference(10);
        let err = mgr
            .update(0, IsochChannel::Numbered(4), None, true, false, 3)
            .unwrap_err();
        assert!(matches!(err, PlugError::RetriesExhausted { attempts: 3 }));
        assert_eq!(mgr.actual_channel(), IsochChannel::Any);
    }

    #[test]
    fn test_remove_clears_broadcast() {
        let bus = Arc::new(MockBus::new());
        let initial = PlugRegister::new(1 << 30).with_connection_count(1).with_channel(7);
        bus.set_register(NodeId(1), opcr_address(0), initial.raw());
        let mgr = manager_with_node(&bus);

        mgr.update(0, IsochChannel::Any, None, false, true, 4).unwrap();

        let reg = opcr0(&bus);
        assert_eq!(reg.connection_count(), 0);
        assert!(!reg.broadcast());
        assert_eq!(reg.channel(), 7);
    }

    #[test]
    fn test_no_remote_node() {
        let bus = Arc::new(MockBus::new());
        let mgr = PlugRegisterManager::new(
            bus as Arc<dyn Bus>,
            Arc::new(Mutex::new(LinkState::new(Speed::S100))),
        );
        let err = mgr
            .update(0, IsochChannel::Any, None, true, false, 4)
            .unwrap_err();
        assert!(matches!(err, PlugError::NoRemoteNode));
    }
}

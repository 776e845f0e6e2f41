//! Bus reset recovery
//!
//! A bus reset renegotiates topology and can strand our isochronous
//! connection. The device service reports the reset as a suspended/resumed
//! pair; on resume this handler re-acquires the previously held channel
//! through the plug register, falling back to "any available" if the old
//! channel is gone. Recovery is best effort: failure leaves the device in
//! its current allocation state with a warning.
//!
//! Only the plug register is recovered here. The receiver object is owned
//! by the stream controller and is deliberately not re-created on reset;
//! the two resources are independent.

use crate::monitor::PowerObserver;
use crate::plug::{LinkState, PlugRegisterManager};
use protocol::{IsochChannel, PowerMessage};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Reacts to power/topology notifications from the bus monitor
pub struct BusResetHandler {
    plug: Arc<PlugRegisterManager>,
    link: Arc<Mutex<LinkState>>,
    plug_number: u32,
    retry_count: u32,
}

impl BusResetHandler {
    pub fn new(
        plug: Arc<PlugRegisterManager>,
        link: Arc<Mutex<LinkState>>,
        plug_number: u32,
        retry_count: u32,
    ) -> Self {
        BusResetHandler {
            plug,
            link,
            plug_number,
            retry_count,
        }
    }

    /// Re-acquire the channel held before the reset
    fn recover(&self) {
        let speed = self.link.lock().expect("link state lock poisoned").speed;
        let previous = self.plug.actual_channel();

        let first = self.plug.update(
            self.plug_number,
            previous,
            Some(speed),
            true,
            false,
            self.retry_count,
        );
        match first {
            Ok(()) => {
                info!("Reset: reconnected on channel {}", previous);
                return;
            }
            Err(e) => debug!("Reset: channel {} reconnect failed: {}", previous, e),
        }

        let fallback = self.plug.update(
            self.plug_number,
            IsochChannel::Any,
            Some(speed),
            true,
            false,
            self.retry_count,
        );
        match fallback {
            Ok(()) => info!("Reset: reconnected on any available channel"),
            Err(e) => warn!("Reset: failed to reconnect: {}", e),
        }
    }
}

impl PowerObserver for BusResetHandler {
    fn on_power_message(&self, message: PowerMessage) {
        match message {
            PowerMessage::Resumed => {
                // End of bus reset; channel allocation may be stale.
                info!("Bus reset complete, recovering plug connection");
                self.recover();
            }
            PowerMessage::Suspended => debug!("Bus reset in progress"),
            PowerMessage::Terminated => {
                // Detach. The registry record is kept; reconnects reuse it.
                info!("Device service terminated");
            }
            PowerMessage::RequestingClose => debug!("Service requesting close"),
            PowerMessage::AttemptingOpen => debug!("Service attempting open"),
            PowerMessage::Closed => debug!("Service closed"),
            PowerMessage::BusyStateChange => debug!("Service busy state changed"),
            PowerMessage::PoweredOn => debug!("Device powered on"),
            PowerMessage::Unknown(code) => debug!("Unhandled bus notification 0x{:08x}", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::mock::MockBus;
    use protocol::{NodeId, PlugRegister, Speed, opcr_address};

    fn handler(bus: &Arc<MockBus>) -> BusResetHandler {
        let mut link = LinkState::new(Speed::S200);
        link.local_node = Some(NodeId(0));
        link.remote_node = Some(NodeId(1));
        let link = Arc::new(Mutex::new(link));
        let plug = Arc::new(PlugRegisterManager::new(
            bus.clone() as Arc<dyn Bus>,
            link.clone(),
        ));
        BusResetHandler::new(plug, link, 0, 4)
    }

    #[test]
    fn test_resumed_reacquires_previous_channel() {
        let bus = Arc::new(MockBus::new());
        let h = handler(&bus);

        // hold channel 7 before the reset
        h.plug
            .update(0, IsochChannel::Numbered(7), Some(Speed::S200), true, false, 4)
            .unwrap();

        h.on_power_message(PowerMessage::Resumed);

        let reg = PlugRegister::new(bus.register(NodeId(1), opcr_address(0)));
        assert_eq!(reg.channel(), 7);
        assert_eq!(reg.connection_count(), 2);
        assert_eq!(h.plug.actual_channel(), IsochChannel::Numbered(7));
    }

    #[test]
    fn test_recovery_falls_back_to_any_channel() {
        let bus = Arc::new(MockBus::new());
        let h = handler(&bus);
        h.plug
            .update(0, IsochChannel::Numbered(7), Some(Speed::S200), true, false, 4)
            .unwrap();

        // first recovery attempt conflicts away all its retries, the
        // fallback with "any available" then succeeds
        bus.set_compare_swap_interference(4);
        h.on_power_message(PowerMessage::Resumed);

        assert_eq!(h.plug.actual_channel(), IsochChannel::Any);
        let reg = PlugRegister::new(bus.register(NodeId(1), opcr_address(0)));
        assert_eq!(reg.connection_count(), 2);
    }

    #[test]
    fn test_informational_messages_do_not_touch_registers() {
        let bus = Arc::new(MockBus::new());
        let h = handler(&bus);
        let before = bus.register(NodeId(1), opcr_address(0));

        for msg in [
            PowerMessage::Terminated,
            PowerMessage::Suspended,
            PowerMessage::Closed,
            PowerMessage::Unknown(0x42),
        ] {
            h.on_power_message(msg);
        }
        assert_eq!(bus.register(NodeId(1), opcr_address(0)), before);
    }
}

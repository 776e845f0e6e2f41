//! Control channel bridge into the bus-monitor thread
//!
//! The monitor thread owns the platform event loop and cannot be joined on
//! directly by arbitrary callers; control requests cross over on a bounded
//! channel that the thread drains between event polls.

use async_channel::{Receiver, Sender, bounded};

/// Control requests for the bus-monitor thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorCommand {
    /// Ask the event loop to exit after the current poll
    Shutdown,
}

/// Caller-side handle
#[derive(Clone)]
pub struct MonitorHandle {
    cmd_tx: Sender<MonitorCommand>,
}

impl MonitorHandle {
    /// Send a command, blocking until the channel accepts it
    ///
    /// Fails only when the monitor thread has already gone away and dropped
    /// its receiver.
    pub fn send_command(&self, cmd: MonitorCommand) -> crate::Result<()> {
        self.cmd_tx
            .send_blocking(cmd)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Monitor-thread-side handle
pub struct MonitorWorker {
    cmd_rx: Receiver<MonitorCommand>,
}

impl MonitorWorker {
    /// Take the next pending command without blocking
    pub fn try_recv_command(&self) -> Option<MonitorCommand> {
        self.cmd_rx.try_recv().ok()
    }
}

/// Create the control bridge between callers and the monitor thread
///
/// Returns (caller handle, worker handle).
pub fn create_monitor_bridge() -> (MonitorHandle, MonitorWorker) {
    let (cmd_tx, cmd_rx) = bounded(16);

    (MonitorHandle { cmd_tx }, MonitorWorker { cmd_rx })
}

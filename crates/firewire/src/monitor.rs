//! Bus monitor thread
//!
//! Owns the dedicated thread that runs the bus event loop: service-match
//! notifications feed the device registry, power/topology notifications go
//! to the registered observer. All other components call in from arbitrary
//! threads; start/stop block on a condvar with an explicit timeout instead
//! of spinning, and a timeout is surfaced as a failure.

use crate::bus::{Bus, BusPoll};
use crate::registry::DeviceRegistry;
use common::{MonitorCommand, MonitorHandle, create_monitor_bridge};
use protocol::PowerMessage;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Receives power/topology notifications from the monitor thread
///
/// Callbacks run on the monitor thread, serialized with respect to each
/// other, and must not block.
pub trait PowerObserver: Send + Sync {
    fn on_power_message(&self, message: PowerMessage);
}

/// Monitor lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Monitor lifecycle errors
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The event-loop thread did not report running within the timeout
    #[error("Monitor thread failed to reach running within {0:?}")]
    StartTimeout(Duration),

    /// The event-loop thread did not exit within the timeout
    #[error("Monitor thread failed to stop within {0:?}")]
    StopTimeout(Duration),

    /// start/stop raced with another lifecycle transition
    #[error("Monitor is busy in state {0:?}")]
    Busy(RunState),

    /// Control channel to the thread broke
    #[error("Monitor control channel error: {0}")]
    Channel(String),
}

/// Timing knobs for the monitor loop, taken from the device config
#[derive(Debug, Clone, Copy)]
pub struct MonitorTimings {
    /// Event poll interval inside the loop
    pub poll_interval: Duration,
    /// How long `start` waits for the thread to report running
    pub start_timeout: Duration,
    /// How long `stop` waits for the thread to exit
    pub stop_timeout: Duration,
}

struct MonitorShared {
    state: Mutex<RunState>,
    cond: Condvar,
}

/// The bus monitor
///
/// One long-lived background thread per instance; attach and power
/// notifications execute as loop callbacks, serialized on that thread.
pub struct BusMonitor {
    bus: Arc<dyn Bus>,
    registry: DeviceRegistry,
    observer: Arc<dyn PowerObserver>,
    timings: MonitorTimings,
    shared: Arc<MonitorShared>,
    control: Mutex<Option<MonitorHandle>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BusMonitor {
    pub fn new(
        bus: Arc<dyn Bus>,
        registry: DeviceRegistry,
        observer: Arc<dyn PowerObserver>,
        timings: MonitorTimings,
    ) -> Self {
        BusMonitor {
            bus,
            registry,
            observer,
            timings,
            shared: Arc::new(MonitorShared {
                state: Mutex::new(RunState::Stopped),
                cond: Condvar::new(),
            }),
            control: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> RunState {
        *self.shared.state.lock().expect("monitor state lock poisoned")
    }

    /// Whether the event loop is up
    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    /// Spawn the event-loop thread and wait until it reports running
    ///
    /// Idempotent while running. The thread enumerates the bus before
    /// reporting running, so on success the registry already holds every
    /// device present at subscription time.
    pub fn start(&self) -> Result<(), MonitorError> {
        {
            let mut state = self.shared.state.lock().expect("monitor state lock poisoned");
            match *state {
                RunState::Running => return Ok(()),
                RunState::Stopped => *state = RunState::Starting,
                other => return Err(MonitorError::Busy(other)),
            }
        }

        let (handle, worker) = create_monitor_bridge();
        *self.control.lock().expect("monitor control lock poisoned") = Some(handle);

        let bus = Arc::clone(&self.bus);
        let registry = self.registry.clone();
        let observer = Arc::clone(&self.observer);
        let shared = Arc::clone(&self.shared);
        let poll_interval = self.timings.poll_interval;

        let join = match std::thread::Builder::new()
            .name("bus-monitor".to_string())
            .spawn(move || run_event_loop(bus, registry, observer, worker, shared, poll_interval))
        {
            Ok(join) => join,
            Err(e) => {
                *self.shared.state.lock().expect("monitor state lock poisoned") =
                    RunState::Stopped;
                return Err(MonitorError::Channel(format!("failed to spawn thread: {e}")));
            }
        };
        *self.thread.lock().expect("monitor thread lock poisoned") = Some(join);

        let state = self.shared.state.lock().expect("monitor state lock poisoned");
        let (state, timed_out) = self
            .shared
            .cond
            .wait_timeout_while(state, self.timings.start_timeout, |s| {
                *s != RunState::Running && *s != RunState::Stopped
            })
            .expect("monitor state lock poisoned");

        if timed_out.timed_out() || *state != RunState::Running {
            drop(state);
            // Thread never came up (or died during enumeration); reel it in.
            self.shutdown_thread();
            return Err(MonitorError::StartTimeout(self.timings.start_timeout));
        }

        info!("Bus monitor running");
        Ok(())
    }

    /// Ask the event loop to exit and wait until it does
    pub fn stop(&self) -> Result<(), MonitorError> {
        {
            let mut state = self.shared.state.lock().expect("monitor state lock poisoned");
            match *state {
                RunState::Stopped => return Ok(()),
                RunState::Running => *state = RunState::Stopping,
                other => return Err(MonitorError::Busy(other)),
            }
        }

        if let Some(handle) = self.control.lock().expect("monitor control lock poisoned").take() {
            handle
                .send_command(MonitorCommand::Shutdown)
                .map_err(|e| MonitorError::Channel(e.to_string()))?;
        }

        let state = self.shared.state.lock().expect("monitor state lock poisoned");
        let (state, timed_out) = self
            .shared
            .cond
            .wait_timeout_while(state, self.timings.stop_timeout, |s| *s != RunState::Stopped)
            .expect("monitor state lock poisoned");

        if timed_out.timed_out() || *state != RunState::Stopped {
            return Err(MonitorError::StopTimeout(self.timings.stop_timeout));
        }
        drop(state);

        self.join_thread();
        info!("Bus monitor stopped");
        Ok(())
    }

    fn shutdown_thread(&self) {
        if let Some(handle) = self.control.lock().expect("monitor control lock poisoned").take() {
            let _ = handle.send_command(MonitorCommand::Shutdown);
        }
        self.join_thread();
        *self.shared.state.lock().expect("monitor state lock poisoned") = RunState::Stopped;
    }

    fn join_thread(&self) {
        if let Some(join) = self.thread.lock().expect("monitor thread lock poisoned").take()
            && join.join().is_err()
        {
            warn!("Bus monitor thread panicked");
        }
    }
}

impl Drop for BusMonitor {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

/// Body of the monitor thread
fn run_event_loop(
    bus: Arc<dyn Bus>,
    registry: DeviceRegistry,
    observer: Arc<dyn PowerObserver>,
    worker: common::MonitorWorker,
    shared: Arc<MonitorShared>,
    poll_interval: Duration,
) {
    debug!("Bus monitor thread started");

    // Pick up devices already on the bus before reporting running.
    match bus.enumerate() {
        Ok(devices) => {
            for (guid, handle) in devices {
                registry.upsert(guid, handle);
            }
            debug!("Enumerated {} devices", registry.len());
        }
        Err(e) => warn!("Initial device enumeration failed: {}", e),
    }

    {
        let mut state = shared.state.lock().expect("monitor state lock poisoned");
        *state = RunState::Running;
        shared.cond.notify_all();
    }

    loop {
        match worker.try_recv_command() {
            Some(MonitorCommand::Shutdown) => {
                debug!("Bus monitor shutting down");
                break;
            }
            None => {}
        }

        match bus.poll_event(poll_interval) {
            Ok(Some(BusPoll::DeviceMatched { guid, handle })) => {
                registry.upsert(guid, handle);
            }
            Ok(Some(BusPoll::Power(message))) => {
                debug!("Power notification: {:?}", message);
                observer.on_power_message(message);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Error polling bus events: {}", e);
                // Transient poll errors must not kill the loop.
                std::thread::sleep(poll_interval);
            }
        }
    }

    let mut state = shared.state.lock().expect("monitor state lock poisoned");
    *state = RunState::Stopped;
    shared.cond.notify_all();
    debug!("Bus monitor thread stopped");
}

//! No-data watchdog
//!
//! The receiver fires a no-data callback whenever a whole timeout period
//! passes without a packet. Isolated timeouts happen (channel changes,
//! weak signal); a run of them at short intervals means the stream is dead
//! and the bus needs a reset. This is a heuristic escalation policy, not a
//! real-time guarantee.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

/// Decision returned for each no-data event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogVerdict {
    /// Silence noted; carries the consecutive-event count so far
    Silence(u32),
    /// Silence has persisted long enough; reset the bus
    TriggerReset,
}

struct WatchdogState {
    last_event: Option<Instant>,
    consecutive: u32,
}

/// Tracks consecutive no-data timeouts and decides when to escalate
pub struct NoDataWatchdog {
    timeout: Duration,
    reset_timeout: Duration,
    state: Mutex<WatchdogState>,
}

impl NoDataWatchdog {
    /// `timeout` is the receiver's no-data period; `reset_timeout` is the
    /// span of continuous silence that warrants a bus reset.
    pub fn new(timeout: Duration, reset_timeout: Duration) -> Self {
        NoDataWatchdog {
            timeout,
            reset_timeout,
            state: Mutex::new(WatchdogState {
                last_event: None,
                consecutive: 0,
            }),
        }
    }

    /// Record a no-data event and decide whether to escalate
    pub fn on_no_data(&self) -> WatchdogVerdict {
        self.observe(Instant::now())
    }

    /// Clock-injected core so tests control elapsed time
    fn observe(&self, now: Instant) -> WatchdogVerdict {
        let mut state = self.state.lock().expect("watchdog lock poisoned");

        // "Recent" means within 1.5x the timeout period of the previous event.
        let recent_window = self.timeout + self.timeout / 2;
        state.consecutive = match state.last_event {
            Some(last) if now.duration_since(last) <= recent_window => state.consecutive + 1,
            _ => 1,
        };
        state.last_event = Some(now);

        warn!(
            "No input in {} ms",
            state.consecutive as u128 * self.timeout.as_millis()
        );

        let limit = (self.reset_timeout.as_millis() / self.timeout.as_millis().max(1)) as u32;
        if state.consecutive > limit {
            state.last_event = None;
            state.consecutive = 0;
            WatchdogVerdict::TriggerReset
        } else {
            WatchdogVerdict::Silence(state.consecutive)
        }
    }

    /// Consecutive-timeout count (test hook)
    #[cfg(test)]
    fn consecutive(&self) -> u32 {
        self.state.lock().unwrap().consecutive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(300);
    const RESET: Duration = Duration::from_millis(1500);

    #[test]
    fn test_consecutive_count_increases_on_recent_events() {
        let dog = NoDataWatchdog::new(TIMEOUT, RESET);
        let t0 = Instant::now();

        assert_eq!(dog.observe(t0), WatchdogVerdict::Silence(1));
        assert_eq!(dog.observe(t0 + TIMEOUT), WatchdogVerdict::Silence(2));
        assert_eq!(dog.observe(t0 + TIMEOUT * 2), WatchdogVerdict::Silence(3));
    }

    #[test]
    fn test_stale_event_resets_count_to_one() {
        let dog = NoDataWatchdog::new(TIMEOUT, RESET);
        let t0 = Instant::now();

        dog.observe(t0);
        dog.observe(t0 + TIMEOUT);
        assert_eq!(dog.consecutive(), 2);

        // more than 1.5x the period since the previous event
        let verdict = dog.observe(t0 + TIMEOUT + TIMEOUT * 2);
        assert_eq!(verdict, WatchdogVerdict::Silence(1));
    }

    #[test]
    fn test_boundary_is_recent() {
        let dog = NoDataWatchdog::new(TIMEOUT, RESET);
        let t0 = Instant::now();

        dog.observe(t0);
        // exactly 1.5x the period still counts as recent
        assert_eq!(
            dog.observe(t0 + TIMEOUT + TIMEOUT / 2),
            WatchdogVerdict::Silence(2)
        );
    }

    #[test]
    fn test_sustained_silence_triggers_reset() {
        let dog = NoDataWatchdog::new(TIMEOUT, RESET);
        let t0 = Instant::now();

        // limit = 1500/300 = 5 consecutive events; the sixth escalates
        let mut verdict = dog.observe(t0);
        for i in 1..=5 {
            verdict = dog.observe(t0 + TIMEOUT * i);
        }
        assert_eq!(verdict, WatchdogVerdict::TriggerReset);
        // counter starts over after escalation
        assert_eq!(dog.consecutive(), 0);
        assert_eq!(dog.observe(t0 + TIMEOUT * 6), WatchdogVerdict::Silence(1));
    }
}

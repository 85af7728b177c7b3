/// Output-inactivity monitor for a running child process.
///
/// Both drain tasks call [`Watchdog::touch`] for every captured line and the
/// runner's poll loop calls [`Watchdog::check`]. The timestamp and the expiry
/// flag live behind one mutex, so a line arriving at the instant the poll
/// loop declares a hang is either counted before the check or lands after
/// expiry has latched. The lock is never held across an await.
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Liveness {
    last_output: Instant,
    expired: bool,
}

#[derive(Debug)]
pub struct Watchdog {
    timeout: Duration,
    state: Mutex<Liveness>,
}

impl Watchdog {
    /// Start the clock now with the given inactivity threshold.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(Liveness {
                last_output: Instant::now(),
                expired: false,
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record fresh output. Returns `false` if the watchdog already fired,
    /// in which case the clock is left alone.
    pub fn touch(&self) -> bool {
        let mut state = self.lock();
        if state.expired {
            return false;
        }
        state.last_output = Instant::now();
        true
    }

    /// Returns `true` once no output has been seen for longer than the
    /// timeout. Expiry latches: every later call also returns `true`.
    pub fn check(&self) -> bool {
        let mut state = self.lock();
        if !state.expired && state.last_output.elapsed() > self.timeout {
            state.expired = true;
            tracing::debug!(
                timeout_ms = self.timeout.as_millis() as u64,
                "no output within inactivity timeout"
            );
        }
        state.expired
    }

    /// Time since the last captured line.
    pub fn idle_for(&self) -> Duration {
        self.lock().last_output.elapsed()
    }

    fn lock(&self) -> MutexGuard<'_, Liveness> {
        // The critical sections cannot panic, but a poisoned lock still
        // holds a valid timestamp.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

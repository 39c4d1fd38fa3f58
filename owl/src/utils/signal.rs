use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Shutdown flag shared between a component and its background threads.
/// Unlike a bare `AtomicBool` a waiting thread is woken as soon as the
/// signal is raised, so long polling intervals do not delay shutdown.
#[derive(Debug, Default)]
pub struct StopSignal {
    /// Raised once, never lowered.
    stopped: Mutex<bool>,
    /// Woken on every raise.
    wake: Condvar,
}

impl StopSignal {
    /// Create a new signal that has not been raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal and wake every waiting thread.
    pub fn stop(&self) {
        let mut stopped = self.stopped.lock();
        *stopped = true;
        self.wake.notify_all();
    }

    /// True once `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep for `timeout`, returning early if the signal is raised.
    /// Returns true when the signal has been raised.
    ///
    /// * `timeout`: longest time to wait.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.wake.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

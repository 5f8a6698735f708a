//! Auto-reset events: the only way the mutator and the recycler's background
//! threads wait for each other.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A binary signal that releases exactly one waiter and then resets itself.
/// A `set` with nobody waiting is remembered until the next `wait`.
#[derive(Default)]
pub struct AutoResetEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl AutoResetEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.cond.notify_one();
    }

    /// Clear a pending signal without waiting.
    pub fn reset(&self) {
        *self.signaled.lock().unwrap() = false;
    }

    /// Wait until the event is set, or until `timeout` passes. `None` waits
    /// forever. Returns false on timeout, in which case the event is untouched.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut signaled = self.signaled.lock().unwrap();
        match timeout {
            None => {
                while !*signaled {
                    signaled = self.cond.wait(signaled).unwrap();
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*signaled {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    signaled = self.cond.wait_timeout(signaled, deadline - now).unwrap().0;
                }
            }
        }
        *signaled = false;
        true
    }

    pub fn is_set(&self) -> bool {
        *self.signaled.lock().unwrap()
    }
}

//! # Shutdown Latch
//!
//! A one-way boolean latch with condvar-based waiting. One instance is
//! shared across a whole torrent session for cooperative shutdown; the
//! periodic components (meter, announcers) each own a private instance to
//! stop their timer thread promptly instead of sleeping out the interval.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Shutdown {
    state: Mutex<bool>,
    signal: Condvar,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown::default()
    }

    /// Latch the flag and wake all waiters. Idempotent.
    pub fn trigger(&self) {
        let mut state = self.state.lock().unwrap();
        *state = true;
        self.signal.notify_all();
    }

    /// Whether the flag has been latched.
    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }

    /// Sleep up to `timeout`, waking early on trigger. Returns `is_set`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        if *state {
            return true;
        }
        let (state, _) = self.signal.wait_timeout(state, timeout).unwrap();
        *state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn trigger_wakes_waiters_early() {
        let latch = Arc::new(Shutdown::new());
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait_timeout(Duration::from_secs(30)))
        };
        thread::sleep(Duration::from_millis(20));
        latch.trigger();
        assert!(waiter.join().unwrap());
        assert!(latch.is_set());
    }

    #[test]
    fn wait_times_out_when_not_triggered() {
        let latch = Shutdown::new();
        assert!(!latch.wait_timeout(Duration::from_millis(10)));
    }
}

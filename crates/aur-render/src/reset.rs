//! Reset handshake between control and audio threads
//!
//! The control thread requests a reset and waits; the next audio block
//! observes the request, releases every reference in its live lists, stores
//! the acknowledge state, and returns silence until the control thread
//! finishes its cleanup. The audio side never blocks and never waits.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Handshake states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResetState {
    Normal = 0,
    Requested = 1,
    Acknowledged = 2,
}

impl ResetState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Requested,
            2 => Self::Acknowledged,
            _ => Self::Normal,
        }
    }
}

/// Shared three-state reset flag with a control-side wait
pub struct ResetHandshake {
    state: AtomicU8,
    lock: Mutex<()>,
    cv: Condvar,
}

impl ResetHandshake {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ResetState::Normal as u8),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub fn state(&self) -> ResetState {
        ResetState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Control thread: ask the audio thread to drop its live data
    pub fn request(&self) {
        self.state
            .store(ResetState::Requested as u8, Ordering::Release);
    }

    /// Audio thread: live data dropped, reset observed
    pub fn acknowledge(&self) {
        self.state
            .store(ResetState::Acknowledged as u8, Ordering::Release);
    }

    /// Control thread: cleanup done, resume normal operation
    pub fn finish(&self) {
        self.state.store(ResetState::Normal as u8, Ordering::Release);
    }

    /// Control thread: wait until the audio thread acknowledged
    ///
    /// The audio side only stores the state, so this wakes up on a short
    /// timeout and re-checks rather than expecting a notification.
    pub fn wait_acknowledged(&self) {
        let mut guard = self.lock.lock();
        while self.state() != ResetState::Acknowledged {
            self.cv
                .wait_for(&mut guard, Duration::from_millis(10));
        }
    }
}

impl Default for ResetHandshake {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_state_cycle() {
        let h = ResetHandshake::new();
        assert_eq!(h.state(), ResetState::Normal);
        h.request();
        assert_eq!(h.state(), ResetState::Requested);
        h.acknowledge();
        assert_eq!(h.state(), ResetState::Acknowledged);
        h.finish();
        assert_eq!(h.state(), ResetState::Normal);
    }

    #[test]
    fn test_wait_sees_acknowledge_from_other_thread() {
        let h = Arc::new(ResetHandshake::new());
        h.request();

        let audio = Arc::clone(&h);
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(25));
            audio.acknowledge();
        });

        h.wait_acknowledged();
        assert_eq!(h.state(), ResetState::Acknowledged);
        worker.join().unwrap();
    }
}

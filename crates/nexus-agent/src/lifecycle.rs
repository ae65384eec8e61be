//! Process-wide lifecycle state
//!
//! A single atomic gates every request and coordinates shutdown between the
//! dispatcher, the pipe server and the loader thread. Transitions go
//! through compare-exchange so a detach request races cleanly with normal
//! teardown.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BridgeState {
    Initializing = 0,
    Running = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl BridgeState {
    fn from_raw(value: u8) -> Self {
        match value {
            1 => BridgeState::Running,
            2 => BridgeState::ShuttingDown,
            3 => BridgeState::Stopped,
            _ => BridgeState::Initializing,
        }
    }
}

pub struct Lifecycle {
    state: AtomicU8,
    shutdown_lock: Mutex<()>,
    shutdown_signal: Condvar,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(BridgeState::Initializing as u8),
            shutdown_lock: Mutex::new(()),
            shutdown_signal: Condvar::new(),
        }
    }

    pub fn state(&self) -> BridgeState {
        BridgeState::from_raw(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == BridgeState::Running
    }

    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self.state(),
            BridgeState::ShuttingDown | BridgeState::Stopped
        )
    }

    /// Initializing -> Running. Returns false when the state had already
    /// moved on (e.g. a detach raced initialization).
    pub fn mark_running(&self) -> bool {
        self.state
            .compare_exchange(
                BridgeState::Initializing as u8,
                BridgeState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Running -> ShuttingDown, waking anyone in `wait_for_shutdown`.
    pub fn request_shutdown(&self) -> bool {
        let transitioned = self
            .state
            .compare_exchange(
                BridgeState::Running as u8,
                BridgeState::ShuttingDown as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if transitioned {
            self.shutdown_signal.notify_all();
        }
        transitioned
    }

    pub fn mark_stopped(&self) {
        self.state
            .store(BridgeState::Stopped as u8, Ordering::SeqCst);
        self.shutdown_signal.notify_all();
    }

    /// Block until a shutdown is requested. The periodic wake keeps the
    /// loader responsive even if a notification is lost to a race.
    pub fn wait_for_shutdown(&self) {
        let mut guard = self.shutdown_lock.lock();
        while !self.is_shutting_down() {
            self.shutdown_signal
                .wait_for(&mut guard, Duration::from_millis(100));
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_initial_state() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), BridgeState::Initializing);
        assert!(!lifecycle.is_running());
        assert!(!lifecycle.is_shutting_down());
    }

    #[test]
    fn test_running_transition() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.mark_running());
        assert!(lifecycle.is_running());
        // Second attempt is a no-op.
        assert!(!lifecycle.mark_running());
    }

    #[test]
    fn test_shutdown_only_from_running() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.request_shutdown());
        lifecycle.mark_running();
        assert!(lifecycle.request_shutdown());
        assert!(lifecycle.is_shutting_down());
        // Idempotent once shutting down.
        assert!(!lifecycle.request_shutdown());
    }

    #[test]
    fn test_wait_for_shutdown_wakes() {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.mark_running();

        let waiter = {
            let lifecycle = Arc::clone(&lifecycle);
            std::thread::spawn(move || lifecycle.wait_for_shutdown())
        };

        std::thread::sleep(Duration::from_millis(20));
        lifecycle.request_shutdown();
        waiter.join().unwrap();
        assert!(lifecycle.is_shutting_down());
    }
}

//! Thread-affine pending-call queue
//!
//! The host's native code assumes its own render thread, so workers never
//! invoke registered functions directly. A worker packages the call into a
//! `PendingCall` and blocks on a one-shot channel; the frame-hook
//! collaborator drains the queue once per host tick on the host thread.
//!
//! The deadline is enforced twice: at drain entry, overdue calls resolve to
//! Timeout without executing; at the worker side, the channel wait gives up
//! after the same interval even when the drain never runs.

use crate::marshal::CallOutcome;
use nexus_common::{debug, error, Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::time::{Duration, Instant};

/// Work queued for the host thread.
pub type Invoker = Box<dyn FnOnce() -> Result<CallOutcome> + Send>;

struct PendingCall {
    invoker: Invoker,
    deadline: Instant,
    result_tx: SyncSender<Result<CallOutcome>>,
}

pub struct CallQueue {
    queue: Mutex<VecDeque<PendingCall>>,
    timeout: Duration,
}

impl CallQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            timeout,
        }
    }

    /// Submit a call and block until the host thread resolves it or the
    /// deadline passes.
    pub fn call(&self, invoker: Invoker) -> Result<CallOutcome> {
        let (result_tx, result_rx) = sync_channel(1);

        {
            let mut queue = self.queue.lock();
            let now = Instant::now();

            // Resolve expired heads so an idle host thread cannot grow the
            // queue without bound.
            while queue.front().is_some_and(|c| c.deadline < now) {
                if let Some(expired) = queue.pop_front() {
                    let _ = expired.result_tx.send(Err(Error::Timeout(
                        "Pending call expired before the host thread ran".into(),
                    )));
                }
            }

            queue.push_back(PendingCall {
                invoker,
                deadline: now + self.timeout,
                result_tx,
            });
        }

        match result_rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout(
                "Host thread did not drain the call in time".into(),
            )),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Internal("Pending call dropped unresolved".into()))
            }
        }
    }

    /// Execute everything queued. Must run on the host thread; invoked by
    /// the frame-hook collaborator once per tick.
    pub fn drain(&self) {
        let drained: Vec<PendingCall> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }

        let now = Instant::now();
        for call in drained {
            if call.deadline < now {
                let _ = call.result_tx.send(Err(Error::Timeout(
                    "Pending call expired before the host thread ran".into(),
                )));
                continue;
            }

            let result = match catch_unwind(AssertUnwindSafe(call.invoker)) {
                Ok(result) => result,
                Err(_) => {
                    error!(target: "nexus_core::pending", "Panic inside a queued call");
                    Err(Error::Internal("Panic inside a queued call".into()))
                }
            };
            let _ = call.result_tx.send(result);
        }
    }

    /// Resolve everything with failure. Part of shutdown teardown so no
    /// worker is left blocking on a queue nobody will drain.
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<PendingCall> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        if !drained.is_empty() {
            debug!(target: "nexus_core::pending", count = drained.len(), "Failing pending calls");
        }
        for call in drained {
            let _ = call.result_tx.send(Err(Error::Internal(reason.into())));
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn outcome(value: usize) -> Result<CallOutcome> {
        Ok(CallOutcome {
            has_return: true,
            value,
        })
    }

    #[test]
    fn test_drain_resolves_waiting_caller() {
        let queue = Arc::new(CallQueue::new(Duration::from_secs(5)));

        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.call(Box::new(|| outcome(42))))
        };

        // Wait until the call is queued, then drain as "the host thread".
        while queue.is_empty() {
            thread::yield_now();
        }
        queue.drain();

        let result = waiter.join().unwrap().unwrap();
        assert_eq!(result.value, 42);
        assert!(result.has_return);
    }

    #[test]
    fn test_worker_times_out_without_drain() {
        let queue = CallQueue::new(Duration::from_millis(50));
        let started = Instant::now();
        let err = queue.call(Box::new(|| outcome(0))).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_overdue_call_not_executed_at_drain() {
        let queue = Arc::new(CallQueue::new(Duration::from_millis(20)));
        let executed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let waiter = {
            let queue = Arc::clone(&queue);
            let executed = Arc::clone(&executed);
            thread::spawn(move || {
                queue.call(Box::new(move || {
                    executed.store(true, std::sync::atomic::Ordering::SeqCst);
                    outcome(1)
                }))
            })
        };

        while queue.is_empty() {
            thread::yield_now();
        }
        // Let the deadline lapse before draining.
        thread::sleep(Duration::from_millis(60));
        queue.drain();

        assert!(waiter.join().unwrap().is_err());
        assert!(!executed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_panic_in_invoker_becomes_internal_error() {
        let queue = Arc::new(CallQueue::new(Duration::from_secs(5)));

        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.call(Box::new(|| panic!("boom"))))
        };

        while queue.is_empty() {
            thread::yield_now();
        }
        queue.drain();

        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_fail_all_unblocks_waiters() {
        let queue = Arc::new(CallQueue::new(Duration::from_secs(5)));

        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.call(Box::new(|| outcome(0))))
        };

        while queue.is_empty() {
            thread::yield_now();
        }
        queue.fail_all("shutting down");

        let err = waiter.join().unwrap().unwrap_err();
        assert!(err.to_string().contains("shutting down"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_preserves_submission_order() {
        let queue = Arc::new(CallQueue::new(Duration::from_secs(5)));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut waiters = Vec::new();
        for i in 0..4usize {
            let queue_clone = Arc::clone(&queue);
            let order = Arc::clone(&order);
            waiters.push(thread::spawn(move || {
                queue_clone.call(Box::new(move || {
                    order.lock().push(i);
                    outcome(i)
                }))
            }));
            // Serialize submission so the expected order is deterministic.
            while queue.len() != i + 1 {
                thread::yield_now();
            }
        }

        queue.drain();
        for waiter in waiters {
            waiter.join().unwrap().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }
}

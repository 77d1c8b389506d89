//! The individual timeout slot and the per-tick bucket that holds them.
//!
//! Buckets are touched only by the timer worker thread, so they need no
//! atomics of their own; the [`Timeout`] itself is shared with callers
//! through a [`super::TimeoutHandle`] and so carries the atomics needed for
//! cross-thread cancellation.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use super::Shared;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TimeoutState {
    Init = 0,
    Cancelled = 1,
    Expired = 2,
}

pub(super) struct Timeout {
    pub(super) owner: Arc<Shared>,
    pub(super) deadline_nanos: u64,
    pub(super) state: AtomicU8,
    pub(super) remaining_rounds: AtomicI64,
    /// 0 means "not yet placed in a bucket"; otherwise `index + 1`, so the
    /// all-zero initial value is distinguishable from bucket 0.
    pub(super) bucket_index: AtomicU64,
    task: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Timeout {
    pub(super) fn new<F>(owner: Arc<Shared>, deadline_nanos: u64, task: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            owner,
            deadline_nanos,
            state: AtomicU8::new(TimeoutState::Init as u8),
            remaining_rounds: AtomicI64::new(0),
            bucket_index: AtomicU64::new(0),
            task: Mutex::new(Some(Box::new(task))),
        }
    }

    /// CAS `Init -> Cancelled`. `true` iff this call won the race.
    pub(super) fn try_cancel(&self) -> bool {
        self.state
            .compare_exchange(
                TimeoutState::Init as u8,
                TimeoutState::Cancelled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// CAS `Init -> Expired`, called only from the worker thread.
    pub(super) fn try_expire(&self) -> bool {
        self.state
            .compare_exchange(
                TimeoutState::Init as u8,
                TimeoutState::Expired as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Run the task exactly once. Panics inside the task are caught and
    /// logged, never propagated to the worker thread.
    pub(super) fn run_task(&self) {
        let task = self.task.lock().unwrap().take();
        let Some(task) = task else { return };
        if std::panic::catch_unwind(AssertUnwindSafe(move || task())).is_err() {
            log::warn!("corenet-timer: a submitted task panicked during execution");
        }
    }
}

/// A doubly-linked... in spirit: an owned list of the timeouts currently
/// slotted into one wheel position. Mutated only by the timer worker.
pub(super) struct WheelBucket {
    items: VecDeque<Arc<Timeout>>,
}

impl WheelBucket {
    pub(super) fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    pub(super) fn push_back(&mut self, timeout: Arc<Timeout>) {
        self.items.push_back(timeout);
    }

    /// Remove `timeout` from this bucket by identity, if still present
    /// (it may have already expired and been taken out).
    pub(super) fn remove(&mut self, timeout: &Arc<Timeout>) {
        if let Some(pos) = self.items.iter().position(|t| Arc::ptr_eq(t, timeout)) {
            self.items.remove(pos);
        }
    }

    /// Hand over the whole list, leaving the bucket empty. The caller
    /// re-`push_back`s whatever survives this tick's expiry pass.
    pub(super) fn take_all(&mut self) -> VecDeque<Arc<Timeout>> {
        std::mem::take(&mut self.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn dummy_shared() -> Arc<Shared> {
        use crate::config::TimerConfig;
        Arc::new(Shared {
            mask: 7,
            wheel_len: 8,
            tick_duration: Duration::from_millis(1),
            worker_state: AtomicU8::new(0),
            wake: super::super::WakeSignal::new(),
            handoff: super::super::WorkerHandoff::new(),
            timeouts: crate::queue::MpscQueue::new(),
            cancelled: crate::queue::MpscQueue::new(),
            pending: AtomicI64::new(0),
            max_pending: 0,
            config: TimerConfig {
                tick_duration: Duration::from_millis(1),
                ticks_per_wheel: 8,
                max_pending_timeouts: 0,
                max_instances: 0,
            },
        })
    }

    #[test]
    fn cancel_then_expire_only_the_first_wins() {
        let t = Arc::new(Timeout::new(dummy_shared(), 0, || {}));
        assert!(t.try_cancel());
        assert!(!t.try_expire());
        assert!(!t.try_cancel());
    }

    #[test]
    fn run_task_executes_exactly_once() {
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        let t = Timeout::new(dummy_shared(), 0, move || r.store(true, Ordering::SeqCst));
        t.run_task();
        assert!(ran.load(Ordering::SeqCst));
        // Second call is a no-op: the task was already taken.
        t.run_task();
    }

    #[test]
    fn bucket_remove_is_identity_based() {
        let mut bucket = WheelBucket::new();
        let a = Arc::new(Timeout::new(dummy_shared(), 0, || {}));
        let b = Arc::new(Timeout::new(dummy_shared(), 0, || {}));
        bucket.push_back(Arc::clone(&a));
        bucket.push_back(Arc::clone(&b));
        bucket.remove(&a);
        let remaining = bucket.take_all();
        assert_eq!(remaining.len(), 1);
        assert!(Arc::ptr_eq(&remaining[0], &b));
    }
}

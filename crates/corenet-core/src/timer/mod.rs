//! Hashed-wheel timer: an O(1) amortized scheduler for one-shot timeouts.
//!
//! Modeled after Netty's `HashedWheelTimer`. A dedicated worker thread
//! advances by fixed `tick_duration` steps; each tick inspects exactly one
//! wheel bucket, so the cost of holding N outstanding timeouts is independent
//! of N at submission time and amortized O(1) per tick at expiry time.
//!
//! Submission and cancellation cross threads through the same
//! [`crate::queue::MpscQueue`] used everywhere else in this crate; the wheel
//! buckets themselves are touched only by the worker thread, so they need no
//! synchronization of their own.

mod wheel;

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::TimerConfig;
use crate::error::{CoreError, CoreResult};
use crate::queue::MpscQueue;

use wheel::{Timeout, TimeoutState, WheelBucket};

const MAX_PENDING_TIMEOUTS_PER_TICK: usize = 100_000;

fn instance_counter() -> &'static AtomicU64 {
    static COUNTER: OnceLock<AtomicU64> = OnceLock::new();
    COUNTER.get_or_init(|| AtomicU64::new(0))
}

const WORKER_INIT: u8 = 0;
const WORKER_STARTED: u8 = 1;
const WORKER_SHUTDOWN: u8 = 2;

/// A handle to a submitted, possibly-already-fired timeout.
///
/// Cloning shares the same underlying slot; every clone observes the same
/// cancel/expire transitions.
#[derive(Clone)]
pub struct TimeoutHandle {
    inner: Arc<Timeout>,
}

impl TimeoutHandle {
    /// Attempt to cancel before the timeout fires. Returns `true` iff this
    /// call won the race against expiry (or a previous cancel).
    pub fn cancel(&self) -> bool {
        if self.inner.try_cancel() {
            self.inner.owner.cancelled.enqueue(Arc::clone(&self.inner));
            true
        } else {
            false
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == TimeoutState::Cancelled as u8
    }

    pub fn is_expired(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == TimeoutState::Expired as u8
    }
}

impl std::fmt::Debug for TimeoutHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutHandle")
            .field("deadline_nanos", &self.inner.deadline_nanos)
            .field("state", &self.inner.state.load(Ordering::Acquire))
            .finish()
    }
}

struct WorkerHandoff {
    start_time: Mutex<Option<Instant>>,
    ready: Condvar,
}

impl WorkerHandoff {
    fn new() -> Self {
        Self {
            start_time: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn publish(&self, at: Instant) {
        let mut guard = self.start_time.lock().unwrap();
        *guard = Some(at);
        self.ready.notify_all();
    }

    fn wait(&self) -> Instant {
        let mut guard = self.start_time.lock().unwrap();
        while guard.is_none() {
            guard = self.ready.wait(guard).unwrap();
        }
        guard.unwrap()
    }
}

struct WakeSignal {
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl WakeSignal {
    fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    fn wake(&self) {
        let _guard = self.mutex.lock().unwrap();
        self.condvar.notify_all();
    }

    fn sleep_until(&self, target: Instant) {
        let guard = self.mutex.lock().unwrap();
        let now = Instant::now();
        if target > now {
            let _ = self.condvar.wait_timeout(guard, target - now).unwrap();
        }
    }
}

/// One-way diagnostic snapshot of a timer's configuration and current
/// load, for human/JSON inspection only — never deserialized, never part
/// of the timer's control-flow contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimerSnapshot {
    pub wheel_len: u64,
    pub tick_duration_millis: u64,
    pub pending_timeouts: i64,
    pub max_pending_timeouts: i64,
    pub worker_started: bool,
}

/// An O(1) amortized one-shot timeout scheduler backed by a dedicated
/// worker thread.
pub struct HashedWheelTimer {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    mask: u64,
    wheel_len: u64,
    tick_duration: Duration,
    worker_state: AtomicU8,
    wake: WakeSignal,
    handoff: WorkerHandoff,
    timeouts: MpscQueue<Arc<Timeout>>,
    cancelled: MpscQueue<Arc<Timeout>>,
    pending: AtomicI64,
    max_pending: i64,
    config: TimerConfig,
}

impl HashedWheelTimer {
    pub fn new() -> Self {
        Self::with_config(TimerConfig::default())
    }

    pub fn with_config(config: TimerConfig) -> Self {
        let wheel_len = config.ticks_per_wheel.next_power_of_two().max(1) as u64;
        let count = instance_counter().fetch_add(1, Ordering::Relaxed) + 1;
        if config.max_instances > 0 && count > config.max_instances {
            log::warn!(
                "HashedWheelTimer: {count} instances created, exceeding the configured cap of {}; \
                 a timer is meant to be shared across an application",
                config.max_instances
            );
        }
        log::info!(
            "HashedWheelTimer: tick_duration={:?} wheel_len={wheel_len}",
            config.tick_duration
        );
        Self {
            shared: Arc::new(Shared {
                mask: wheel_len - 1,
                wheel_len,
                tick_duration: config.tick_duration,
                worker_state: AtomicU8::new(WORKER_INIT),
                wake: WakeSignal::new(),
                handoff: WorkerHandoff::new(),
                timeouts: MpscQueue::new(),
                cancelled: MpscQueue::new(),
                pending: AtomicI64::new(0),
                max_pending: config.max_pending_timeouts,
                config,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Submit a one-shot timeout firing no earlier than `delay` from now.
    pub fn new_timeout<F>(&self, task: F, delay: Duration) -> CoreResult<TimeoutHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.worker_state.load(Ordering::Acquire) == WORKER_SHUTDOWN {
            return Err(CoreError::RejectedExecution {
                reason: "timer is shut down",
            });
        }
        if self.shared.max_pending > 0 {
            let pending = self.shared.pending.fetch_add(1, Ordering::AcqRel) + 1;
            if pending > self.shared.max_pending {
                self.shared.pending.fetch_sub(1, Ordering::AcqRel);
                return Err(CoreError::RejectedExecution {
                    reason: "timer has too many pending timeouts",
                });
            }
        }

        self.ensure_started();
        let start_time = self.shared.handoff.wait();

        let deadline_nanos = round_up_to_millis(
            (Instant::now().saturating_duration_since(start_time) + delay).as_nanos() as u64,
        );
        let timeout = Arc::new(Timeout::new(Arc::clone(&self.shared), deadline_nanos, task));
        self.shared.timeouts.enqueue(Arc::clone(&timeout));
        self.shared.wake.wake();
        Ok(TimeoutHandle { inner: timeout })
    }

    /// Stop the worker and return every timeout that had neither fired nor
    /// been cancelled.
    pub fn stop(&self) -> CoreResult<Vec<TimeoutHandle>> {
        if self.is_worker_thread() {
            return Err(CoreError::IllegalState {
                reason: "timer worker cannot stop itself from its own thread",
            });
        }
        self.shared
            .worker_state
            .store(WORKER_SHUTDOWN, Ordering::Release);
        self.shared.wake.wake();

        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        let mut unprocessed = Vec::new();
        while let Some(t) = self.shared.timeouts.dequeue() {
            if t.state.load(Ordering::Acquire) == TimeoutState::Init as u8 {
                unprocessed.push(TimeoutHandle { inner: t });
            }
        }
        Ok(unprocessed)
    }

    /// A point-in-time snapshot of this timer's configuration and load,
    /// for human or JSON inspection. Not part of the control-flow contract.
    pub fn diagnostics(&self) -> TimerSnapshot {
        TimerSnapshot {
            wheel_len: self.shared.wheel_len,
            tick_duration_millis: self.shared.tick_duration.as_millis() as u64,
            pending_timeouts: self.shared.pending.load(Ordering::Acquire),
            max_pending_timeouts: self.shared.max_pending,
            worker_started: self.shared.worker_state.load(Ordering::Acquire) == WORKER_STARTED,
        }
    }

    fn is_worker_thread(&self) -> bool {
        WORKER_THREAD.with(|slot| *slot.borrow() == Some(Arc::as_ptr(&self.shared) as usize))
    }

    fn ensure_started(&self) {
        if self
            .shared
            .worker_state
            .compare_exchange(
                WORKER_INIT,
                WORKER_STARTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name("corenet-timer".into())
                .spawn(move || run_worker(shared))
                .expect("failed to spawn timer worker thread");
            *self.worker.lock().unwrap() = Some(handle);
        }
    }
}

impl Default for HashedWheelTimer {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static WORKER_THREAD: std::cell::RefCell<Option<usize>> = const { std::cell::RefCell::new(None) };
}

fn round_up_to_millis(nanos: u64) -> u64 {
    const NANOS_PER_MILLI: u64 = 1_000_000;
    nanos.div_ceil(NANOS_PER_MILLI) * NANOS_PER_MILLI
}

fn run_worker(shared: Arc<Shared>) {
    WORKER_THREAD.with(|slot| *slot.borrow_mut() = Some(Arc::as_ptr(&shared) as usize));

    let start_time = Instant::now();
    shared.handoff.publish(start_time);
    log::info!("corenet-timer worker started");

    let mut buckets: Vec<WheelBucket> = (0..shared.wheel_len).map(|_| WheelBucket::new()).collect();
    let mut tick: u64 = 0;

    loop {
        let elapsed_nanos = shared.tick_duration.as_nanos() * (tick as u128 + 1);
        let target = start_time + Duration::from_nanos(elapsed_nanos.min(u64::MAX as u128) as u64);
        shared.wake.sleep_until(target);
        if shared.worker_state.load(Ordering::Acquire) == WORKER_SHUTDOWN {
            break;
        }

        process_cancellations(&shared, &mut buckets);
        transfer_to_buckets(&shared, &mut buckets, tick);

        let idx = (tick & shared.mask) as usize;
        expire(&shared, &mut buckets[idx], tick);

        tick += 1;
    }

    // Hand back everything still outstanding (neither fired nor cancelled)
    // so `stop()`, which only ever drains the submission queue, sees it.
    for bucket in &mut buckets {
        let mut remaining = bucket.take_all();
        while let Some(timeout) = remaining.pop_front() {
            if timeout.state.load(Ordering::Acquire) == TimeoutState::Init as u8 {
                shared.timeouts.enqueue(timeout);
            }
        }
    }

    log::info!("corenet-timer worker stopped at tick {tick}");
}

fn process_cancellations(shared: &Shared, buckets: &mut [WheelBucket]) {
    while let Some(timeout) = shared.cancelled.dequeue() {
        if shared.max_pending > 0 {
            shared.pending.fetch_sub(1, Ordering::AcqRel);
        }
        if let Some(bucket_index) = timeout.bucket_index.load(Ordering::Acquire).checked_sub(1) {
            buckets[bucket_index as usize].remove(&timeout);
        }
    }
}

fn transfer_to_buckets(shared: &Shared, buckets: &mut [WheelBucket], tick: u64) {
    for _ in 0..MAX_PENDING_TIMEOUTS_PER_TICK {
        let Some(timeout) = shared.timeouts.dequeue() else {
            break;
        };
        if timeout.state.load(Ordering::Acquire) == TimeoutState::Cancelled as u8 {
            if shared.max_pending > 0 {
                shared.pending.fetch_sub(1, Ordering::AcqRel);
            }
            continue;
        }
        let calculated = timeout.deadline_nanos / shared.tick_duration.as_nanos().max(1) as u64;
        let ticks = calculated.max(tick);
        let remaining_rounds = (ticks - tick) as i64 / shared.wheel_len as i64;
        timeout.remaining_rounds.store(remaining_rounds, Ordering::Release);
        let bucket_index = (ticks & shared.mask) as usize;
        timeout
            .bucket_index
            .store(bucket_index as u64 + 1, Ordering::Release);
        buckets[bucket_index].push_back(timeout);
    }
}

fn expire(shared: &Shared, bucket: &mut WheelBucket, tick: u64) {
    let current_deadline_nanos =
        (tick + 1) * shared.tick_duration.as_nanos().max(1) as u64;

    let mut cursor = bucket.take_all();
    while let Some(timeout) = cursor.pop_front() {
        let remaining = timeout.remaining_rounds.load(Ordering::Acquire);
        if remaining > 0 {
            timeout
                .remaining_rounds
                .store(remaining - 1, Ordering::Release);
            bucket.push_back(timeout);
            continue;
        }

        if timeout.deadline_nanos > current_deadline_nanos {
            panic!(
                "corenet-timer: timeout placed in bucket for tick {tick} but its deadline {} is still in the future",
                timeout.deadline_nanos
            );
        }

        if shared.max_pending > 0 {
            shared.pending.fetch_sub(1, Ordering::AcqRel);
        }

        if timeout.try_expire() {
            log::trace!("corenet-timer: firing timeout at tick {tick}");
            timeout.run_task();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn diagnostics_reports_wheel_shape_before_the_worker_starts() {
        let timer = HashedWheelTimer::with_config(TimerConfig {
            tick_duration: Duration::from_millis(5),
            ticks_per_wheel: 10,
            max_pending_timeouts: 4,
            max_instances: 0,
        });
        let snapshot = timer.diagnostics();
        assert_eq!(snapshot.wheel_len, 16);
        assert_eq!(snapshot.tick_duration_millis, 5);
        assert_eq!(snapshot.pending_timeouts, 0);
        assert_eq!(snapshot.max_pending_timeouts, 4);
        assert!(!snapshot.worker_started);
    }

    #[test]
    fn fires_in_deadline_order_not_submission_order() {
        let timer = HashedWheelTimer::with_config(TimerConfig {
            tick_duration: Duration::from_millis(1),
            ticks_per_wheel: 8,
            max_pending_timeouts: 0,
            max_instances: 0,
        });

        let (tx, rx) = mpsc::channel();
        let tx_a = tx.clone();
        let tx_b = tx.clone();
        let tx_c = tx.clone();
        timer
            .new_timeout(move || tx_a.send("A").unwrap(), Duration::from_millis(3))
            .unwrap();
        timer
            .new_timeout(move || tx_b.send("B").unwrap(), Duration::from_millis(2))
            .unwrap();
        timer
            .new_timeout(move || tx_c.send("C").unwrap(), Duration::from_millis(5))
            .unwrap();

        let order: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_millis(500)).unwrap())
            .collect();
        assert_eq!(order, vec!["B", "A", "C"]);
        timer.stop().unwrap();
    }

    #[test]
    fn cancel_before_deadline_prevents_firing() {
        let timer = HashedWheelTimer::with_config(TimerConfig {
            tick_duration: Duration::from_millis(1),
            ticks_per_wheel: 8,
            max_pending_timeouts: 0,
            max_instances: 0,
        });

        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let f = Arc::clone(&fired);
        let handle = timer
            .new_timeout(move || f.store(true, Ordering::SeqCst), Duration::from_millis(50))
            .unwrap();

        std::thread::sleep(Duration::from_millis(10));
        assert!(handle.cancel());
        std::thread::sleep(Duration::from_millis(60));

        assert!(!fired.load(Ordering::SeqCst));
        assert!(handle.is_cancelled());
        assert!(!handle.is_expired());

        let unprocessed = timer.stop().unwrap();
        assert!(unprocessed.iter().all(|h| !Arc::ptr_eq(&h.inner, &handle.inner)));
    }

    #[test]
    fn stop_returns_unprocessed_timeouts() {
        let timer = HashedWheelTimer::with_config(TimerConfig {
            tick_duration: Duration::from_millis(1),
            ticks_per_wheel: 8,
            max_pending_timeouts: 0,
            max_instances: 0,
        });
        timer
            .new_timeout(|| {}, Duration::from_secs(10))
            .unwrap();
        let unprocessed = timer.stop().unwrap();
        assert_eq!(unprocessed.len(), 1);
    }

    #[test]
    fn rejects_submissions_after_stop() {
        let timer = HashedWheelTimer::with_config(TimerConfig {
            tick_duration: Duration::from_millis(1),
            ticks_per_wheel: 8,
            max_pending_timeouts: 0,
            max_instances: 0,
        });
        timer.stop().unwrap();
        let err = timer.new_timeout(|| {}, Duration::from_millis(1)).unwrap_err();
        assert_eq!(
            err,
            CoreError::RejectedExecution {
                reason: "timer is shut down"
            }
        );
    }
}

//! Single-thread cooperative event loop.
//!
//! Every channel bound to one [`EventLoop`] has its callbacks run
//! exclusively on that loop's dedicated worker thread, so user code never
//! has to synchronize against itself. The loop drains an MPSC task queue
//! and a min-heap of scheduled tasks in a fixed order each iteration, and
//! sleeps on a wake signal in between.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::LoopConfig;
use crate::error::{CoreError, CoreResult};
use crate::queue::MpscQueue;

const NOT_STARTED: u8 = 0;
const STARTED: u8 = 1;
const SHUTTING_DOWN: u8 = 2;
const SHUTDOWN: u8 = 3;
const TERMINATED: u8 = 4;

type Task = Box<dyn FnOnce() + Send>;

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

struct ScheduledTaskInner {
    deadline: Instant,
    seq: u64,
    cancelled: AtomicBool,
    task: Mutex<Option<Task>>,
}

/// Orders by deadline ascending, ties broken by submission order; wrapped
/// so a plain [`BinaryHeap`] (a max-heap) behaves like a min-heap.
struct HeapEntry(Arc<ScheduledTaskInner>);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.deadline == other.0.deadline && self.0.seq == other.0.seq
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .0
            .deadline
            .cmp(&self.0.deadline)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

/// A cancel-handle for a task submitted through [`EventLoop::schedule`].
#[derive(Clone)]
pub struct ScheduledHandle {
    inner: Arc<ScheduledTaskInner>,
}

impl ScheduledHandle {
    /// Cancel this task if it has not yet been moved into the task queue.
    /// Returns `true` iff this call transitioned it from pending to
    /// cancelled; a no-op (returns `false`) if already dequeued or
    /// previously cancelled.
    pub fn cancel(&self) -> bool {
        self.inner
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TerminationStatus {
    Running,
    Terminated,
    Panicked,
}

struct TerminationLatch {
    mutex: Mutex<TerminationStatus>,
    condvar: Condvar,
}

impl TerminationLatch {
    fn new() -> Self {
        Self {
            mutex: Mutex::new(TerminationStatus::Running),
            condvar: Condvar::new(),
        }
    }

    fn signal(&self, status: TerminationStatus) {
        let mut guard = self.mutex.lock().unwrap();
        *guard = status;
        self.condvar.notify_all();
    }
}

/// A blocking handle to the event loop's eventual termination, returned by
/// [`EventLoop::shutdown_gracefully`] and [`EventLoop::termination`].
#[derive(Clone)]
pub struct Termination {
    latch: Arc<TerminationLatch>,
}

impl Termination {
    /// Block the calling thread until the loop has fully stopped.
    pub fn wait(&self) {
        let mut guard = self.latch.mutex.lock().unwrap();
        while *guard == TerminationStatus::Running {
            guard = self.latch.condvar.wait(guard).unwrap();
        }
    }

    /// Non-blocking snapshot of whether the loop has stopped.
    pub fn is_terminated(&self) -> bool {
        *self.latch.mutex.lock().unwrap() != TerminationStatus::Running
    }

    /// `true` if the loop stopped because of a structural bug (a `panic!`
    /// from the loop's own invariant checks) rather than a clean shutdown.
    pub fn panicked(&self) -> bool {
        *self.latch.mutex.lock().unwrap() == TerminationStatus::Panicked
    }
}

thread_local! {
    static OWNED_LOOPS: std::cell::RefCell<std::collections::HashSet<usize>> =
        std::cell::RefCell::new(std::collections::HashSet::new());
}

struct Shared {
    state: AtomicU8,
    wake: WakeSignal,
    task_queue: MpscQueue<Task>,
    scheduled: Mutex<BinaryHeap<HeapEntry>>,
    seq: AtomicU64,
    terminated: Arc<TerminationLatch>,
    quiet_period: Mutex<Option<Duration>>,
    quiet_deadline: Mutex<Option<Instant>>,
    shutdown_timeout: Mutex<Option<Instant>>,
    /// Last instant any task actually ran (or was accepted while shutting
    /// down). `shutting_down_step` compares this plus the quiet period
    /// against now, so fresh activity keeps pushing the quiet deadline out
    /// rather than letting it expire against a stale one-time snapshot.
    last_execution_time: Mutex<Instant>,
    config: LoopConfig,
}

/// A single-thread cooperative task/scheduler loop.
pub struct EventLoop {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self::with_config(LoopConfig::default())
    }

    pub fn with_config(config: LoopConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(NOT_STARTED),
                wake: WakeSignal::new(),
                task_queue: MpscQueue::new(),
                scheduled: Mutex::new(BinaryHeap::new()),
                seq: AtomicU64::new(0),
                terminated: Arc::new(TerminationLatch::new()),
                quiet_period: Mutex::new(None),
                quiet_deadline: Mutex::new(None),
                shutdown_timeout: Mutex::new(None),
                last_execution_time: Mutex::new(Instant::now()),
                config,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Submit `task` to run on the loop thread. Accepted up through
    /// `SHUTTING_DOWN` (a fresh submission resets the quiet period);
    /// rejected once `SHUTDOWN` or `TERMINATED`.
    pub fn execute<F>(&self, task: F) -> CoreResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let state = self.shared.state.load(Ordering::Acquire);
        if state == SHUTDOWN || state == TERMINATED {
            return Err(CoreError::RejectedExecution {
                reason: "event loop is shut down",
            });
        }
        self.ensure_started();
        self.shared.task_queue.enqueue(Box::new(task));
        if state == SHUTTING_DOWN {
            self.restart_quiet_period();
        }
        if !self.is_in_event_loop() {
            self.shared.wake.wake();
        }
        Ok(())
    }

    /// Record this instant as the most recent activity and, if a quiet
    /// period is configured, push `quiet_deadline` out to `now + quiet_period`
    /// so a submission arriving late in the quiet period still gets its full
    /// window to be observed as quiet before shutdown proceeds.
    fn restart_quiet_period(&self) {
        let now = Instant::now();
        *self.shared.last_execution_time.lock().unwrap() = now;
        if let Some(quiet_period) = *self.shared.quiet_period.lock().unwrap() {
            *self.shared.quiet_deadline.lock().unwrap() = Some(now + quiet_period);
        }
    }

    /// Schedule `task` to run no earlier than `delay` from now.
    pub fn schedule<F>(&self, task: F, delay: Duration) -> CoreResult<ScheduledHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let state = self.shared.state.load(Ordering::Acquire);
        if state == SHUTDOWN || state == TERMINATED {
            return Err(CoreError::RejectedExecution {
                reason: "event loop is shut down",
            });
        }
        self.ensure_started();
        let seq = self.shared.seq.fetch_add(1, Ordering::AcqRel);
        let inner = Arc::new(ScheduledTaskInner {
            deadline: Instant::now() + delay,
            seq,
            cancelled: AtomicBool::new(false),
            task: Mutex::new(Some(Box::new(task))),
        });
        self.shared
            .scheduled
            .lock()
            .unwrap()
            .push(HeapEntry(Arc::clone(&inner)));
        if !self.is_in_event_loop() {
            self.shared.wake.wake();
        }
        Ok(ScheduledHandle { inner })
    }

    /// Cheap check for "is the calling thread this loop's own worker
    /// thread", backed by a thread-local set rather than a shared map.
    pub fn is_in_event_loop(&self) -> bool {
        let key = Arc::as_ptr(&self.shared) as usize;
        OWNED_LOOPS.with(|loops| loops.borrow().contains(&key))
    }

    /// Begin graceful shutdown: stop accepting scheduled work, run out the
    /// quiet period, then stop. Returns a handle that resolves once the
    /// loop has fully terminated.
    pub fn shutdown_gracefully(&self, quiet_period: Duration, timeout: Duration) -> Termination {
        let now = Instant::now();
        *self.shared.quiet_period.lock().unwrap() = Some(quiet_period);
        *self.shared.quiet_deadline.lock().unwrap() = Some(now + quiet_period);
        *self.shared.shutdown_timeout.lock().unwrap() = Some(now + timeout);

        self.ensure_started();
        loop {
            let state = self.shared.state.load(Ordering::Acquire);
            if state != NOT_STARTED && state != STARTED {
                // Already SHUTTING_DOWN, SHUTDOWN, or TERMINATED: nothing to do.
                break;
            }
            if self
                .shared
                .state
                .compare_exchange(state, SHUTTING_DOWN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        self.shared.wake.wake();
        self.termination()
    }

    /// A handle that resolves once the loop has terminated, whether from
    /// graceful shutdown or a structural panic.
    pub fn termination(&self) -> Termination {
        Termination {
            latch: Arc::clone(&self.shared.terminated),
        }
    }

    fn ensure_started(&self) {
        if self
            .shared
            .state
            .compare_exchange(NOT_STARTED, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name("corenet-loop".into())
                .spawn(move || run_worker(shared))
                .expect("failed to spawn event loop worker thread");
            *self.worker.lock().unwrap() = Some(handle);
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

fn run_worker(shared: Arc<Shared>) {
    let key = Arc::as_ptr(&shared) as usize;
    OWNED_LOOPS.with(|loops| loops.borrow_mut().insert(key));
    log::info!("corenet event loop started");

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| loop_body(&shared)));

    OWNED_LOOPS.with(|loops| {
        loops.borrow_mut().remove(&key);
    });

    match result {
        Ok(()) => {
            shared.state.store(TERMINATED, Ordering::Release);
            shared.terminated.signal(TerminationStatus::Terminated);
            log::info!("corenet event loop terminated");
        }
        Err(_) => {
            shared.state.store(TERMINATED, Ordering::Release);
            shared.terminated.signal(TerminationStatus::Panicked);
            log::error!("corenet event loop terminated abnormally due to an internal invariant violation");
        }
    }
}

fn loop_body(shared: &Shared) {
    loop {
        drain_ready_scheduled(shared);
        drain_task_queue(shared);

        if shared.state.load(Ordering::Acquire) == SHUTTING_DOWN {
            if shutting_down_step(shared) {
                shared.state.store(SHUTDOWN, Ordering::Release);
                return;
            }
            continue;
        }

        let next_wake = next_deadline(shared).unwrap_or_else(|| {
            Instant::now() + shared.config.breakout_interval
        });
        shared.wake.sleep_until(next_wake);
    }
}

fn drain_ready_scheduled(shared: &Shared) {
    let now = Instant::now();
    loop {
        let mut heap = shared.scheduled.lock().unwrap();
        let Some(top) = heap.peek() else { break };
        if top.0.deadline > now {
            break;
        }
        let HeapEntry(entry) = heap.pop().unwrap();
        drop(heap);
        if entry.cancelled.load(Ordering::Acquire) {
            continue;
        }
        if let Some(task) = entry.task.lock().unwrap().take() {
            shared.task_queue.enqueue(task);
        }
    }
}

fn drain_task_queue(shared: &Shared) {
    let mut ran = 0u32;
    let started = Instant::now();
    while let Some(task) = shared.task_queue.dequeue() {
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)).is_err() {
            log::warn!("corenet event loop: a submitted task panicked during execution");
        }
        *shared.last_execution_time.lock().unwrap() = Instant::now();
        ran += 1;
        if ran % shared.config.tasks_per_time_check == 0
            && started.elapsed() >= shared.config.breakout_interval
        {
            break;
        }
    }
}

fn next_deadline(shared: &Shared) -> Option<Instant> {
    shared.scheduled.lock().unwrap().peek().map(|e| e.0.deadline)
}

/// Returns `true` once the loop should fully stop.
fn shutting_down_step(shared: &Shared) -> bool {
    {
        let mut heap = shared.scheduled.lock().unwrap();
        while let Some(HeapEntry(entry)) = heap.pop() {
            entry.cancelled.store(true, Ordering::Release);
        }
    }
    drain_task_queue(shared);

    let now = Instant::now();
    let timed_out = shared
        .shutdown_timeout
        .lock()
        .unwrap()
        .is_some_and(|t| now >= t);
    let quiet_elapsed = shared
        .quiet_deadline
        .lock()
        .unwrap()
        .is_some_and(|t| now >= t);

    if timed_out || (quiet_elapsed && shared.task_queue.is_empty()) {
        return true;
    }

    let rearm = (shared.config.breakout_interval / 4).max(Duration::from_millis(1));
    shared.wake.sleep_until(now + rearm);
    false
}

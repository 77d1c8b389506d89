//! Black-box integration tests for corenet-core.
//!
//! These exercise the public API only, one end-to-end scenario per
//! component: queue FIFO under concurrent producers, retain/release to
//! zero, timer firing order and cancellation, constant identity, and
//! attribute lifecycle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use corenet_core::config::TimerConfig;
use corenet_core::error::CoreError;
use corenet_core::{
    AttributeKey, AttributeMap, ConstantPool, EventLoop, HashedWheelTimer, MpscQueue, RefCounted,
    ReferenceCounted,
};

#[test]
fn queue_fifo_per_producer_across_two_producers() {
    let queue = Arc::new(MpscQueue::new());

    let q1 = Arc::clone(&queue);
    let p1 = thread::spawn(move || {
        for v in [1, 2, 3] {
            q1.enqueue(v);
        }
    });
    let q2 = Arc::clone(&queue);
    let p2 = thread::spawn(move || {
        for v in [10, 20, 30] {
            q2.enqueue(v);
        }
    });
    p1.join().unwrap();
    p2.join().unwrap();

    let mut ones = Vec::new();
    let mut tens = Vec::new();
    while let Some(v) = queue.dequeue() {
        if v < 10 {
            ones.push(v);
        } else {
            tens.push(v);
        }
    }
    assert_eq!(ones, vec![1, 2, 3]);
    assert_eq!(tens, vec![10, 20, 30]);
}

#[test]
fn retain_release_runs_deallocate_exactly_once_at_zero() {
    let dealloc_calls = Arc::new(AtomicUsize::new(0));
    let d = Arc::clone(&dealloc_calls);
    let resource = RefCounted::new(move || {
        d.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(resource.reference_count(), 1);
    resource.retain(3).unwrap();
    assert_eq!(resource.reference_count(), 4);

    assert_eq!(resource.release(2).unwrap(), false);
    assert_eq!(resource.reference_count(), 2);

    assert_eq!(resource.release(2).unwrap(), true);
    assert_eq!(resource.reference_count(), 0);
    assert_eq!(dealloc_calls.load(Ordering::SeqCst), 1);

    let err = resource.retain(1).unwrap_err();
    assert_eq!(
        err,
        CoreError::IllegalReferenceCount {
            count: 0,
            delta: 1
        }
    );
}

#[test]
fn timer_fires_in_deadline_order_within_one_tick_of_schedule() {
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
        .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
        .collect();
    assert_eq!(order, vec!["B", "A", "C"]);

    timer.stop().unwrap();
}

#[test]
fn cancelling_a_timeout_before_its_deadline_stops_it_firing() {
    let timer = HashedWheelTimer::with_config(TimerConfig {
        tick_duration: Duration::from_millis(1),
        ticks_per_wheel: 8,
        max_pending_timeouts: 0,
        max_instances: 0,
    });

    let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let f = Arc::clone(&fired);
    let handle = timer
        .new_timeout(
            move || f.store(true, Ordering::SeqCst),
            Duration::from_millis(50),
        )
        .unwrap();

    thread::sleep(Duration::from_millis(10));
    assert!(handle.cancel());
    thread::sleep(Duration::from_millis(60));

    assert!(!fired.load(Ordering::SeqCst));
    assert!(handle.is_cancelled());
    assert!(!handle.is_expired());

    let unprocessed = timer.stop().unwrap();
    assert!(unprocessed.is_empty());
}

#[test]
fn constants_are_identity_comparable_and_names_are_unique_per_pool() {
    let pool = ConstantPool::new("integration-test");
    let k1 = pool.value_of("x");
    let k2 = pool.value_of("x");
    let k3 = pool.value_of("y");

    assert_eq!(k1, k2);
    assert_ne!(k1, k3);
    assert!(pool.new_instance("x").is_err());
    assert_ne!(k1.id(), k3.id());
}

#[test]
fn attribute_lifecycle_get_set_get_and_remove_mints_a_fresh_slot() {
    let map: AttributeMap<i32> = AttributeMap::new();
    let k1 = AttributeKey::value_of("integration.test.lifecycle");

    let a = map.get_attribute(&k1);
    a.set(42);
    assert_eq!(*map.get_attribute(&k1).get().unwrap(), 42);

    assert_eq!(a.get_and_remove(), Some(42));
    let b = map.get_attribute(&k1);
    assert_eq!(b.get(), None);
    assert_ne!(a, b);
}

#[test]
fn event_loop_runs_submitted_tasks_then_terminates_gracefully() {
    let event_loop = EventLoop::new();
    let (tx, rx) = mpsc::channel();
    for i in 0..5 {
        let tx = tx.clone();
        event_loop.execute(move || tx.send(i).unwrap()).unwrap();
    }

    let collected: Vec<_> = (0..5)
        .map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap())
        .collect();
    assert_eq!(collected, vec![0, 1, 2, 3, 4]);

    let termination =
        event_loop.shutdown_gracefully(Duration::from_millis(10), Duration::from_millis(500));
    termination.wait();
    assert!(termination.is_terminated());
    assert!(!termination.panicked());
}

#[test]
#[ignore] // Slow: drives 8 producer threads x 50k values each; run with `cargo test -- --ignored`.
fn queue_survives_high_contention_without_losing_values() {
    const PRODUCERS: usize = 8;
    const PER_PRODUCER: usize = 50_000;

    let queue = Arc::new(MpscQueue::new());
    let handles: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue.enqueue((p, i));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let mut total = 0;
    while queue.dequeue().is_some() {
        total += 1;
    }
    assert_eq!(total, PRODUCERS * PER_PRODUCER);
}

//! Lock-free multi-producer, single-consumer linked queue.
//!
//! This is the classic Vyukov intrusive MPSC queue: a singly-linked list
//! with a dummy head node. Any number of threads may [`MpscQueue::enqueue`]
//! concurrently; exactly one thread at a time may [`MpscQueue::dequeue`].
//!
//! # Memory ordering
//!
//! - Enqueue: `tail.exchange(new, AcqRel)` publishes the new tail, then
//!   `old.next.store(new, Release)` links the old tail to it. A concurrent
//!   dequeuer that has already advanced past `old` but not yet reached `new`
//!   will observe `old.next == null` for a brief window — see below.
//! - Dequeue: `head.next.load(Acquire)` pairs with the producer's `Release`
//!   store above. If `next` is null but `head != tail`, a producer has
//!   claimed the tail slot but not yet published the link; the consumer
//!   spin-waits, bounded in practice because the producer is between two
//!   back-to-back atomic operations.
//!
//! `head` is touched only by the consumer and never needs atomics for its
//! own storage; `tail` is shared by every producer. The two fields are
//! cache-line padded apart (see [`crate::pad::CachePadded`]) so producer
//! traffic on `tail` never invalidates the consumer's `head` cache line.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use serde::Serialize;

use crate::pad::CachePadded;

/// One-way diagnostic snapshot of a queue's depth, for human/JSON
/// inspection only — never deserialized, never part of the queue's
/// control-flow contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub len: usize,
    pub is_empty: bool,
}

struct Node<T> {
    value: Option<T>,
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn new(value: Option<T>) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            value,
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// A lock-free MPSC queue. Cloneable producer handles are unnecessary here —
/// `&MpscQueue<T>` is enough to enqueue from any thread; `dequeue` and its
/// consumer-only siblings take `&self` too, but a debug guard catches any
/// attempt to call them from two threads at once, which would violate the
/// single-consumer contract this type's lock elision depends on.
pub struct MpscQueue<T> {
    head: CachePadded<UnsafeCell<*mut Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    consumer_active: AtomicBool,
}

unsafe impl<T: Send> Send for MpscQueue<T> {}
unsafe impl<T: Send> Sync for MpscQueue<T> {}

impl<T> MpscQueue<T> {
    pub fn new() -> Self {
        let dummy = Node::new(None);
        Self {
            head: CachePadded::new(UnsafeCell::new(dummy)),
            tail: CachePadded::new(AtomicPtr::new(dummy)),
            consumer_active: AtomicBool::new(false),
        }
    }

    /// SAFETY: caller must hold the single-consumer guarantee (enforced by
    /// [`ConsumerGuard`] in every public entry point that calls this).
    unsafe fn head(&self) -> *mut Node<T> {
        unsafe { *self.head.get() }
    }

    /// SAFETY: see [`Self::head`].
    unsafe fn set_head(&self, new_head: *mut Node<T>) {
        unsafe {
            *self.head.get() = new_head;
        }
    }

    /// Enqueue a value. Wait-free: one allocation, one exchange, one store.
    /// Safe to call from any number of threads concurrently.
    pub fn enqueue(&self, value: T) {
        let node = Node::new(Some(value));
        // SAFETY: `node` was just allocated and is not yet reachable from
        // anywhere else, so writing its `next` pointer here is not racy.
        let old_tail = self.tail.swap(node, Ordering::AcqRel);
        unsafe {
            (*old_tail).next.store(node, Ordering::Release);
        }
    }

    /// Dequeue the next value, or `None` if the queue is empty.
    ///
    /// Must only be called by a single logical consumer at a time; a second
    /// concurrent caller panics rather than corrupting the list.
    pub fn dequeue(&self) -> Option<T> {
        let _guard = ConsumerGuard::acquire(&self.consumer_active);
        // SAFETY: the guard above ensures only one thread is ever inside
        // this function body at a time, so mutating through `head` (a raw
        // pointer, not an atomic) is not racy with any other dequeuer.
        unsafe { self.dequeue_unguarded() }
    }

    unsafe fn dequeue_unguarded(&self) -> Option<T> {
        let head = unsafe { self.head() };
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if next.is_null() {
            // Either genuinely empty, or a producer is mid-publish: the
            // producer has exchanged `tail` but not yet stored `old.next`.
            // That window is two back-to-back atomic ops wide, so a bounded
            // spin is the correct (and standard) response, not an error.
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            return self.spin_for_next(head);
        }
        self.take_from(head, next)
    }

    #[cold]
    fn spin_for_next(&self, head: *mut Node<T>) -> Option<T> {
        loop {
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if !next.is_null() {
                return unsafe { self.take_from(head, next) };
            }
            std::hint::spin_loop();
        }
    }

    unsafe fn take_from(&self, head: *mut Node<T>, next: *mut Node<T>) -> Option<T> {
        let value = unsafe { (*next).value.take() };
        unsafe {
            self.set_head(next);
        }
        // The old dummy head is no longer reachable from anywhere: drop it.
        unsafe {
            drop(Box::from_raw(head));
        }
        value
    }

    /// Consumer-only: a reference to the next value without dequeuing it, or
    /// `None` if the queue is empty. Uses the same bounded spin as
    /// [`Self::dequeue`] for the producer-mid-publish window.
    pub fn peek(&self) -> Option<&T> {
        let _guard = ConsumerGuard::acquire(&self.consumer_active);
        let head = unsafe { self.head() };
        let mut next = unsafe { (*head).next.load(Ordering::Acquire) };
        if next.is_null() {
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            loop {
                next = unsafe { (*head).next.load(Ordering::Acquire) };
                if !next.is_null() {
                    break;
                }
                std::hint::spin_loop();
            }
        }
        unsafe { (*next).value.as_ref() }
    }

    /// Consumer-only: true if the queue currently has no elements.
    pub fn is_empty(&self) -> bool {
        let _guard = ConsumerGuard::acquire(&self.consumer_active);
        let head = unsafe { self.head() };
        unsafe { (*head).next.load(Ordering::Acquire).is_null() }
    }

    /// Consumer-only diagnostic: O(n) walk of the remaining elements.
    pub fn count(&self) -> usize {
        let _guard = ConsumerGuard::acquire(&self.consumer_active);
        let mut n = 0;
        let mut cur = unsafe { self.head() };
        loop {
            let next = unsafe { (*cur).next.load(Ordering::Acquire) };
            if next.is_null() {
                break;
            }
            n += 1;
            cur = next;
        }
        n
    }

    /// Consumer-only diagnostic snapshot combining [`Self::count`] and
    /// [`Self::is_empty`] into a single `Serialize`-able value.
    pub fn depth(&self) -> QueueDepth {
        QueueDepth {
            len: self.count(),
            is_empty: self.is_empty(),
        }
    }
}

impl<T> Default for MpscQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        // Drain whatever remains so node allocations don't leak.
        while self.dequeue().is_some() {}
        let head = unsafe { self.head() };
        unsafe {
            drop(Box::from_raw(head));
        }
    }
}

/// Panics on reentrant/concurrent dequeue-side access, enforcing the single
/// consumer invariant at runtime rather than silently corrupting the list.
struct ConsumerGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ConsumerGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Self {
        if flag.swap(true, Ordering::AcqRel) {
            panic!("MpscQueue: concurrent access from more than one consumer");
        }
        Self { flag }
    }
}

impl Drop for ConsumerGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn enqueue_then_dequeue_roundtrips() {
        let q = MpscQueue::new();
        q.enqueue(1);
        q.enqueue(2);
        q.enqueue(3);
        assert_eq!(q.dequeue(), Some(1));
        assert_eq!(q.dequeue(), Some(2));
        assert_eq!(q.dequeue(), Some(3));
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn empty_queue_reports_empty() {
        let q: MpscQueue<u32> = MpscQueue::new();
        assert!(q.is_empty());
        assert_eq!(q.count(), 0);
    }

    #[test]
    fn count_is_a_diagnostic_walk() {
        let q = MpscQueue::new();
        q.enqueue("a");
        q.enqueue("b");
        assert_eq!(q.count(), 2);
        q.dequeue();
        assert_eq!(q.count(), 1);
    }

    #[test]
    fn depth_reports_len_and_emptiness() {
        let q = MpscQueue::new();
        assert_eq!(q.depth(), QueueDepth { len: 0, is_empty: true });
        q.enqueue(1);
        assert_eq!(q.depth(), QueueDepth { len: 1, is_empty: false });
    }

    #[test]
    fn peek_returns_the_front_value_without_removing_it() {
        let q = MpscQueue::new();
        assert_eq!(q.peek(), None);
        q.enqueue("a");
        q.enqueue("b");
        assert_eq!(q.peek(), Some(&"a"));
        assert_eq!(q.peek(), Some(&"a"));
        assert_eq!(q.dequeue(), Some("a"));
        assert_eq!(q.peek(), Some(&"b"));
    }

    #[test]
    fn two_producers_preserve_per_producer_fifo_order() {
        let q = Arc::new(MpscQueue::new());

        let q1 = Arc::clone(&q);
        let p1 = thread::spawn(move || {
            for v in [1, 2, 3] {
                q1.enqueue(v);
            }
        });
        let q2 = Arc::clone(&q);
        let p2 = thread::spawn(move || {
            for v in [10, 20, 30] {
                q2.enqueue(v);
            }
        });
        p1.join().unwrap();
        p2.join().unwrap();

        let mut ones = Vec::new();
        let mut tens = Vec::new();
        while let Some(v) = q.dequeue() {
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
    fn many_producers_deliver_exactly_n_times_m_values() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 2000;

        let q = Arc::new(MpscQueue::new());
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        q.enqueue((p, i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut seen = vec![0usize; PRODUCERS];
        let mut total = 0;
        while let Some((p, i)) = q.dequeue() {
            assert_eq!(seen[p], i, "producer {p} delivered out of order");
            seen[p] += 1;
            total += 1;
        }
        assert_eq!(total, PRODUCERS * PER_PRODUCER);
        assert!(seen.iter().all(|&n| n == PER_PRODUCER));
    }

    #[test]
    #[should_panic(expected = "concurrent access from more than one consumer")]
    fn reentrant_dequeue_panics() {
        let q = MpscQueue::new();
        q.enqueue(1);
        let _guard = ConsumerGuard::acquire(&q.consumer_active);
        q.dequeue();
    }
}

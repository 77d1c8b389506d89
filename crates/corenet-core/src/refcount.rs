//! Atomic reference counting for pooled buffers and shared native handles.
//!
//! The CAS protocol below enforces three invariants without ever taking a
//! lock: the count never resurrects from zero, it never goes negative, and
//! `deallocate` runs exactly once, on whichever thread's `release` observes
//! the count hit zero.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::{CoreError, CoreResult};

/// Implemented by every pooled buffer / shared native handle in the
/// transport. `retain`/`release` are the only ways the count moves; nothing
/// else in this crate is allowed to poke at it directly.
pub trait ReferenceCounted {
    /// Increment the count by `n`. Fails if the resource is already dead
    /// (count == 0) or the increment would overflow.
    fn retain(&self, n: i64) -> CoreResult<()>;

    /// Decrement the count by `n`. Returns `Ok(true)` iff this call observed
    /// the count reach zero and ran `deallocate`.
    fn release(&self, n: i64) -> CoreResult<bool>;

    /// Record a leak-detector hint. No-op by default.
    fn touch(&self, hint: Option<&dyn fmt::Debug>) {
        if let Some(hint) = hint {
            log::trace!("touch: {hint:?}");
        }
    }

    /// Current count, for diagnostics. Not part of the CAS protocol itself.
    fn reference_count(&self) -> i64;
}

/// A minimal concrete [`ReferenceCounted`] resource: an atomic count plus a
/// `deallocate` closure invoked exactly once. Pooled buffers embed this
/// rather than re-deriving the CAS protocol themselves.
pub struct RefCounted<F: FnOnce()> {
    count: AtomicI64,
    deallocate: std::cell::Cell<Option<F>>,
}

// `deallocate` only ever runs from inside a `&self` method guarded by the
// "prior == n" single-decrementer check, so only one thread ever touches the
// Cell's contents — but the Cell itself must still be Sync to live behind a
// shared reference across threads.
unsafe impl<F: FnOnce() + Send> Sync for RefCounted<F> {}

impl<F: FnOnce()> RefCounted<F> {
    /// A fresh resource with `reference_count() == 1`.
    pub fn new(deallocate: F) -> Self {
        Self {
            count: AtomicI64::new(1),
            deallocate: std::cell::Cell::new(Some(deallocate)),
        }
    }
}

impl<F: FnOnce()> ReferenceCounted for RefCounted<F> {
    fn retain(&self, n: i64) -> CoreResult<()> {
        loop {
            let current = self.count.load(Ordering::Acquire);
            let next = current.wrapping_add(n);
            // `next <= n` holds iff `current == 0` (resurrection) or the add
            // overflowed and wrapped back down — both are illegal.
            if next <= n {
                return Err(CoreError::IllegalReferenceCount {
                    count: current,
                    delta: n,
                });
            }
            if self
                .count
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    fn release(&self, n: i64) -> CoreResult<bool> {
        loop {
            let current = self.count.load(Ordering::Acquire);
            if current < n {
                return Err(CoreError::IllegalReferenceCount {
                    count: current,
                    delta: -n,
                });
            }
            let next = current - n;
            match self.count.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // `current == n` is the single-decrementer test: only the
                    // release that observed the count drop from exactly `n`
                    // to `0` ever runs `deallocate`.
                    if current == n {
                        if let Some(dealloc) = self.deallocate.take() {
                            dealloc();
                        }
                        return Ok(true);
                    }
                    return Ok(false);
                }
                Err(_) => continue,
            }
        }
    }

    fn reference_count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn retain_then_release_matches_scenario_two() {
        let dealloc_calls = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&dealloc_calls);
        let res = RefCounted::new(move || {
            d.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(res.reference_count(), 1);
        res.retain(3).unwrap();
        assert_eq!(res.reference_count(), 4);

        assert_eq!(res.release(2).unwrap(), false);
        assert_eq!(res.reference_count(), 2);

        assert_eq!(res.release(2).unwrap(), true);
        assert_eq!(res.reference_count(), 0);
        assert_eq!(dealloc_calls.load(Ordering::SeqCst), 1);

        let err = res.retain(1).unwrap_err();
        assert_eq!(
            err,
            CoreError::IllegalReferenceCount {
                count: 0,
                delta: 1
            }
        );
    }

    #[test]
    fn release_past_zero_is_illegal() {
        let res = RefCounted::new(|| {});
        let err = res.release(2).unwrap_err();
        assert_eq!(
            err,
            CoreError::IllegalReferenceCount {
                count: 1,
                delta: -2
            }
        );
    }

    #[test]
    fn concurrent_retain_release_deallocates_exactly_once() {
        const RETAINERS: i64 = 64;

        let dealloc_calls = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&dealloc_calls);
        let res = Arc::new(RefCounted::new(move || {
            d.fetch_add(1, Ordering::SeqCst);
        }));

        // Bring the count up to 1 + RETAINERS, then have RETAINERS threads
        // each release 1 — one of them must observe the final zero.
        res.retain(RETAINERS).unwrap();

        let handles: Vec<_> = (0..RETAINERS)
            .map(|_| {
                let res = Arc::clone(&res);
                std::thread::spawn(move || res.release(1).unwrap())
            })
            .collect();

        let zero_hits: i64 = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&hit_zero| hit_zero)
            .count() as i64;

        assert_eq!(zero_hits, 1);
        assert_eq!(dealloc_calls.load(Ordering::SeqCst), 1);
        assert_eq!(res.reference_count(), 0);
    }
}

//! Cache-line padding for hot concurrent fields.
//!
//! The MPSC queue's `head` (consumer-only) and `tail` (producer-shared) fields
//! must never share a cache line — if they did, every producer's exchange on
//! `tail` would invalidate the consumer's cached `head` line and vice versa.

/// Wraps `T` and pads it out to a full cache line (64 bytes on every
/// architecture this crate targets).
///
/// This re-expresses the inherited padding base classes used elsewhere in
/// this lineage as an explicit, visible wrapper rather than an opaque
/// superclass — the contract is just "don't share a cache line with a
/// neighboring field", nothing more.
#[repr(align(64))]
#[derive(Debug, Default)]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> std::ops::DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    #[test]
    fn pads_to_a_full_cache_line() {
        assert_eq!(align_of::<CachePadded<u8>>(), 64);
        assert_eq!(size_of::<CachePadded<u8>>(), 64);
    }

    #[test]
    fn deref_reaches_the_value() {
        let padded = CachePadded::new(42u32);
        assert_eq!(*padded, 42);
    }
}

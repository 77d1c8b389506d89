//! Typed, atomically-updatable per-channel state addressed by interned keys.
//!
//! An [`AttributeKey<V>`] is a [`Constant`](crate::constant::Constant) minted
//! from a single process-wide pool; an [`AttributeMap`] hangs [`Attribute<V>`]
//! slots off those keys in four lock-striped buckets. Lookups hash `key.id()
//! & 3`; each bucket is a doubly-linked list walked under that bucket's own
//! mutex, with a lock-free fast path for the common "head already matches"
//! case.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::constant::{Constant, ConstantPool};

fn attribute_key_pool() -> &'static ConstantPool {
    static POOL: OnceLock<ConstantPool> = OnceLock::new();
    POOL.get_or_init(|| ConstantPool::new("AttributeKey"))
}

/// An interned key identifying a typed attribute slot. Two keys minted with
/// the same name are the same key; `AttributeKey::<T>::new_instance` fails
/// if the name is already taken.
pub struct AttributeKey<V> {
    constant: Constant,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for AttributeKey<V> {
    fn clone(&self) -> Self {
        Self {
            constant: self.constant.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V> PartialEq for AttributeKey<V> {
    fn eq(&self, other: &Self) -> bool {
        self.constant == other.constant
    }
}

impl<V> Eq for AttributeKey<V> {}

impl<V> std::fmt::Debug for AttributeKey<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AttributeKey").field(&self.constant).finish()
    }
}

impl<V> AttributeKey<V> {
    /// Return the existing key for `name`, or mint and register a new one.
    pub fn value_of(name: &str) -> Self {
        Self {
            constant: attribute_key_pool().value_of(name),
            _marker: PhantomData,
        }
    }

    /// Mint a brand-new key for `name`; fails if `name` is already taken.
    pub fn new_instance(name: &str) -> crate::error::CoreResult<Self> {
        Ok(Self {
            constant: attribute_key_pool().new_instance(name)?,
            _marker: PhantomData,
        })
    }

    /// Whether `name` has already been minted as an attribute key.
    pub fn exists(name: &str) -> bool {
        attribute_key_pool().exists(name)
    }

    pub fn id(&self) -> u64 {
        self.constant.id()
    }

    pub fn name(&self) -> &str {
        self.constant.name()
    }
}

const BUCKETS: usize = 4;
const BUCKET_MASK: u64 = (BUCKETS as u64) - 1;

struct AttributeNode<V> {
    key: Constant,
    value: AtomicPtr<V>,
    removed: AtomicBool,
    prev: AtomicPtr<AttributeNode<V>>,
    next: AtomicPtr<AttributeNode<V>>,
}

impl<V> AttributeNode<V> {
    fn new(key: Constant) -> *mut Self {
        Box::into_raw(Box::new(Self {
            key,
            value: AtomicPtr::new(std::ptr::null_mut()),
            removed: AtomicBool::new(false),
            prev: AtomicPtr::new(std::ptr::null_mut()),
            next: AtomicPtr::new(std::ptr::null_mut()),
        }))
    }
}

/// A single attribute slot: a typed value addressed by an [`AttributeKey`].
///
/// Two calls to [`AttributeMap::get_attribute`] for the same live key return
/// handles to the *same* slot; after [`Attribute::remove`] or
/// [`Attribute::get_and_remove`], a fresh `get_attribute` call for that key
/// mints a brand-new slot (a different `Attribute` object).
pub struct Attribute<'a, V> {
    node: *mut AttributeNode<V>,
    bucket_lock: &'a Mutex<()>,
    tombstones: &'a AtomicPtr<AttributeNode<V>>,
}

// Every mutation of `prev`/`next`/bucket membership happens under
// `bucket_lock`; `value` and `removed` are atomics in their own right.
unsafe impl<V: Send> Send for Attribute<'_, V> {}
unsafe impl<V: Send + Sync> Sync for Attribute<'_, V> {}

impl<'a, V> Attribute<'a, V> {
    pub fn key(&self) -> Constant {
        unsafe { (*self.node).key.clone() }
    }

    /// Current value, or `None` if unset or removed.
    pub fn get(&self) -> Option<&V> {
        let node = unsafe { &*self.node };
        if node.removed.load(Ordering::Acquire) {
            return None;
        }
        let ptr = node.value.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }

    /// Unconditionally replace the value, leaking the previous one's storage
    /// back to this slot's ownership (dropped on the next `set`/`remove`).
    pub fn set(&self, value: V) {
        let new_ptr = Box::into_raw(Box::new(value));
        let node = unsafe { &*self.node };
        let old = node.value.swap(new_ptr, Ordering::AcqRel);
        if !old.is_null() {
            drop(unsafe { Box::from_raw(old) });
        }
    }

    /// Set `value`, returning whatever was previously stored (if any).
    pub fn get_and_set(&self, value: V) -> Option<V> {
        let new_ptr = Box::into_raw(Box::new(value));
        let node = unsafe { &*self.node };
        let old = node.value.swap(new_ptr, Ordering::AcqRel);
        if old.is_null() {
            None
        } else {
            Some(*unsafe { Box::from_raw(old) })
        }
    }

    /// Set `value` only if the slot is currently unset; returns whether the
    /// set happened.
    pub fn set_if_absent(&self, value: V) -> bool {
        let node = unsafe { &*self.node };
        let new_ptr = Box::into_raw(Box::new(value));
        match node.value.compare_exchange(
            std::ptr::null_mut(),
            new_ptr,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(_) => {
                drop(unsafe { Box::from_raw(new_ptr) });
                false
            }
        }
    }

    /// Atomically replace the value with `new` iff it currently equals
    /// `expected`. Returns whether the swap happened.
    pub fn compare_and_set(&self, expected: &V, new: V) -> bool
    where
        V: PartialEq,
    {
        let node = unsafe { &*self.node };
        let current = node.value.load(Ordering::Acquire);
        let matches = !current.is_null() && unsafe { &*current } == expected;
        if !matches {
            return false;
        }
        let new_ptr = Box::into_raw(Box::new(new));
        match node
            .value
            .compare_exchange(current, new_ptr, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                drop(unsafe { Box::from_raw(current) });
                true
            }
            Err(_) => {
                drop(unsafe { Box::from_raw(new_ptr) });
                false
            }
        }
    }

    /// Return the value and unlink this slot from its bucket in one step. A
    /// later `get_attribute` for the same key mints a fresh slot.
    pub fn get_and_remove(&self) -> Option<V> {
        self.unlink()
    }

    /// Unlink this slot from its bucket. A later `get_attribute` for the
    /// same key mints a fresh slot.
    pub fn remove(&self) {
        self.unlink();
    }

    fn unlink(&self) -> Option<V> {
        let node_ptr = self.node;
        let node = unsafe { &*node_ptr };
        if node.removed.swap(true, Ordering::AcqRel) {
            return None; // already removed
        }
        let old = node.value.swap(std::ptr::null_mut(), Ordering::AcqRel);
        let value = if old.is_null() {
            None
        } else {
            Some(*unsafe { Box::from_raw(old) })
        };

        let _guard = self.bucket_lock.lock().unwrap();
        // Heads are never unlinked; they stay as bucket sentinels.
        let prev = node.prev.load(Ordering::Acquire);
        if prev.is_null() {
            return value;
        }
        let next = node.next.load(Ordering::Acquire);
        unsafe {
            (*prev).next.store(next, Ordering::Release);
        }
        if !next.is_null() {
            unsafe {
                (*next).prev.store(prev, Ordering::Release);
            }
        }
        // `node_ptr` is now unreachable from `bucket.head`, so the bucket's
        // live-chain walk (and `AttributeMap`'s `Drop`, which only follows
        // that chain) will never see it again. Push it onto the bucket's
        // tombstone stack (reusing the now-meaningless `next` link) so
        // `Drop` still frees the allocation exactly once, without freeing it
        // here — a stale `Attribute` handle to this node may still call
        // `get`/`key` on it after this returns.
        self.push_tombstone(node_ptr);
        value
    }

    fn push_tombstone(&self, node_ptr: *mut AttributeNode<V>) {
        let tombstones = self.tombstones;
        loop {
            let old_head = tombstones.load(Ordering::Acquire);
            unsafe {
                (*node_ptr).next.store(old_head, Ordering::Relaxed);
            }
            if tombstones
                .compare_exchange_weak(old_head, node_ptr, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

impl<V> PartialEq for Attribute<'_, V> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.node, other.node)
    }
}

struct Bucket<V> {
    head: AtomicPtr<AttributeNode<V>>,
    lock: Mutex<()>,
    /// Singly-linked stack (via each node's own `next` field) of unlinked,
    /// non-head nodes awaiting deallocation in `AttributeMap::drop`. A node
    /// spliced out of the live chain by `Attribute::unlink` is still
    /// reachable by any `Attribute` handle that was already holding it, so
    /// it can't be freed on the spot — it's parked here instead.
    tombstones: AtomicPtr<AttributeNode<V>>,
}

impl<V> Bucket<V> {
    fn new() -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
            lock: Mutex::new(()),
            tombstones: AtomicPtr::new(std::ptr::null_mut()),
        }
    }
}

/// Per-map attribute storage, four lock-striped buckets keyed by
/// `key.id() & 3`.
pub struct AttributeMap<V> {
    buckets: [Bucket<V>; BUCKETS],
}

impl<V> Default for AttributeMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> AttributeMap<V> {
    pub fn new() -> Self {
        Self {
            buckets: [Bucket::new(), Bucket::new(), Bucket::new(), Bucket::new()],
        }
    }

    fn bucket(&self, key: &AttributeKey<V>) -> &Bucket<V> {
        &self.buckets[(key.id() & BUCKET_MASK) as usize]
    }

    /// Return the attribute slot for `key`, minting one if this is the
    /// first access.
    pub fn get_attribute(&self, key: &AttributeKey<V>) -> Attribute<'_, V> {
        let bucket = self.bucket(key);

        let head = bucket.head.load(Ordering::Acquire);
        if head.is_null() {
            let node = AttributeNode::new(key.constant.clone());
            match bucket.head.compare_exchange(
                std::ptr::null_mut(),
                node,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Attribute {
                        node,
                        bucket_lock: &bucket.lock,
                        tombstones: &bucket.tombstones,
                    };
                }
                Err(_) => {
                    // Lost the race; someone else installed the head. Fall
                    // through to the normal walk, dropping our speculative
                    // node.
                    drop(unsafe { Box::from_raw(node) });
                }
            }
        }

        // Lock-free fast path: head matches and is live.
        let head = bucket.head.load(Ordering::Acquire);
        if !head.is_null() {
            let node = unsafe { &*head };
            if node.key == key.constant && !node.removed.load(Ordering::Acquire) {
                return Attribute {
                    node: head,
                    bucket_lock: &bucket.lock,
                    tombstones: &bucket.tombstones,
                };
            }
        }

        let _guard = bucket.lock.lock().unwrap();
        let mut cur = bucket.head.load(Ordering::Acquire);
        let mut tail = cur;
        while !cur.is_null() {
            let node = unsafe { &*cur };
            if node.key == key.constant && !node.removed.load(Ordering::Acquire) {
                return Attribute {
                    node: cur,
                    bucket_lock: &bucket.lock,
                    tombstones: &bucket.tombstones,
                };
            }
            tail = cur;
            cur = node.next.load(Ordering::Acquire);
        }

        let new_node = AttributeNode::new(key.constant.clone());
        unsafe {
            (*new_node).prev.store(tail, Ordering::Release);
        }
        unsafe {
            (*tail).next.store(new_node, Ordering::Release);
        }
        Attribute {
            node: new_node,
            bucket_lock: &bucket.lock,
            tombstones: &bucket.tombstones,
        }
    }

    /// Lock-free fast path, falling back to a locked walk: whether `key`
    /// currently has a live (non-removed) attribute.
    pub fn has_attribute(&self, key: &AttributeKey<V>) -> bool {
        let bucket = self.bucket(key);
        let head = bucket.head.load(Ordering::Acquire);
        if head.is_null() {
            return false;
        }
        let node = unsafe { &*head };
        if node.key == key.constant {
            return !node.removed.load(Ordering::Acquire);
        }

        let _guard = bucket.lock.lock().unwrap();
        let mut cur = bucket.head.load(Ordering::Acquire);
        while !cur.is_null() {
            let node = unsafe { &*cur };
            if node.key == key.constant && !node.removed.load(Ordering::Acquire) {
                return true;
            }
            cur = node.next.load(Ordering::Acquire);
        }
        false
    }
}

impl<V> Drop for AttributeMap<V> {
    fn drop(&mut self) {
        for bucket in &mut self.buckets {
            let mut cur = *bucket.head.get_mut();
            while !cur.is_null() {
                let mut node = unsafe { Box::from_raw(cur) };
                let value_ptr = *node.value.get_mut();
                if !value_ptr.is_null() {
                    drop(unsafe { Box::from_raw(value_ptr) });
                }
                cur = *node.next.get_mut();
            }

            // Nodes unlinked by `Attribute::unlink` (non-head removals) were
            // parked here instead of freed immediately, since a stale
            // `Attribute` handle may still reference them. By the time the
            // map itself drops, no handle can outlive it (they borrow from
            // `&'a self`), so it's safe to free them now. Their `value` was
            // already freed at unlink time.
            let mut dead = *bucket.tombstones.get_mut();
            while !dead.is_null() {
                let mut node = unsafe { Box::from_raw(dead) };
                dead = *node.next.get_mut();
            }
        }
    }
}

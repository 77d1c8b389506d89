//! Interned, identity-comparable constants and the pool that mints them.
//!
//! A [`Constant`] is never equal to a different [`Constant`], even if their
//! names collide — name collisions are rejected at creation time instead.
//! Ordering falls back to a lazily-assigned, process-wide `uniquifier` only
//! when two constants' hashes collide, so the common case (hash-distinct)
//! never pays for it.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{CoreError, CoreResult};

static GLOBAL_UNIQUIFIER: AtomicU64 = AtomicU64::new(0);

fn next_uniquifier() -> u64 {
    // Never returns 0, so 0 can serve as "not yet assigned" inside Constant.
    GLOBAL_UNIQUIFIER.fetch_add(1, Ordering::Relaxed) + 1
}

struct ConstantInner {
    id: u64,
    name: String,
    uniquifier: AtomicU64,
}

/// An interned, identity-comparable singleton minted by a [`ConstantPool`].
///
/// Cloning a `Constant` is cheap (it's an `Arc` internally) and preserves
/// identity: clones of the same constant are still `==` to each other and to
/// the original, while two constants from independent `value_of` calls with
/// different names are never equal.
#[derive(Clone)]
pub struct Constant {
    inner: Arc<ConstantInner>,
}

impl Constant {
    fn new(id: u64, name: String) -> Self {
        Self {
            inner: Arc::new(ConstantInner {
                id,
                name,
                uniquifier: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn uniquifier(&self) -> u64 {
        let existing = self.inner.uniquifier.load(Ordering::Acquire);
        if existing != 0 {
            return existing;
        }
        let assigned = next_uniquifier();
        match self.inner.uniquifier.compare_exchange(
            0,
            assigned,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => assigned,
            // Lost the race to another thread comparing this same constant;
            // whichever value landed is equally valid as a stable tiebreaker.
            Err(winner) => winner,
        }
    }
}

impl fmt::Debug for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constant")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.name)
    }
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Constant {}

impl Hash for Constant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl PartialOrd for Constant {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Constant {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        if self == other {
            return std::cmp::Ordering::Equal;
        }
        self.inner
            .id
            .cmp(&other.inner.id)
            .then_with(|| self.uniquifier().cmp(&other.uniquifier()))
    }
}

/// Process-wide (or scoped, if you build more than one) mint for
/// [`Constant`]s. Constants never expire and `id`s are unique and
/// monotonically increasing within one pool.
pub struct ConstantPool {
    by_name: Mutex<HashMap<String, Constant>>,
    next_id: AtomicU64,
    name: &'static str,
}

impl ConstantPool {
    pub fn new(name: &'static str) -> Self {
        Self {
            by_name: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            name,
        }
    }

    /// Return the existing constant for `name`, or mint and insert a new one.
    pub fn value_of(&self, name: &str) -> Constant {
        let mut by_name = self.by_name.lock().unwrap();
        if let Some(existing) = by_name.get(name) {
            return existing.clone();
        }
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let constant = Constant::new(id, name.to_string());
        by_name.insert(name.to_string(), constant.clone());
        log::trace!("constant pool {:?}: minted {name:?} as id {id}", self.name);
        constant
    }

    /// Mint a brand-new constant for `name`; fails if `name` is already
    /// registered in this pool.
    pub fn new_instance(&self, name: &str) -> CoreResult<Constant> {
        let mut by_name = self.by_name.lock().unwrap();
        if by_name.contains_key(name) {
            return Err(CoreError::OutOfRange {
                reason: "constant name already registered in this pool",
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let constant = Constant::new(id, name.to_string());
        by_name.insert(name.to_string(), constant.clone());
        Ok(constant)
    }

    /// Whether `name` has already been minted in this pool.
    pub fn exists(&self, name: &str) -> bool {
        self.by_name.lock().unwrap().contains_key(name)
    }
}

fn signal_pool() -> &'static ConstantPool {
    static POOL: std::sync::OnceLock<ConstantPool> = std::sync::OnceLock::new();
    POOL.get_or_init(|| ConstantPool::new("Signal"))
}

/// A named, identity-comparable sentinel minted from its own process-wide
/// pool — the same `value_of`/`new_instance`/`exists` shape as
/// [`crate::attribute::AttributeKey`], but untyped: a `Signal` carries no
/// associated value, it only marks a distinguished point (e.g. "no value
/// yet" versus "explicitly set to `None`").
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Signal {
    constant: Constant,
}

impl Signal {
    pub fn value_of(name: &str) -> Self {
        Self {
            constant: signal_pool().value_of(name),
        }
    }

    pub fn new_instance(name: &str) -> CoreResult<Self> {
        Ok(Self {
            constant: signal_pool().new_instance(name)?,
        })
    }

    pub fn exists(name: &str) -> bool {
        signal_pool().exists(name)
    }

    pub fn name(&self) -> &str {
        self.constant.name()
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signal({})", self.constant.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_is_identity_comparable_like_a_constant() {
        let a = Signal::value_of("corenet.tests.eof");
        let b = Signal::value_of("corenet.tests.eof");
        let c = Signal::value_of("corenet.tests.timeout");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(Signal::exists("corenet.tests.eof"));
        assert!(Signal::new_instance("corenet.tests.eof").is_err());
    }

    #[test]
    fn value_of_is_idempotent_per_name() {
        let pool = ConstantPool::new("test");
        let a = pool.value_of("x");
        let b = pool.value_of("x");
        let c = pool.value_of("y");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn new_instance_rejects_existing_names() {
        let pool = ConstantPool::new("test");
        pool.value_of("x");
        assert!(pool.new_instance("x").is_err());
        assert!(pool.new_instance("z").is_ok());
    }

    #[test]
    fn comparison_is_a_total_order_reflexive_on_self() {
        let pool = ConstantPool::new("test");
        let a = pool.value_of("a");
        assert_eq!(a.cmp(&a), std::cmp::Ordering::Equal);

        let b = pool.value_of("b");
        assert_ne!(a.cmp(&b), std::cmp::Ordering::Equal);
        assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
    }

    #[test]
    fn exists_reflects_pool_state() {
        let pool = ConstantPool::new("test");
        assert!(!pool.exists("x"));
        pool.value_of("x");
        assert!(pool.exists("x"));
    }
}

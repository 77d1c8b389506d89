//! # corenet-core
//!
//! Core concurrency primitives for a Netty-style async network transport:
//! a lock-free MPSC queue, atomic reference counting, an interned constant
//! pool with a lock-striped attribute map built on top of it, a hashed-wheel
//! timer, and a single-thread cooperative event loop.
//!
//! These are the load-bearing primitives a channel/pipeline layer is built
//! from, not the transport itself — no sockets, no codecs, no pipeline live
//! here.
//!
//! ## Quick start
//!
//! ```
//! use corenet_core::queue::MpscQueue;
//!
//! let q = MpscQueue::new();
//! q.enqueue(1);
//! q.enqueue(2);
//! assert_eq!(q.dequeue(), Some(1));
//! assert_eq!(q.dequeue(), Some(2));
//! ```
//!
//! ## Architecture
//!
//! `MpscQueue` (§ [`queue`]) underlies both worker loops: the event loop's
//! task queue and the timer's submission/cancellation queues. `RefCounted`
//! (§ [`refcount`]) is the contract pooled buffers implement. `Constant` and
//! `ConstantPool` (§ [`constant`]) mint the interned, identity-comparable
//! keys that `AttributeMap` (§ [`attribute`]) indexes by. `HashedWheelTimer`
//! (§ [`timer`]) and `EventLoop` (§ [`executor`]) are each driven by their
//! own dedicated worker thread.

pub mod attribute;
pub mod config;
pub mod constant;
pub mod error;
pub mod executor;
pub mod pad;
pub mod queue;
pub mod refcount;
pub mod timer;

pub use attribute::{Attribute, AttributeKey, AttributeMap};
pub use config::{LoopConfig, TimerConfig};
pub use constant::{Constant, ConstantPool, Signal};
pub use error::{CoreError, CoreResult};
pub use executor::{EventLoop, ScheduledHandle, Termination};
pub use pad::CachePadded;
pub use queue::{MpscQueue, QueueDepth};
pub use refcount::{RefCounted, ReferenceCounted};
pub use timer::{HashedWheelTimer, TimeoutHandle, TimerSnapshot};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

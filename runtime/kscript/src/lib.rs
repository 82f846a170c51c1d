//! kscript - Kernel objects and embedded script runtimes
//!
//! # Purpose
//! Hosts isolated script interpreters inside privileged code and lets them
//! share data through reference-counted objects. A shared table gives any
//! number of runtimes lock-free lookups of those objects.
//!
//! # Integration Points
//! - Depends on: `kscript-lang` for the interpreter
//! - Provides to: host code embedding runtimes, and `kscript-ctl`
//! - Memory: every object, table entry and interpreter allocation is
//!   charged to a [`KernelMemory`] pool
//! - Context: code that may block checks [`context::might_sleep`] first
//!
//! # Architecture
//! Every shared thing is an [`Object`]: a refcounted handle tagged with a
//! static [`Class`]. The class's sleep flag decides whether the object's
//! payload is guarded by a mutex or a spin lock, and whether its
//! allocations may block. Two classes are built on top:
//!
//! - [`SharedTable`] maps byte keys to objects. Readers run inside an epoch
//!   read section and never block; writers serialize on the table's lock
//!   and retire old entries for deferred reclamation.
//! - [`Runtime`] owns an interpreter state whose allocator is bridged to
//!   kernel memory. Non-sleep runtimes switch to atomic allocations once
//!   their bootstrap script has run.
//!
//! # Testing Strategy
//! - Unit tests: allocation flags, lock selection, object lifetimes, table
//!   operations, runtime lifecycle
//! - Integration tests: concurrent readers and writers, cross-runtime
//!   sharing, reclamation and release callbacks
//! - Benchmarks: table lookups and updates (`benches/rcu.rs`)

pub mod bind;
pub mod class;
pub mod config;
pub mod context;
mod error;
pub mod kmem;
pub mod lock;
pub mod object;
pub mod rcu;
pub mod registry;
pub mod runtime;

pub use class::{Class, ClassFlags, Method, Operation};
pub use config::{Config, MemoryLimits};
pub use error::{Error, ErrorKind, Result};
pub use kmem::{Allocation, Extent, Gfp, KernelMemory, MemoryStats};
pub use lock::{LockKind, ObjectLock};
pub use object::Object;
pub use rcu::SharedTable;
pub use registry::Registry;
pub use runtime::{
    DirLoader, Environment, MemoryLoader, Outcome, Runtime, RuntimeState, ScriptLoader, Transfer,
};

use static_assertions::assert_impl_all;

assert_impl_all!(Object: Send, Sync, Clone);
assert_impl_all!(SharedTable: Send, Sync, Clone);
assert_impl_all!(Runtime: Send, Sync);
assert_impl_all!(KernelMemory: Send, Sync);

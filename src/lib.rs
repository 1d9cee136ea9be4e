//! Numasight is a hardware-agnostic NUMA profiler runtime. An external
//! compile-time pass instruments every load and store of the target program
//! to call into this crate, and an allocator interception layer reports
//! object lifetimes. The runtime shadows the target's address space, keeps
//! cheap per-page counters, escalates hot cache lines to detailed per-thread
//! records, and diagnoses every heap object when it dies: cache-line
//! false/true sharing, page-level sharing across threads, and sharing caused
//! by allocator placement rather than the application's own data layout.
//!
//! The crate itself creates no threads and performs no blocking I/O until
//! report emission at process exit. All hooks run inline on the caller's
//! thread; see [`api`] for the hook contracts.

extern crate libc;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod util;

pub mod shadow;

pub mod record;

pub mod registry;

pub mod diagnose;

pub mod profiler;

pub mod api;

pub use crate::record::AccessKind;
pub use crate::util::address::Address;

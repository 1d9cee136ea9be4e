//! The C ABI hook surface. The compile-time instrumentation pass, the
//! allocator interception layer, the `pthread_create` wrapper and the
//! page-fault signal handler call these; nothing else should.
//!
//! Contract: `numasight_init` runs before any other hook. Every other hook
//! is safe to call at any time; calls arriving before initialization (for
//! example from dynamic-loader setup code) are dropped. No hook ever
//! propagates an error into the host program.

use crate::profiler;
use crate::record::{AccessKind, CallSite};
use crate::util::Address;

/// Initialize the engine: shadow maps, registry and atomic state. Must be
/// called before any other hook, once.
#[no_mangle]
pub extern "C" fn numasight_init() {
    profiler::initialize();
}

/// Called inside the thread creation wrapper, on the new thread. Assigns the
/// thread its dense id and caches it in thread-local storage. If `tid_slot`
/// is non-null the id is also stored there. Returns the id.
#[no_mangle]
pub extern "C" fn numasight_thread_start(tid_slot: *mut u16) -> u16 {
    if !profiler::is_initialized() {
        return crate::util::constants::THREAD_ID_UNASSIGNED;
    }
    let id = profiler::singleton().register_thread();
    if !tid_slot.is_null() {
        unsafe { *tid_slot = id };
    }
    id
}

/// Called after the real allocator returns. Registers the object under its
/// allocation site and marks the cache lines its boundaries fall into.
#[no_mangle]
pub extern "C" fn numasight_malloc(addr: usize, size: usize, call_site: CallSite) {
    if !profiler::is_initialized() {
        return;
    }
    let addr = unsafe { Address::from_usize(addr) };
    profiler::singleton().on_malloc(addr, size, call_site);
}

/// Called before delegating to the real free. Diagnoses and unregisters the
/// object; unknown addresses are dropped.
#[no_mangle]
pub extern "C" fn numasight_free(addr: usize) {
    if !profiler::is_initialized() {
        return;
    }
    let addr = unsafe { Address::from_usize(addr) };
    profiler::singleton().on_free(addr);
}

/// The access hook, inserted before every load and store. `kind` is 0 for a
/// read and anything else for a write.
#[no_mangle]
pub extern "C" fn numasight_access(addr: usize, kind: u32) {
    if !profiler::is_initialized() {
        return;
    }
    let kind = if kind == 0 {
        AccessKind::Read
    } else {
        AccessKind::Write
    };
    let addr = unsafe { Address::from_usize(addr) };
    profiler::singleton().on_access(addr, kind);
}

/// Shorthand for the sized load callbacks the instrumentation pass emits.
/// The access size does not influence attribution.
#[no_mangle]
pub extern "C" fn numasight_load(addr: usize) {
    numasight_access(addr, 0);
}

/// Shorthand for the sized store callbacks the instrumentation pass emits.
#[no_mangle]
pub extern "C" fn numasight_store(addr: usize) {
    numasight_access(addr, 1);
}

/// Called by the page-fault signal handler with the faulting address and the
/// dense id of the faulting thread. Fixes the page's first-touch thread if
/// no access beat the signal to it.
#[no_mangle]
pub extern "C" fn numasight_first_touch(addr: usize, thread: u16) {
    if !profiler::is_initialized() {
        return;
    }
    let addr = unsafe { Address::from_usize(addr) };
    profiler::singleton().on_first_touch(addr, thread);
}

/// Registered with `atexit`. Emits the report.
#[no_mangle]
pub extern "C" fn numasight_exit() {
    if !profiler::is_initialized() {
        return;
    }
    crate::diagnose::report::emit(profiler::singleton());
}

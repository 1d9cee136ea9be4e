use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

lazy_static! {
    static ref SERIAL_TEST_LOCK: Mutex<()> = Mutex::new(());
}

/// Run a test that touches process-wide state (the engine singleton, the
/// environment, the dense thread id counter) while holding a global lock, so
/// such tests never interleave.
pub fn serial_test<F>(f: F)
where
    F: FnOnce(),
{
    let guard = SERIAL_TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    f();
    drop(guard);
}

/// Run a test body, then a cleanup, propagating a test panic only after the
/// cleanup has run.
pub fn with_cleanup<T, C>(test: T, cleanup: C)
where
    T: FnOnce(),
    C: FnOnce(),
{
    let result = panic::catch_unwind(AssertUnwindSafe(test));
    cleanup();
    if let Err(e) = result {
        panic::resume_unwind(e);
    }
}

//! Process-wide Tokio runtime used to drive the async engine from the
//! blocking array handle API.

use std::io;
use std::sync::{Arc, OnceLock};

use tokio::runtime::{Builder, Runtime};

pub(crate) fn new_runtime() -> io::Result<Runtime> {
    Builder::new_multi_thread().enable_all().build()
}

static GLOBAL_RUNTIME: OnceLock<Arc<Runtime>> = OnceLock::new();

/// Shared multi-threaded runtime, created on first use.
///
/// Callers must not block on it from inside one of its own worker threads.
pub fn global_runtime() -> io::Result<Arc<Runtime>> {
    if let Some(rt) = GLOBAL_RUNTIME.get() {
        return Ok(Arc::clone(rt));
    }

    let rt = Arc::new(new_runtime()?);

    // If we win the race, keep our runtime.
    if GLOBAL_RUNTIME.set(Arc::clone(&rt)).is_ok() {
        return Ok(rt);
    }

    // Lost the race; use the runtime that won.
    match GLOBAL_RUNTIME.get() {
        Some(rt) => Ok(Arc::clone(rt)),
        None => Err(io::Error::other("failed to initialize global Tokio runtime")),
    }
}

//! Single-threaded runtime helpers.
//!
//! The whole crate runs on one logical execution context: a current-thread
//! tokio runtime driving a `LocalSet`. Nothing here is `Send` and nothing
//! ever migrates across threads, so no two callbacks are ever live at once —
//! interleaving happens only at `.await` points.
//!
//! Everything that spawns (the tick worker, connection reader/writer tasks,
//! the server accept loop) must run inside [`run_local`] or an equivalent
//! `LocalSet` context.

use std::future::Future;
use std::io;

use tokio::task::{JoinHandle, LocalSet};

/// Run a future to completion on a fresh current-thread runtime.
pub fn run_local<F: Future>(future: F) -> io::Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = LocalSet::new();
    Ok(runtime.block_on(local.run_until(future)))
}

/// Spawn a task on the current thread.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    tokio::task::spawn_local(future)
}

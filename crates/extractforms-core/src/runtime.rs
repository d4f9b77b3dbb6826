//! Running async pipeline code from synchronous callers.

use std::future::Future;

use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};

use crate::CoreError;

fn build_runtime() -> Result<Runtime, CoreError> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| CoreError::AsyncExecution(format!("failed to start runtime: {e}")))
}

/// Drive `future` to completion from synchronous code.
///
/// - No runtime on this thread: a private current-thread runtime runs it in place.
/// - Inside a multi-thread runtime: the worker is handed off with `block_in_place`
///   and the future runs on the caller's runtime.
/// - Inside a current-thread runtime: the future runs on a scoped thread with its
///   own runtime, since blocking the only worker would deadlock.
pub fn run_blocking<F>(future: F) -> Result<F::Output, CoreError>
where
    F: Future + Send,
    F::Output: Send,
{
    let Ok(handle) = Handle::try_current() else {
        return Ok(build_runtime()?.block_on(future));
    };

    if handle.runtime_flavor() == RuntimeFlavor::MultiThread {
        return Ok(tokio::task::block_in_place(|| handle.block_on(future)));
    }

    std::thread::scope(|scope| {
        scope
            .spawn(|| build_runtime().map(|rt| rt.block_on(future)))
            .join()
            .map_err(|_| CoreError::AsyncExecution("background runtime thread panicked".into()))?
    })
}

use crate::error::{FailureLatch, PipelineError, Result};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{Builder, JoinHandle};

/// Spawn a named pipeline thread.
///
/// Errors and panics from `body` trip the latch, which cancels the whole
/// pipeline, so the handle itself only ever yields `()`.
pub(crate) fn spawn_task<F>(name: String, latch: FailureLatch, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let task = name.clone();
    Builder::new()
        .name(name)
        .spawn(move || match catch_unwind(AssertUnwindSafe(body)) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => latch.trip(err),
            Err(payload) => latch.trip(PipelineError::Panicked {
                task,
                message: panic_message(payload.as_ref()),
            }),
        })
        .map_err(|e| PipelineError::ThreadError(e.to_string()))
}

/// Join a task, reporting an escaped panic through the latch
pub(crate) fn join_task(name: &str, handle: JoinHandle<()>, latch: &FailureLatch) {
    if let Err(payload) = handle.join() {
        latch.trip(PipelineError::Panicked {
            task: name.to_string(),
            message: panic_message(payload.as_ref()),
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

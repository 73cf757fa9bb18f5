use crate::error::TaskError;
use crate::task::{Callable, TaskOutcome, TaskOutput};

use std::panic::AssertUnwindSafe;

use tracing::{error, trace};

/// Runs callables on the runtime's blocking thread set, admission-bounded by
/// the owning pool's semaphore.
///
/// A panic inside the callable is caught and stored on the handle; the
/// worker thread and the pool keep going. There is no forceful cancellation
/// of a closure that has already started, only the queued-cancel path in
/// the pool's worker loop.
#[derive(Debug, Default)]
pub(crate) struct ThreadBackend;

impl ThreadBackend {
  pub(crate) async fn execute(&self, task_id: u64, callable: Callable) -> TaskOutcome {
    let joined = tokio::task::spawn_blocking(move || {
      std::panic::catch_unwind(AssertUnwindSafe(callable))
    })
    .await;

    match joined {
      Ok(Ok(Ok(value))) => {
        trace!(%task_id, "Callable completed.");
        Ok(TaskOutput::Value(value))
      }
      Ok(Ok(Err(message))) => {
        trace!(%task_id, "Callable returned an error.");
        Err(TaskError::Job(message))
      }
      Ok(Err(panic_payload)) => {
        let message = panic_message(panic_payload.as_ref());
        error!(%task_id, "Callable panicked: {}", message);
        Err(TaskError::Panicked(message))
      }
      Err(join_error) => {
        error!(%task_id, "Blocking task could not be joined: {}", join_error);
        Err(TaskError::WorkerCrashed(join_error.to_string()))
      }
    }
  }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}

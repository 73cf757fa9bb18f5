use crate::config::PoolKind;
use crate::error::TaskError;
use crate::task::{TaskOutcome, TaskOutput, TaskState};

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

struct CellInner {
  state: TaskState,
  outcome: Option<TaskOutcome>,
  finished_at: Option<Instant>,
}

/// Shared completion cell for one task.
///
/// The pool's executor writes the terminal outcome exactly once; any number
/// of waiters read it. The state transition is published under the mutex
/// before `done` is notified, so a waiter woken by the notification always
/// observes the outcome.
pub(crate) struct TaskCell {
  id: u64,
  label: Option<String>,
  created_at: Instant,
  inner: Mutex<CellInner>,
  done: Notify,
}

impl TaskCell {
  pub(crate) fn new(id: u64, label: Option<String>) -> Arc<Self> {
    Arc::new(Self {
      id,
      label,
      created_at: Instant::now(),
      inner: Mutex::new(CellInner {
        state: TaskState::Pending,
        outcome: None,
        finished_at: None,
      }),
      done: Notify::new(),
    })
  }

  pub(crate) fn id(&self) -> u64 {
    self.id
  }

  pub(crate) fn label(&self) -> Option<&str> {
    self.label.as_deref()
  }

  pub(crate) fn state(&self) -> TaskState {
    self.inner.lock().state
  }

  pub(crate) fn outcome(&self) -> Option<TaskOutcome> {
    self.inner.lock().outcome.clone()
  }

  /// Marks the task running. Returns `false` if it already reached a
  /// terminal state (i.e. was cancelled while queued).
  pub(crate) fn mark_running(&self) -> bool {
    let mut inner = self.inner.lock();
    if inner.state.is_terminal() {
      return false;
    }
    inner.state = TaskState::Running;
    true
  }

  /// Cancels a task that has not started. Returns `false` once the task is
  /// running or terminal.
  pub(crate) fn try_cancel_pending(&self) -> bool {
    {
      let mut inner = self.inner.lock();
      if inner.state != TaskState::Pending {
        return false;
      }
      inner.state = TaskState::Cancelled;
      inner.outcome = Some(Err(TaskError::Cancelled));
      inner.finished_at = Some(Instant::now());
    }
    self.done.notify_waiters();
    true
  }

  /// Publishes the terminal outcome. The first call wins; later calls are
  /// ignored so racing writers (executor vs. queued-cancel) stay safe.
  pub(crate) fn finish(&self, outcome: TaskOutcome) {
    {
      let mut inner = self.inner.lock();
      if inner.state.is_terminal() {
        trace!(task_id = %self.id, "finish: already terminal, outcome dropped");
        return;
      }
      inner.state = match &outcome {
        Ok(_) => TaskState::Completed,
        Err(TaskError::Cancelled) => TaskState::Cancelled,
        Err(_) => TaskState::Failed,
      };
      inner.outcome = Some(outcome);
      inner.finished_at = Some(Instant::now());
    }
    self.done.notify_waiters();
  }

  /// Submission-to-terminal duration, or time since submission while the
  /// task is still pending or running.
  pub(crate) fn elapsed(&self) -> Duration {
    let finished_at = self.inner.lock().finished_at;
    match finished_at {
      Some(finished_at) => finished_at.duration_since(self.created_at),
      None => self.created_at.elapsed(),
    }
  }

  pub(crate) async fn wait_done(&self) -> TaskOutcome {
    loop {
      // Register for notification before checking, so a finish between the
      // check and the await cannot be missed.
      let notified = self.done.notified();
      if let Some(outcome) = self.outcome() {
        return outcome;
      }
      notified.await;
    }
  }
}

/// A handle to one submitted task.
///
/// Created by [`Pool::submit`](crate::Pool::submit) and held by the caller.
/// Waiting does not consume the handle, so a timed-out `wait` can simply be
/// retried.
pub struct TaskHandle {
  pub(crate) cell: Arc<TaskCell>,
  pub(crate) token: CancellationToken,
  pub(crate) kind: PoolKind,
}

impl TaskHandle {
  /// Unique id of this submission.
  pub fn id(&self) -> u64 {
    self.cell.id()
  }

  /// Human-readable label, e.g. the command line for shell tasks.
  pub fn label(&self) -> Option<&str> {
    self.cell.label()
  }

  pub fn state(&self) -> TaskState {
    self.cell.state()
  }

  /// Non-blocking terminal-state check.
  pub fn is_done(&self) -> bool {
    self.cell.state().is_terminal()
  }

  /// Wall-clock time from submission to the terminal state, or time spent
  /// so far for a task that is not terminal yet.
  pub fn elapsed(&self) -> Duration {
    self.cell.elapsed()
  }

  /// Waits until the task reaches a terminal state, or until `timeout`
  /// elapses.
  ///
  /// On timeout, returns [`TaskError::Timeout`] without touching the task:
  /// it keeps running and this handle can be waited on again. A zero
  /// timeout is a non-blocking poll of the outcome.
  pub async fn wait(&self, timeout: Option<Duration>) -> Result<TaskOutput, TaskError> {
    match timeout {
      None => self.cell.wait_done().await,
      Some(limit) => match tokio::time::timeout(limit, self.cell.wait_done()).await {
        Ok(outcome) => outcome,
        Err(_) => Err(TaskError::Timeout),
      },
    }
  }

  /// Requests cancellation, best-effort.
  ///
  /// A task still queued is cancelled deterministically and this returns
  /// `true`. For a running task the answer depends on the backend: process
  /// and shell backends terminate the underlying OS process (`true`); the
  /// thread backend cannot stop a running closure and the remote backend
  /// only sends an advisory cancel message (both `false`).
  pub fn cancel(&self) -> bool {
    if self.cell.try_cancel_pending() {
      debug!(task_id = %self.id(), "Cancelled before execution started.");
      self.token.cancel();
      return true;
    }
    if self.is_done() {
      return false;
    }
    debug!(task_id = %self.id(), kind = self.kind.as_str(), "Cancellation requested for running task.");
    self.token.cancel();
    matches!(self.kind, PoolKind::Process | PoolKind::Shell)
  }
}

impl std::fmt::Debug for TaskHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TaskHandle")
      .field("id", &self.id())
      .field("label", &self.label())
      .field("state", &self.state())
      .finish()
  }
}

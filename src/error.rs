use thiserror::Error;

/// Errors raised synchronously by pool operations (`submit`, `wait_all`,
/// registry lookups). Everything that happens to a task *after* admission is
/// reported through [`TaskError`] on its handle instead.
#[derive(Error, Debug, PartialEq)]
pub enum PoolError {
  #[error("Pool is shut down or shutting down, cannot accept new tasks")]
  PoolClosed,

  #[error("Work unit rejected at submission: {0}")]
  InvalidWork(String),

  #[error("Pool's internal admission queue was closed unexpectedly")]
  QueueClosed,

  #[error("Timed out waiting for outstanding tasks")]
  WaitTimeout,

  #[error("Pool configuration is invalid: {0}")]
  InvalidConfig(String),
}

/// Per-task failure taxonomy, captured on the task's handle.
///
/// These are data, not control flow: every variant is stored in the handle's
/// completion cell and returned (cloned) from `wait`. The one exception is
/// [`TaskError::Timeout`], which is produced by `wait` itself when its
/// deadline elapses; it is never stored, and the task keeps running.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
  #[error("Payload could not cross the process/network boundary: {0}")]
  Serialization(String),

  #[error("Backend worker died unexpectedly: {0}")]
  WorkerCrashed(String),

  #[error("Command could not be started: {0}")]
  Launch(String),

  #[error("Command exited with code {code}: {stderr}")]
  NonZeroExit {
    code: i32,
    stdout: String,
    stderr: String,
  },

  #[error("Remote node unreachable or failed mid-task: {0}")]
  RemoteUnavailable(String),

  #[error("Wait deadline elapsed before the task reached a terminal state")]
  Timeout,

  #[error("Task was cancelled")]
  Cancelled,

  #[error("Task panicked during execution: {0}")]
  Panicked(String),

  #[error("Task reported a failure: {0}")]
  Job(String),

  #[error("Cancellation was requested but the task could not be stopped: {0}")]
  CancellationFailed(String),
}

use crate::error::TaskError;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

/// Values that cross the pool boundary.
///
/// In-process callables produce one directly; process and remote backends
/// transport it as JSON. This is the explicit serialization capability
/// boundary: a payload is submittable iff serde_json can represent it.
pub type TaskValue = serde_json::Value;

/// What a callable returns. An `Err` becomes [`TaskError::Job`] on the handle.
pub type CallableResult = Result<TaskValue, String>;

/// A blocking callable executed by the thread backend.
pub type Callable = Box<dyn FnOnce() -> CallableResult + Send + 'static>;

/// Lifecycle of a submitted task. Terminal states are reached exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
  Pending,
  Running,
  Completed,
  Failed,
  Cancelled,
}

impl TaskState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
  }
}

/// Captured output of a finished shell command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
  pub stdout: String,
  /// Retained for diagnostics even on success.
  pub stderr: String,
  pub exit_code: i32,
}

/// The success payload of a task, by backend family.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
  /// Value produced by a callable or a process/remote job.
  Value(TaskValue),
  /// Captured streams and exit code of a shell command.
  Command(CommandOutput),
}

impl TaskOutput {
  pub fn into_value(self) -> Option<TaskValue> {
    match self {
      TaskOutput::Value(v) => Some(v),
      TaskOutput::Command(_) => None,
    }
  }

  pub fn into_command(self) -> Option<CommandOutput> {
    match self {
      TaskOutput::Command(c) => Some(c),
      TaskOutput::Value(_) => None,
    }
  }
}

/// Terminal result of a task as observed through its handle.
pub type TaskOutcome = Result<TaskOutput, TaskError>;

/// An external command to run as a child process.
///
/// The command line is split on whitespace into program and arguments; no
/// shell interpretation happens unless [`CommandSpec::shell`] is set, in
/// which case the whole line is handed to `sh -c`.
#[derive(Debug, Clone)]
pub struct CommandSpec {
  pub line: String,
  pub cwd: Option<PathBuf>,
  pub env: HashMap<String, String>,
  pub use_shell: bool,
}

impl CommandSpec {
  pub fn new(line: impl Into<String>) -> Self {
    Self {
      line: line.into(),
      cwd: None,
      env: HashMap::new(),
      use_shell: false,
    }
  }

  pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
    self.cwd = Some(dir.into());
    self
  }

  pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.env.insert(key.into(), value.into());
    self
  }

  /// Run the line through `sh -c` instead of direct exec. Launch failures of
  /// the command itself then surface as non-zero exits (127), not `Launch`.
  pub fn shell(mut self) -> Self {
    self.use_shell = true;
    self
  }
}

/// A named job plus serde-encoded arguments, for the process and remote
/// backends. Encoding failures are kept and surfaced on the handle at
/// execution time rather than failing `submit`.
pub struct JobCall {
  pub name: String,
  pub(crate) args: Result<TaskValue, String>,
}

impl JobCall {
  pub fn new<A: Serialize>(name: impl Into<String>, args: &A) -> Self {
    Self {
      name: name.into(),
      args: serde_json::to_value(args).map_err(|e| e.to_string()),
    }
  }

  pub(crate) fn encoded_args(&self) -> Result<TaskValue, TaskError> {
    self.args.clone().map_err(TaskError::Serialization)
  }
}

impl fmt::Debug for JobCall {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobCall")
      .field("name", &self.name)
      .field("args_ok", &self.args.is_ok())
      .finish()
  }
}

/// One unit of work submitted to a pool. Each backend accepts exactly one
/// variant; a mismatch is rejected synchronously by `submit`.
pub struct WorkUnit {
  pub(crate) payload: WorkPayload,
  pub(crate) label: Option<String>,
}

pub(crate) enum WorkPayload {
  Callable(Callable),
  Job(JobCall),
  Command(CommandSpec),
}

impl WorkUnit {
  /// A blocking callable for the thread backend. The return value is carried
  /// to the handle through serde, keeping the value contract identical to
  /// the process and remote backends.
  pub fn callable<F, R>(f: F) -> Self
  where
    F: FnOnce() -> R + Send + 'static,
    R: Serialize,
  {
    Self::try_callable(move || Ok(f()))
  }

  /// Like [`WorkUnit::callable`], but the callable may fail with a message
  /// that surfaces as [`TaskError::Job`].
  pub fn try_callable<F, R>(f: F) -> Self
  where
    F: FnOnce() -> Result<R, String> + Send + 'static,
    R: Serialize,
  {
    let boxed: Callable = Box::new(move || {
      let value = f()?;
      serde_json::to_value(value).map_err(|e| format!("result not serializable: {}", e))
    });
    Self {
      payload: WorkPayload::Callable(boxed),
      label: None,
    }
  }

  /// A named job for the process or remote backend.
  pub fn job<A: Serialize>(name: impl Into<String>, args: &A) -> Self {
    let call = JobCall::new(name, args);
    let label = call.name.clone();
    Self {
      payload: WorkPayload::Job(call),
      label: Some(label),
    }
  }

  /// A command line for the shell backend. The label defaults to the line.
  pub fn command(spec: CommandSpec) -> Self {
    let label = spec.line.clone();
    Self {
      payload: WorkPayload::Command(spec),
      label: Some(label),
    }
  }

  /// Shorthand for [`WorkUnit::command`] from a bare command line.
  pub fn command_line(line: impl Into<String>) -> Self {
    Self::command(CommandSpec::new(line))
  }

  pub fn with_label(mut self, label: impl Into<String>) -> Self {
    self.label = Some(label.into());
    self
  }

  pub(crate) fn kind_str(&self) -> &'static str {
    match self.payload {
      WorkPayload::Callable(_) => "callable",
      WorkPayload::Job(_) => "job",
      WorkPayload::Command(_) => "command",
    }
  }
}

impl fmt::Debug for WorkUnit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkUnit")
      .field("kind", &self.kind_str())
      .field("label", &self.label)
      .finish()
  }
}

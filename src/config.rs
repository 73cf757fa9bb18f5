use std::time::Duration;

/// The execution backend a pool dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
  /// In-process blocking callables on a bounded set of worker threads.
  Thread,
  /// Serialized jobs on persistent local worker child processes.
  Process,
  /// External command lines run as child processes with captured output.
  Shell,
  /// Serialized jobs dispatched to remote worker nodes over TCP.
  Remote,
}

impl PoolKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      PoolKind::Thread => "thread",
      PoolKind::Process => "process",
      PoolKind::Shell => "shell",
      PoolKind::Remote => "remote",
    }
  }
}

/// Configuration for a pool.
///
/// The concurrency bound and worker-node list are supplied by the caller;
/// the pool never discovers CPU counts or cluster topology on its own. Use
/// `std::thread::available_parallelism()` (or equivalent) at the call site
/// if a machine-sized bound is wanted.
#[derive(Debug, Clone)]
pub struct PoolConfig {
  /// Name identifying this pool in the registry. Repeated registry requests
  /// with the same (kind, name) return the same pool instance.
  pub name: String,
  /// Maximum number of simultaneously executing tasks.
  pub concurrency: usize,
  /// Capacity of the admission queue. Submissions beyond this backlog wait
  /// for a slot; workers themselves stay strictly bounded by `concurrency`.
  pub queue_capacity: usize,
  /// Command line used to spawn worker child processes (process backend).
  pub worker_command: Vec<String>,
  /// Worker node endpoints, `host:port` (remote backend).
  pub endpoints: Vec<String>,
  /// How long a cancelled shell command gets to exit after SIGTERM before
  /// it is forcefully killed.
  pub grace_period: Duration,
}

impl PoolConfig {
  pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
    Self {
      name: name.into(),
      concurrency: concurrency.max(1),
      queue_capacity: 256,
      worker_command: Vec::new(),
      endpoints: Vec::new(),
      grace_period: Duration::from_secs(2),
    }
  }

  pub fn queue_capacity(mut self, capacity: usize) -> Self {
    self.queue_capacity = capacity.max(1);
    self
  }

  /// Worker program (argv form) for the process backend.
  pub fn worker_command<I, S>(mut self, argv: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.worker_command = argv.into_iter().map(Into::into).collect();
    self
  }

  /// Worker node endpoints for the remote backend.
  pub fn endpoints<I, S>(mut self, endpoints: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.endpoints = endpoints.into_iter().map(Into::into).collect();
    self
  }

  pub fn grace_period(mut self, grace: Duration) -> Self {
    self.grace_period = grace;
    self
  }
}

/// Registry key. The pool name is the configuration identity: repeated
/// requests for the same (kind, name) reuse one pool regardless of other
/// config fields, matching how callers expect "the thread pool" to behave.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
  pub kind: PoolKind,
  pub name: String,
}

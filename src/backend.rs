use crate::config::{PoolConfig, PoolKind};
use crate::error::PoolError;
use crate::process::ProcessBackend;
use crate::remote::RemoteBackend;
use crate::shell::ShellBackend;
use crate::task::{TaskOutcome, WorkPayload, WorkUnit};
use crate::thread::ThreadBackend;

use tokio_util::sync::CancellationToken;

/// The four execution backends behind one `execute` seam. The pool's worker
/// loop never branches on the kind beyond this dispatch; every adapter takes
/// a work payload plus the task's cancellation token and produces a
/// [`TaskOutcome`].
#[derive(Debug)]
pub(crate) enum Backend {
  Thread(ThreadBackend),
  Process(ProcessBackend),
  Shell(ShellBackend),
  Remote(RemoteBackend),
}

impl Backend {
  pub(crate) fn for_config(kind: PoolKind, config: &PoolConfig) -> Result<Self, PoolError> {
    match kind {
      PoolKind::Thread => Ok(Backend::Thread(ThreadBackend)),
      PoolKind::Process => {
        if config.worker_command.is_empty() {
          return Err(PoolError::InvalidConfig(
            "process pool requires a worker command".to_string(),
          ));
        }
        Ok(Backend::Process(ProcessBackend::new(config.worker_command.clone())))
      }
      PoolKind::Shell => Ok(Backend::Shell(ShellBackend::new(config.grace_period))),
      PoolKind::Remote => {
        if config.endpoints.is_empty() {
          return Err(PoolError::InvalidConfig(
            "remote pool requires at least one endpoint".to_string(),
          ));
        }
        Ok(Backend::Remote(RemoteBackend::new(config.endpoints.clone())))
      }
    }
  }

  /// Synchronous admission check: the work variant must match the backend
  /// and command lines must be non-empty.
  pub(crate) fn validate(&self, work: &WorkUnit) -> Result<(), PoolError> {
    match (self, &work.payload) {
      (Backend::Thread(_), WorkPayload::Callable(_)) => Ok(()),
      (Backend::Process(_) | Backend::Remote(_), WorkPayload::Job(_)) => Ok(()),
      (Backend::Shell(_), WorkPayload::Command(spec)) => {
        if spec.line.trim().is_empty() {
          Err(PoolError::InvalidWork("empty command line".to_string()))
        } else {
          Ok(())
        }
      }
      _ => Err(PoolError::InvalidWork(format!(
        "{} work is not accepted by a {} pool",
        work.kind_str(),
        self.kind().as_str()
      ))),
    }
  }

  pub(crate) fn kind(&self) -> PoolKind {
    match self {
      Backend::Thread(_) => PoolKind::Thread,
      Backend::Process(_) => PoolKind::Process,
      Backend::Shell(_) => PoolKind::Shell,
      Backend::Remote(_) => PoolKind::Remote,
    }
  }

  pub(crate) async fn execute(
    &self,
    task_id: u64,
    payload: WorkPayload,
    token: &CancellationToken,
  ) -> TaskOutcome {
    match (self, payload) {
      (Backend::Thread(backend), WorkPayload::Callable(callable)) => {
        backend.execute(task_id, callable).await
      }
      (Backend::Process(backend), WorkPayload::Job(call)) => {
        backend.execute(task_id, call, token).await
      }
      (Backend::Shell(backend), WorkPayload::Command(spec)) => {
        backend.execute(task_id, spec, token).await
      }
      (Backend::Remote(backend), WorkPayload::Job(call)) => {
        backend.execute(task_id, call, token).await
      }
      // validate() rejects mismatches at submission.
      _ => unreachable!("work payload mismatched with backend"),
    }
  }

  /// Releases backend-held resources on pool shutdown.
  pub(crate) fn close(&self) {
    if let Backend::Process(backend) = self {
      backend.close();
    }
  }
}

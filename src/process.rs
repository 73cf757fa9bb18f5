use crate::error::TaskError;
use crate::protocol::{decode_line, encode_line, JobRequest, JobResponse};
use crate::task::{JobCall, TaskOutcome, TaskOutput};

use std::process::Stdio;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// One persistent worker child speaking the job protocol on its stdio.
struct WorkerChild {
  child: Child,
  stdin: ChildStdin,
  stdout: Lines<BufReader<ChildStdout>>,
}

impl WorkerChild {
  fn pid(&self) -> Option<u32> {
    self.child.id()
  }
}

/// Runs serialized jobs on persistent local worker child processes.
///
/// Workers are spawned lazily and leased one per executing task; the pool's
/// concurrency bound therefore also caps the number of live workers. A
/// worker that dies mid-task surfaces that task as `WorkerCrashed` and is
/// simply not returned to the idle set, so the next task gets a fresh one.
pub(crate) struct ProcessBackend {
  worker_command: Vec<String>,
  idle: Mutex<Vec<WorkerChild>>,
}

impl ProcessBackend {
  pub(crate) fn new(worker_command: Vec<String>) -> Self {
    Self {
      worker_command,
      idle: Mutex::new(Vec::new()),
    }
  }

  pub(crate) async fn execute(
    &self,
    task_id: u64,
    call: JobCall,
    token: &CancellationToken,
  ) -> TaskOutcome {
    let args = match call.encoded_args() {
      Ok(args) => args,
      Err(e) => return Err(e),
    };

    let mut worker = match self.lease() {
      Ok(worker) => worker,
      Err(e) => return Err(e),
    };
    trace!(%task_id, pid = ?worker.pid(), job = %call.name, "Dispatching job to worker process.");

    let request = JobRequest::Run {
      id: task_id,
      job: call.name.clone(),
      args,
    };
    let line = match encode_line(&request) {
      Ok(line) => line,
      Err(e) => {
        self.release(worker);
        return Err(e);
      }
    };

    if let Err(e) = worker.stdin.write_all(line.as_bytes()).await {
      warn!(%task_id, "Worker stdin write failed: {}", e);
      kill_worker(worker).await;
      return Err(TaskError::WorkerCrashed(e.to_string()));
    }
    if let Err(e) = worker.stdin.flush().await {
      kill_worker(worker).await;
      return Err(TaskError::WorkerCrashed(e.to_string()));
    }

    // `None` means cancellation won the race while the worker was busy.
    let read_result = tokio::select! {
      biased;
      _ = token.cancelled() => None,
      read_result = worker.stdout.next_line() => Some(read_result),
    };

    let response = match read_result {
      None => {
        debug!(%task_id, pid = ?worker.pid(), "Cancellation requested, killing worker process.");
        kill_worker(worker).await;
        return Err(TaskError::Cancelled);
      }
      Some(Ok(Some(line))) => match decode_line::<JobResponse>(&line) {
        Ok(response) => response,
        Err(e) => {
          warn!(%task_id, "Undecodable worker response, discarding worker: {}", e);
          kill_worker(worker).await;
          return Err(e);
        }
      },
      Some(Ok(None)) => {
        warn!(%task_id, "Worker process closed stdout mid-task.");
        kill_worker(worker).await;
        return Err(TaskError::WorkerCrashed("worker exited before answering".to_string()));
      }
      Some(Err(e)) => {
        warn!(%task_id, "Worker stdout read failed: {}", e);
        kill_worker(worker).await;
        return Err(TaskError::WorkerCrashed(e.to_string()));
      }
    };

    if response.id() != task_id {
      // One request in flight per worker; a mismatched id means the worker
      // broke protocol and cannot be trusted with further tasks.
      warn!(%task_id, got = response.id(), "Worker answered with wrong request id.");
      kill_worker(worker).await;
      return Err(TaskError::WorkerCrashed("protocol violation: response id mismatch".to_string()));
    }

    self.release(worker);
    response.into_outcome().map(TaskOutput::Value)
  }

  fn lease(&self) -> Result<WorkerChild, TaskError> {
    if let Some(worker) = self.idle.lock().pop() {
      return Ok(worker);
    }
    self.spawn_worker()
  }

  fn release(&self, worker: WorkerChild) {
    self.idle.lock().push(worker);
  }

  fn spawn_worker(&self) -> Result<WorkerChild, TaskError> {
    let (program, args) = self
      .worker_command
      .split_first()
      .ok_or_else(|| TaskError::Launch("no worker command configured".to_string()))?;

    let mut child = Command::new(program)
      .args(args)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::inherit())
      .kill_on_drop(true)
      .spawn()
      .map_err(|e| TaskError::Launch(format!("{}: {}", program, e)))?;

    let stdin = child
      .stdin
      .take()
      .ok_or_else(|| TaskError::Launch("worker stdin unavailable".to_string()))?;
    let stdout = child
      .stdout
      .take()
      .ok_or_else(|| TaskError::Launch("worker stdout unavailable".to_string()))?;

    debug!(pid = ?child.id(), command = %program, "Spawned worker process.");
    Ok(WorkerChild {
      child,
      stdin,
      stdout: BufReader::new(stdout).lines(),
    })
  }

  /// Kills all idle workers. Called on pool shutdown; leased workers are
  /// either finishing their task or killed through cancellation.
  pub(crate) fn close(&self) {
    let mut idle = self.idle.lock();
    for mut worker in idle.drain(..) {
      debug!(pid = ?worker.pid(), "Killing idle worker process on shutdown.");
      let _ = worker.child.start_kill();
    }
  }
}

impl std::fmt::Debug for ProcessBackend {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProcessBackend")
      .field("worker_command", &self.worker_command)
      .field("idle_workers", &self.idle.lock().len())
      .finish()
  }
}

async fn kill_worker(mut worker: WorkerChild) {
  let _ = worker.child.start_kill();
  let _ = worker.child.wait().await;
}

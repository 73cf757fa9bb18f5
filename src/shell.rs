use crate::error::TaskError;
use crate::task::{CommandOutput, CommandSpec, TaskOutcome, TaskOutput};

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Runs command lines as child processes with full output capture.
///
/// Exit code 0 maps to `Completed` carrying stdout (stderr retained for
/// diagnostics); a non-zero exit maps to `NonZeroExit`; a spawn failure maps
/// to `Launch`. Cancellation signals SIGTERM to the child's process group
/// and escalates to SIGKILL after the grace period.
#[derive(Debug)]
pub(crate) struct ShellBackend {
  grace_period: Duration,
}

impl ShellBackend {
  pub(crate) fn new(grace_period: Duration) -> Self {
    Self { grace_period }
  }

  pub(crate) async fn execute(
    &self,
    task_id: u64,
    spec: CommandSpec,
    token: &CancellationToken,
  ) -> TaskOutcome {
    let mut command = match build_command(&spec) {
      Ok(command) => command,
      Err(e) => return Err(e),
    };

    let mut child = match command.spawn() {
      Ok(child) => child,
      Err(e) => {
        debug!(%task_id, line = %spec.line, "Command failed to launch: {}", e);
        return Err(TaskError::Launch(format!("{}: {}", spec.line, e)));
      }
    };

    let stdout_reader = capture_stream(child.stdout.take());
    let stderr_reader = capture_stream(child.stderr.take());

    // `None` means cancellation won the race; the child is still running.
    let wait_result = tokio::select! {
      biased;
      _ = token.cancelled() => None,
      wait_result = child.wait() => Some(wait_result),
    };

    let status = match wait_result {
      None => {
        debug!(%task_id, line = %spec.line, "Cancellation requested, terminating child.");
        if let Err(e) = self.terminate(&mut child).await {
          return Err(e);
        }
        drain_reader(stdout_reader).await;
        drain_reader(stderr_reader).await;
        return Err(TaskError::Cancelled);
      }
      Some(Ok(status)) => status,
      Some(Err(e)) => {
        warn!(%task_id, line = %spec.line, "Wait on child failed: {}", e);
        return Err(TaskError::WorkerCrashed(e.to_string()));
      }
    };

    let stdout = drain_reader(stdout_reader).await;
    let stderr = drain_reader(stderr_reader).await;
    // Exits by signal have no code; report them as non-zero failures.
    let exit_code = status.code().unwrap_or(-1);

    trace!(%task_id, %exit_code, "Command finished.");

    if status.success() {
      Ok(TaskOutput::Command(CommandOutput {
        stdout,
        stderr,
        exit_code,
      }))
    } else {
      Err(TaskError::NonZeroExit {
        code: exit_code,
        stdout,
        stderr,
      })
    }
  }

  /// SIGTERM to the child's process group, then SIGKILL after the grace
  /// period if it has not exited.
  async fn terminate(&self, child: &mut Child) -> Result<(), TaskError> {
    if let Some(pid) = child.id() {
      signal_group(pid, libc::SIGTERM);
      match tokio::time::timeout(self.grace_period, child.wait()).await {
        Ok(Ok(_status)) => return Ok(()),
        Ok(Err(e)) => return Err(TaskError::CancellationFailed(e.to_string())),
        Err(_elapsed) => {
          debug!(%pid, "Child ignored SIGTERM, escalating to SIGKILL.");
          signal_group(pid, libc::SIGKILL);
        }
      }
    }
    match child.kill().await {
      Ok(()) => Ok(()),
      Err(e) => Err(TaskError::CancellationFailed(e.to_string())),
    }
  }
}

fn build_command(spec: &CommandSpec) -> Result<Command, TaskError> {
  let mut command = if spec.use_shell {
    let mut c = Command::new("sh");
    c.arg("-c").arg(&spec.line);
    c
  } else {
    let mut parts = spec.line.split_whitespace();
    let program = parts
      .next()
      .ok_or_else(|| TaskError::Launch("empty command line".to_string()))?;
    let mut c = Command::new(program);
    c.args(parts);
    c
  };

  if let Some(cwd) = &spec.cwd {
    command.current_dir(cwd);
  }
  for (key, value) in &spec.env {
    command.env(key, value);
  }

  command
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  // Own process group, so cancellation can signal the whole command tree.
  unsafe {
    command.pre_exec(|| {
      libc::setpgid(0, 0);
      Ok(())
    });
  }

  Ok(command)
}

fn signal_group(pid: u32, signal: libc::c_int) {
  unsafe {
    libc::kill(-(pid as libc::pid_t), signal);
  }
}

fn capture_stream<S>(stream: Option<S>) -> Option<JoinHandle<String>>
where
  S: AsyncReadExt + Unpin + Send + 'static,
{
  stream.map(|mut s| {
    tokio::spawn(async move {
      let mut buf = Vec::new();
      let _ = s.read_to_end(&mut buf).await;
      String::from_utf8_lossy(&buf).into_owned()
    })
  })
}

async fn drain_reader(reader: Option<JoinHandle<String>>) -> String {
  match reader {
    Some(handle) => handle.await.unwrap_or_default(),
    None => String::new(),
  }
}

use crate::error::TaskError;
use crate::protocol::{decode_line, encode_line, JobRequest, JobResponse};
use crate::task::{JobCall, TaskOutcome, TaskOutput};

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Dispatches serialized jobs to remote worker nodes over TCP.
///
/// Endpoints are tried round-robin, one connection per task. A network or
/// node failure mid-task surfaces as `RemoteUnavailable`; there is no
/// automatic retry on another node, since idempotency of arbitrary jobs
/// cannot be assumed. Cancellation writes an advisory `Cancel` message on
/// the task's connection and gives up on the result.
#[derive(Debug)]
pub(crate) struct RemoteBackend {
  endpoints: Vec<String>,
  next_endpoint: AtomicUsize,
}

impl RemoteBackend {
  pub(crate) fn new(endpoints: Vec<String>) -> Self {
    Self {
      endpoints,
      next_endpoint: AtomicUsize::new(0),
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

    let endpoint = self.pick_endpoint()?;
    trace!(%task_id, %endpoint, job = %call.name, "Connecting to worker node.");

    let stream = TcpStream::connect(&endpoint)
      .await
      .map_err(|e| TaskError::RemoteUnavailable(format!("{}: {}", endpoint, e)))?;
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let request = JobRequest::Run {
      id: task_id,
      job: call.name.clone(),
      args,
    };
    let line = encode_line(&request)?;
    write_half
      .write_all(line.as_bytes())
      .await
      .map_err(|e| TaskError::RemoteUnavailable(format!("{}: {}", endpoint, e)))?;

    let response = tokio::select! {
      biased;

      _ = token.cancelled() => {
        debug!(%task_id, %endpoint, "Cancellation requested, sending advisory cancel to node.");
        if let Ok(cancel_line) = encode_line(&JobRequest::Cancel { id: task_id }) {
          let _ = write_half.write_all(cancel_line.as_bytes()).await;
          let _ = write_half.flush().await;
        }
        return Err(TaskError::Cancelled);
      }

      read_result = lines.next_line() => match read_result {
        Ok(Some(line)) => decode_line::<JobResponse>(&line)?,
        Ok(None) => {
          warn!(%task_id, %endpoint, "Node closed the connection before answering.");
          return Err(TaskError::RemoteUnavailable(format!("{}: connection closed mid-task", endpoint)));
        }
        Err(e) => {
          warn!(%task_id, %endpoint, "Read from node failed: {}", e);
          return Err(TaskError::RemoteUnavailable(format!("{}: {}", endpoint, e)));
        }
      },
    };

    if response.id() != task_id {
      return Err(TaskError::RemoteUnavailable(format!(
        "{}: protocol violation, response id {} for request {}",
        endpoint,
        response.id(),
        task_id
      )));
    }

    response.into_outcome().map(TaskOutput::Value)
  }

  fn pick_endpoint(&self) -> Result<String, TaskError> {
    if self.endpoints.is_empty() {
      return Err(TaskError::RemoteUnavailable("no endpoints configured".to_string()));
    }
    let index = self.next_endpoint.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
    Ok(self.endpoints[index].clone())
  }
}

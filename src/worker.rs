//! Serving loops for worker programs.
//!
//! A worker program is any executable that answers the job protocol. The
//! process backend spawns workers and talks to them over stdin/stdout
//! ([`serve_stdio`]); remote worker nodes accept pool connections over TCP
//! ([`serve_tcp`]). Both serve requests against a caller-built
//! [`JobRegistry`].

use crate::jobs::JobRegistry;
use crate::protocol::{decode_line, encode_line, JobRequest, JobResponse};

use std::io;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Serves the job protocol over this process's stdin/stdout until stdin
/// reaches EOF (the owning pool closed us or exited).
///
/// Job log output must go to stderr; stdout carries protocol lines only.
pub async fn serve_stdio(registry: JobRegistry) -> io::Result<()> {
  info!(jobs = registry.len(), "Worker serving job protocol on stdio.");
  serve_connection(registry, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Accepts pool connections on `listener` and serves the job protocol on
/// each until the connection closes.
pub async fn serve_tcp(listener: TcpListener, registry: JobRegistry) -> io::Result<()> {
  info!(addr = %listener.local_addr()?, jobs = registry.len(), "Worker serving job protocol on TCP.");
  loop {
    let (stream, peer) = listener.accept().await?;
    debug!(%peer, "Accepted pool connection.");
    let registry = registry.clone();
    tokio::spawn(async move {
      let (read_half, write_half) = stream.into_split();
      if let Err(e) = serve_connection(registry, read_half, write_half).await {
        warn!(%peer, "Connection closed with error: {}", e);
      } else {
        debug!(%peer, "Connection closed.");
      }
    });
  }
}

/// Serves one request stream. Each `Run` executes on a blocking thread so
/// the read loop keeps consuming requests (and `Cancel` messages) while
/// jobs are in flight.
async fn serve_connection<R, W>(registry: JobRegistry, reader: R, writer: W) -> io::Result<()>
where
  R: AsyncRead + Unpin + Send + 'static,
  W: AsyncWrite + Unpin + Send + 'static,
{
  let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
  let writer_task: JoinHandle<io::Result<()>> = tokio::spawn(async move {
    let mut writer = writer;
    while let Some(line) = out_rx.recv().await {
      writer.write_all(line.as_bytes()).await?;
      writer.flush().await?;
    }
    Ok(())
  });

  let running: Arc<DashMap<u64, JoinHandle<()>>> = Arc::new(DashMap::new());
  let mut lines = BufReader::new(reader).lines();

  while let Some(line) = lines.next_line().await? {
    if line.trim().is_empty() {
      continue;
    }
    let request: JobRequest = match decode_line(&line) {
      Ok(request) => request,
      Err(e) => {
        warn!("Dropping undecodable request line: {}", e);
        continue;
      }
    };

    match request {
      JobRequest::Run { id, job, args } => {
        trace!(%id, %job, "Running job.");
        let registry = registry.clone();
        let out_tx = out_tx.clone();
        let running_for_cleanup = running.clone();
        let task = tokio::spawn(async move {
          let job_for_blocking = job.clone();
          let result = tokio::task::spawn_blocking(move || registry.run(&job_for_blocking, args)).await;
          let response = match result {
            Ok(Some(Ok(value))) => JobResponse::Done { id, value },
            Ok(Some(Err(message))) => JobResponse::Error { id, message },
            Ok(None) => JobResponse::UnknownJob { id, job },
            Err(join_error) => JobResponse::Error {
              id,
              message: format!("job panicked: {}", join_error),
            },
          };
          if let Ok(line) = encode_line(&response) {
            let _ = out_tx.send(line);
          }
          running_for_cleanup.remove(&id);
        });
        running.insert(id, task);
      }
      JobRequest::Cancel { id } => {
        // Best effort: aborts the wrapper task so no response is sent for
        // the job; a blocking job body keeps running to completion.
        if let Some((_, task)) = running.remove(&id) {
          debug!(%id, "Cancel request received, aborting job task.");
          task.abort();
          if let Ok(line) = encode_line(&JobResponse::Cancelled { id }) {
            let _ = out_tx.send(line);
          }
        } else {
          trace!(%id, "Cancel request for unknown or finished job, ignored.");
        }
      }
    }
  }

  // EOF: drain in-flight jobs, then let the writer finish.
  for entry in running.iter() {
    trace!(id = %entry.key(), "EOF with job still in flight; letting it finish.");
  }
  drop(out_tx);
  match writer_task.await {
    Ok(result) => result,
    Err(join_error) => Err(io::Error::other(join_error)),
  }
}

use crate::backend::Backend;
use crate::config::{PoolConfig, PoolKind};
use crate::error::{PoolError, TaskError};
use crate::handle::{TaskCell, TaskHandle};
use crate::task::{TaskOutcome, WorkPayload, WorkUnit};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);
}

/// How a pool treats outstanding tasks on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Waits for every outstanding task (queued and running) to reach a
  /// terminal state before releasing workers.
  Drain,
  /// Best-effort cancels outstanding tasks, then releases workers.
  Cancel,
}

struct QueuedTask {
  cell: Arc<TaskCell>,
  token: CancellationToken,
  payload: WorkPayload,
}

/// A bounded worker set for one backend kind.
///
/// All four backends expose the same contract through this type: `submit`
/// returns a [`TaskHandle`] without waiting for execution, the number of
/// simultaneously executing tasks never exceeds the configured bound, and
/// failures are captured on handles rather than raised out of the pool.
pub struct Pool {
  name: Arc<String>,
  kind: PoolKind,
  concurrency: usize,
  backend: Arc<Backend>,
  semaphore: Arc<Semaphore>,
  queue_tx: mpsc::Sender<QueuedTask>,
  outstanding: Mutex<Vec<Weak<TaskCell>>>,
  active_tokens: Arc<DashMap<u64, CancellationToken>>,
  closed: AtomicBool,
  shutdown_token: CancellationToken,
  worker_join: Mutex<Option<JoinHandle<()>>>,
}

impl Pool {
  pub fn new(kind: PoolKind, config: PoolConfig, tokio_handle: TokioHandle) -> Result<Arc<Self>, PoolError> {
    let backend = Arc::new(Backend::for_config(kind, &config)?);
    let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
    let shutdown_token = CancellationToken::new();
    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let active_tokens = Arc::new(DashMap::new());
    let name = Arc::new(config.name.clone());

    let pool = Arc::new(Self {
      name: name.clone(),
      kind,
      concurrency: config.concurrency.max(1),
      backend: backend.clone(),
      semaphore: semaphore.clone(),
      queue_tx,
      outstanding: Mutex::new(Vec::new()),
      active_tokens: active_tokens.clone(),
      closed: AtomicBool::new(false),
      shutdown_token: shutdown_token.clone(),
      worker_join: Mutex::new(None),
    });

    let worker = tokio_handle.spawn(
      Self::run_worker_loop(name.clone(), backend, semaphore, queue_rx, active_tokens, shutdown_token)
        .instrument(info_span!("pool_worker_loop", pool = %name, kind = kind.as_str())),
    );
    *pool.worker_join.lock() = Some(worker);

    info!(pool = %pool.name, kind = kind.as_str(), concurrency = pool.concurrency, "Pool created.");
    Ok(pool)
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn kind(&self) -> PoolKind {
    self.kind
  }

  pub fn concurrency(&self) -> usize {
    self.concurrency
  }

  /// Number of tasks currently executing on the backend.
  pub fn active_task_count(&self) -> usize {
    self.active_tokens.len()
  }

  /// Submits one unit of work. Returns a handle immediately; execution is
  /// deferred behind the concurrency bound.
  ///
  /// This waits only for a slot in the bounded admission queue, never for
  /// another task to finish executing. Fails with [`PoolError::PoolClosed`]
  /// after shutdown and [`PoolError::InvalidWork`] when the work does not
  /// fit the backend (wrong variant, empty command line).
  pub async fn submit(&self, work: WorkUnit) -> Result<TaskHandle, PoolError> {
    if self.closed.load(AtomicOrdering::Acquire) || self.shutdown_token.is_cancelled() {
      warn!(pool = %self.name, "Submit rejected: pool is closed.");
      return Err(PoolError::PoolClosed);
    }
    self.backend.validate(&work)?;

    let task_id = NEXT_TASK_ID.fetch_add(1, AtomicOrdering::Relaxed);
    let cell = TaskCell::new(task_id, work.label);
    let token = CancellationToken::new();

    {
      let mut outstanding = self.outstanding.lock();
      outstanding.retain(|weak| weak.strong_count() > 0);
      outstanding.push(Arc::downgrade(&cell));
    }

    let queued = QueuedTask {
      cell: cell.clone(),
      token: token.clone(),
      payload: work.payload,
    };

    debug!(pool = %self.name, %task_id, label = ?cell.label(), "Submitting task.");

    let send_result = tokio::select! {
      biased;
      _ = self.shutdown_token.cancelled() => return Err(PoolError::PoolClosed),
      send_result = self.queue_tx.send(queued) => send_result,
    };

    match send_result {
      Ok(()) => Ok(TaskHandle {
        cell,
        token,
        kind: self.kind,
      }),
      Err(_send_error) => {
        error!(pool = %self.name, %task_id, "Admission queue rejected task; receiver gone.");
        if self.shutdown_token.is_cancelled() {
          Err(PoolError::PoolClosed)
        } else {
          Err(PoolError::QueueClosed)
        }
      }
    }
  }

  /// Waits for every handle outstanding at the time of the call. Tasks
  /// submitted concurrently with `wait_all` are not included.
  ///
  /// Returns task id to outcome. On timeout, [`PoolError::WaitTimeout`] is
  /// returned and all tasks keep running.
  pub async fn wait_all(&self, timeout: Option<Duration>) -> Result<HashMap<u64, TaskOutcome>, PoolError> {
    let cells: Vec<Arc<TaskCell>> = {
      let outstanding = self.outstanding.lock();
      outstanding.iter().filter_map(Weak::upgrade).collect()
    };
    let deadline = timeout.map(|t| Instant::now() + t);

    debug!(pool = %self.name, count = cells.len(), "Waiting for outstanding tasks.");

    let mut outcomes = HashMap::with_capacity(cells.len());
    for cell in cells {
      let outcome = match deadline {
        None => cell.wait_done().await,
        Some(deadline) => {
          let remaining = deadline.saturating_duration_since(Instant::now());
          match tokio::time::timeout(remaining, cell.wait_done()).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => return Err(PoolError::WaitTimeout),
          }
        }
      };
      outcomes.insert(cell.id(), outcome);
    }
    Ok(outcomes)
  }

  /// Shuts the pool down. Subsequent `submit` calls fail with `PoolClosed`.
  ///
  /// [`ShutdownMode::Drain`] first waits for all outstanding tasks, so every
  /// previously returned handle is terminal when this returns.
  /// [`ShutdownMode::Cancel`] best-effort cancels queued and running tasks
  /// per the backend's cancellation capability.
  pub async fn shutdown(&self, mode: ShutdownMode) {
    let first_call = !self.closed.swap(true, AtomicOrdering::AcqRel);
    if first_call {
      info!(pool = %self.name, ?mode, "Initiating pool shutdown.");
      match mode {
        ShutdownMode::Drain => {
          // The worker loop keeps running here so queued tasks still
          // execute; only new submissions are refused.
          if let Err(e) = self.wait_all(None).await {
            warn!(pool = %self.name, "Drain wait failed: {}", e);
          }
        }
        ShutdownMode::Cancel => {
          let cells: Vec<Arc<TaskCell>> = {
            let outstanding = self.outstanding.lock();
            outstanding.iter().filter_map(Weak::upgrade).collect()
          };
          for cell in cells {
            cell.try_cancel_pending();
          }
          for entry in self.active_tokens.iter() {
            debug!(pool = %self.name, task_id = %entry.key(), "Cancelling active task for shutdown.");
            entry.value().cancel();
          }
        }
      }
      self.shutdown_token.cancel();
    } else {
      info!(pool = %self.name, "Shutdown already in progress.");
    }

    let worker = self.worker_join.lock().take();
    if let Some(worker) = worker {
      if let Err(join_error) = worker.await {
        error!(pool = %self.name, "Worker loop join failed: {:?}", join_error);
      }
    }

    // All execution permits back means no task is still on the backend.
    match self.semaphore.acquire_many(self.concurrency as u32).await {
      Ok(permits) => drop(permits),
      Err(_closed) => {}
    }

    if first_call {
      self.backend.close();
      info!(pool = %self.name, "Pool shutdown complete.");
    }
  }

  async fn run_worker_loop(
    pool_name: Arc<String>,
    backend: Arc<Backend>,
    semaphore: Arc<Semaphore>,
    mut queue_rx: mpsc::Receiver<QueuedTask>,
    active_tokens: Arc<DashMap<u64, CancellationToken>>,
    shutdown_token: CancellationToken,
  ) {
    info!(pool = %*pool_name, "Worker loop started.");

    loop {
      tokio::select! {
        biased;

        _ = shutdown_token.cancelled() => {
          info!(pool = %*pool_name, "Shutdown signal received. Worker loop terminating.");
          break;
        }

        permit_result = semaphore.clone().acquire_owned() => {
          let permit = match permit_result {
            Ok(permit) => permit,
            Err(_closed) => {
              error!(pool = %*pool_name, "Semaphore closed. Worker loop exiting.");
              break;
            }
          };

          let task_and_permit = tokio::select! {
            biased;
            _ = shutdown_token.cancelled() => {
              info!(pool = %*pool_name, "Shutdown while waiting for a task. Releasing permit.");
              drop(permit);
              None
            }
            received = queue_rx.recv() => {
              match received {
                Some(task) => Some((task, permit)),
                None => {
                  info!(pool = %*pool_name, "Admission queue closed and empty. Releasing permit.");
                  None
                }
              }
            }
          };

          let Some((task, permit)) = task_and_permit else { break; };

          // A queued-cancel already made the cell terminal; skip execution.
          if !task.cell.mark_running() {
            trace!(pool = %*pool_name, task_id = %task.cell.id(), "Dequeued task already cancelled.");
            continue;
          }

          let task_id = task.cell.id();
          active_tokens.insert(task_id, task.token.clone());
          debug!(pool = %*pool_name, %task_id, "Dequeued task. Spawning with permit.");

          let backend = backend.clone();
          let active_tokens_cleanup = active_tokens.clone();
          let span = info_span!("pool_task", pool = %*pool_name, %task_id);

          tokio::spawn(
            async move {
              let _permit = permit;
              let outcome = backend.execute(task_id, task.payload, &task.token).await;
              task.cell.finish(outcome);
              active_tokens_cleanup.remove(&task_id);
            }
            .instrument(span),
          );
        }
      }
    }

    // Tasks still queued at exit have no executor left; resolve their cells
    // so handles waiting on them unblock instead of hanging forever.
    queue_rx.close();
    while let Ok(task) = queue_rx.try_recv() {
      debug!(pool = %*pool_name, task_id = %task.cell.id(), "Cancelling task left in queue at loop exit.");
      task.cell.finish(Err(TaskError::Cancelled));
    }

    info!(pool = %*pool_name, active = active_tokens.len(), "Worker loop stopped.");
  }
}

impl Drop for Pool {
  fn drop(&mut self) {
    // Signal only; never block in drop. The worker loop observes the token
    // and stops on its own, and the runtime reaps the join handle.
    if !self.shutdown_token.is_cancelled() {
      info!(pool = %*self.name, "Pool dropped. Signaling implicit shutdown.");
      self.closed.store(true, AtomicOrdering::Release);
      self.shutdown_token.cancel();
    }
  }
}

impl std::fmt::Debug for Pool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Pool")
      .field("name", &self.name)
      .field("kind", &self.kind)
      .field("concurrency", &self.concurrency)
      .field("active", &self.active_tokens.len())
      .field("closed", &self.closed.load(AtomicOrdering::Relaxed))
      .finish()
  }
}

//! End-to-end tests for the process and remote backends, driven against the
//! crate's reference worker binary.

use anypool::{
  Pool, PoolConfig, PoolError, PoolKind, ShutdownMode, TaskError, TaskOutput, TaskState,
  TaskValue, WorkUnit,
};

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

const WORKER_BIN: &str = env!("CARGO_BIN_EXE_anypool-worker");

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,anypool=trace"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

fn process_pool(name: &str, concurrency: usize) -> Arc<Pool> {
  Pool::new(
    PoolKind::Process,
    PoolConfig::new(name, concurrency).worker_command([WORKER_BIN]),
    tokio::runtime::Handle::current(),
  )
  .unwrap()
}

fn value_of(output: TaskOutput) -> TaskValue {
  output.into_value().expect("expected a value output")
}

/// Starts a TCP worker node on an ephemeral port and returns its address.
async fn spawn_tcp_worker() -> (Child, String) {
  let mut child = Command::new(WORKER_BIN)
    .args(["--listen", "127.0.0.1:0"])
    .stdout(Stdio::piped())
    .stderr(Stdio::null())
    .kill_on_drop(true)
    .spawn()
    .expect("worker binary must start");

  let stdout = child.stdout.take().unwrap();
  let mut lines = BufReader::new(stdout).lines();
  let announcement = tokio::time::timeout(Duration::from_secs(10), lines.next_line())
    .await
    .expect("worker did not announce in time")
    .unwrap()
    .expect("worker closed stdout before announcing");
  let addr = announcement
    .strip_prefix("listening ")
    .expect("unexpected announcement line")
    .to_string();
  (child, addr)
}

#[tokio::test]
async fn process_pool_runs_jobs_in_worker_children() {
  setup_tracing_for_test();
  let pool = process_pool("process_sum", 2);

  let handle = pool
    .submit(WorkUnit::job("sum", &json!({ "values": [1, 2, 3] })))
    .await
    .unwrap();
  assert_eq!(handle.label(), Some("sum"));
  assert_eq!(value_of(handle.wait(None).await.unwrap()), TaskValue::from(6));

  // The same worker keeps serving subsequent jobs.
  let echo = pool
    .submit(WorkUnit::job("echo", &json!({ "k": "v" })))
    .await
    .unwrap();
  assert_eq!(value_of(echo.wait(None).await.unwrap()), json!({ "k": "v" }));

  pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn job_failure_and_unknown_job_surface_as_errors() {
  setup_tracing_for_test();
  let pool = process_pool("process_errors", 1);

  let failing = pool
    .submit(WorkUnit::job("fail", &json!({ "message": "no space left" })))
    .await
    .unwrap();
  assert_eq!(
    failing.wait(None).await,
    Err(TaskError::Job("no space left".to_string()))
  );
  assert_eq!(failing.state(), TaskState::Failed);

  let unknown = pool
    .submit(WorkUnit::job("frobnicate", &json!(null)))
    .await
    .unwrap();
  match unknown.wait(None).await {
    Err(TaskError::Job(message)) => assert!(message.contains("unknown job")),
    other => panic!("expected Job error, got {:?}", other),
  }

  pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn unserializable_arguments_fail_on_the_handle() {
  setup_tracing_for_test();
  let pool = process_pool("process_serde", 1);

  // NaN has no JSON representation; submission still succeeds and the
  // failure is captured on the handle.
  let handle = pool.submit(WorkUnit::job("echo", &f64::NAN)).await.unwrap();
  assert!(matches!(handle.wait(None).await, Err(TaskError::Serialization(_))));
  assert_eq!(handle.state(), TaskState::Failed);

  pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn dead_worker_surfaces_as_worker_crashed_without_killing_the_pool() {
  setup_tracing_for_test();
  let pool = Pool::new(
    PoolKind::Process,
    PoolConfig::new("process_crash", 1).worker_command(["false"]),
    tokio::runtime::Handle::current(),
  )
  .unwrap();

  let first = pool.submit(WorkUnit::job("echo", &json!(1))).await.unwrap();
  assert!(matches!(first.wait(None).await, Err(TaskError::WorkerCrashed(_))));

  // The pool replaces the dead worker and keeps accepting work.
  let second = pool.submit(WorkUnit::job("echo", &json!(2))).await.unwrap();
  assert!(matches!(second.wait(None).await, Err(TaskError::WorkerCrashed(_))));

  pool.shutdown(ShutdownMode::Cancel).await;
}

#[tokio::test]
async fn missing_worker_command_is_a_config_error() {
  setup_tracing_for_test();
  let refused = Pool::new(
    PoolKind::Process,
    PoolConfig::new("process_no_cmd", 1),
    tokio::runtime::Handle::current(),
  );
  assert!(matches!(refused, Err(PoolError::InvalidConfig(_))));
}

#[tokio::test]
async fn cancelling_running_process_job_kills_the_worker() {
  setup_tracing_for_test();
  let pool = process_pool("process_cancel", 1);

  let handle = pool
    .submit(WorkUnit::job("sleep_ms", &json!({ "millis": 30000 })))
    .await
    .unwrap();
  tokio::time::sleep(Duration::from_millis(300)).await;
  assert_eq!(handle.state(), TaskState::Running);

  assert!(handle.cancel(), "process backend can terminate its worker");
  assert_eq!(handle.wait(None).await, Err(TaskError::Cancelled));
  assert_eq!(handle.state(), TaskState::Cancelled);

  // A fresh worker serves the next job.
  let next = pool.submit(WorkUnit::job("echo", &json!("after"))).await.unwrap();
  assert_eq!(value_of(next.wait(None).await.unwrap()), TaskValue::from("after"));

  pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn remote_pool_round_trips_jobs_over_tcp() {
  setup_tracing_for_test();
  let (_node, addr) = spawn_tcp_worker().await;

  let pool = Pool::new(
    PoolKind::Remote,
    PoolConfig::new("remote_sum", 2).endpoints([addr]),
    tokio::runtime::Handle::current(),
  )
  .unwrap();

  let handle = pool
    .submit(WorkUnit::job("sum", &json!({ "values": [10, 20, 12] })))
    .await
    .unwrap();
  assert_eq!(value_of(handle.wait(None).await.unwrap()), TaskValue::from(42));

  pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn unreachable_node_surfaces_as_remote_unavailable() {
  setup_tracing_for_test();
  let pool = Pool::new(
    PoolKind::Remote,
    // Reserved port with nothing listening.
    PoolConfig::new("remote_down", 1).endpoints(["127.0.0.1:9"]),
    tokio::runtime::Handle::current(),
  )
  .unwrap();

  let handle = pool.submit(WorkUnit::job("echo", &json!(1))).await.unwrap();
  assert!(matches!(handle.wait(None).await, Err(TaskError::RemoteUnavailable(_))));
  assert_eq!(handle.state(), TaskState::Failed);

  pool.shutdown(ShutdownMode::Cancel).await;
}

#[tokio::test]
async fn remote_cancel_is_advisory() {
  setup_tracing_for_test();
  let (_node, addr) = spawn_tcp_worker().await;

  let pool = Pool::new(
    PoolKind::Remote,
    PoolConfig::new("remote_cancel", 1).endpoints([addr]),
    tokio::runtime::Handle::current(),
  )
  .unwrap();

  let handle = pool
    .submit(WorkUnit::job("sleep_ms", &json!({ "millis": 30000 })))
    .await
    .unwrap();
  tokio::time::sleep(Duration::from_millis(300)).await;
  assert_eq!(handle.state(), TaskState::Running);

  // Running remote work only gets an advisory cancel message.
  assert!(!handle.cancel());
  assert_eq!(handle.wait(None).await, Err(TaskError::Cancelled));
  assert_eq!(handle.state(), TaskState::Cancelled);

  pool.shutdown(ShutdownMode::Cancel).await;
}

#[tokio::test]
async fn missing_endpoints_is_a_config_error() {
  setup_tracing_for_test();
  let refused = Pool::new(
    PoolKind::Remote,
    PoolConfig::new("remote_no_nodes", 1),
    tokio::runtime::Handle::current(),
  );
  assert!(matches!(refused, Err(PoolError::InvalidConfig(_))));
}

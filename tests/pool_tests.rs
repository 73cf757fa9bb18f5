use anypool::{
  Pool, PoolConfig, PoolError, PoolKind, PoolRegistry, ShutdownMode, TaskError, TaskOutput,
  TaskState, TaskValue, WorkUnit,
};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use rand::Rng;

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

fn thread_pool(name: &str, concurrency: usize) -> Arc<Pool> {
  Pool::new(
    PoolKind::Thread,
    PoolConfig::new(name, concurrency),
    tokio::runtime::Handle::current(),
  )
  .unwrap()
}

fn value_of(output: TaskOutput) -> TaskValue {
  output.into_value().expect("expected a value output")
}

#[tokio::test]
async fn submit_returns_exact_callable_value() {
  setup_tracing_for_test();
  let pool = thread_pool("exact_value", 2);

  let handle = pool
    .submit(WorkUnit::callable(|| 6 * 7).with_label("six-times-seven"))
    .await
    .unwrap();
  assert_eq!(handle.label(), Some("six-times-seven"));

  let output = handle.wait(None).await.unwrap();
  assert_eq!(value_of(output), TaskValue::from(42));
  assert_eq!(handle.state(), TaskState::Completed);
  assert!(handle.is_done());

  pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn callable_panic_is_captured_not_propagated() {
  setup_tracing_for_test();
  let pool = thread_pool("panic_capture", 1);

  let panicking = pool
    .submit(WorkUnit::callable(|| -> u32 { panic!("boom-77") }))
    .await
    .unwrap();
  match panicking.wait(None).await {
    Err(TaskError::Panicked(message)) => assert!(message.contains("boom-77")),
    other => panic!("expected Panicked, got {:?}", other),
  }
  assert_eq!(panicking.state(), TaskState::Failed);

  // The worker survives and keeps processing.
  let next = pool.submit(WorkUnit::callable(|| "still alive")).await.unwrap();
  assert_eq!(
    value_of(next.wait(None).await.unwrap()),
    TaskValue::from("still alive")
  );

  pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn fallible_callable_error_is_preserved() {
  setup_tracing_for_test();
  let pool = thread_pool("fallible", 1);

  let handle = pool
    .submit(WorkUnit::try_callable(|| Err::<u32, _>("disk on fire".to_string())))
    .await
    .unwrap();
  assert_eq!(
    handle.wait(None).await,
    Err(TaskError::Job("disk on fire".to_string()))
  );

  pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn executing_tasks_never_exceed_concurrency_bound() {
  setup_tracing_for_test();
  let bound = 3usize;
  let pool = thread_pool("bound_check", bound);

  let in_flight = Arc::new(AtomicUsize::new(0));
  let observed_max = Arc::new(AtomicUsize::new(0));

  let mut handles = Vec::new();
  for _ in 0..24 {
    let in_flight = in_flight.clone();
    let observed_max = observed_max.clone();
    let handle = pool
      .submit(WorkUnit::callable(move || {
        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        observed_max.fetch_max(now, Ordering::SeqCst);
        let jitter = rand::rng().random_range(5..25);
        std::thread::sleep(Duration::from_millis(jitter));
        in_flight.fetch_sub(1, Ordering::SeqCst);
        now
      }))
      .await
      .unwrap();
    handles.push(handle);
  }

  for handle in &handles {
    handle.wait(None).await.unwrap();
  }
  assert!(
    observed_max.load(Ordering::SeqCst) <= bound,
    "saw {} tasks executing at once with bound {}",
    observed_max.load(Ordering::SeqCst),
    bound
  );

  pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn zero_timeout_wait_leaves_task_untouched() {
  setup_tracing_for_test();
  let pool = thread_pool("timeout_poll", 1);

  let (release_tx, release_rx) = mpsc::channel::<()>();
  let handle = pool
    .submit(WorkUnit::callable(move || {
      release_rx.recv().ok();
      "eventually"
    }))
    .await
    .unwrap();

  assert_eq!(handle.wait(Some(Duration::ZERO)).await, Err(TaskError::Timeout));
  assert!(!handle.is_done());
  assert_eq!(handle.wait(Some(Duration::from_millis(50))).await, Err(TaskError::Timeout));

  release_tx.send(()).unwrap();
  assert_eq!(
    value_of(handle.wait(None).await.unwrap()),
    TaskValue::from("eventually")
  );

  pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn queued_task_cancels_deterministically() {
  setup_tracing_for_test();
  let pool = thread_pool("queued_cancel", 1);

  let (release_tx, release_rx) = mpsc::channel::<()>();
  let blocker = pool
    .submit(WorkUnit::callable(move || {
      release_rx.recv().ok();
      "blocker"
    }))
    .await
    .unwrap();

  // Give the blocker time to occupy the single execution slot.
  tokio::time::sleep(Duration::from_millis(50)).await;

  let queued = pool.submit(WorkUnit::callable(|| "never runs")).await.unwrap();
  assert!(queued.cancel(), "queued task must cancel deterministically");
  assert_eq!(queued.state(), TaskState::Cancelled);
  assert_eq!(queued.wait(None).await, Err(TaskError::Cancelled));

  // A running thread-backend task only cancels cooperatively.
  assert!(!blocker.cancel());

  release_tx.send(()).unwrap();
  assert_eq!(
    value_of(blocker.wait(None).await.unwrap()),
    TaskValue::from("blocker")
  );

  pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn wait_all_covers_outstanding_snapshot() {
  setup_tracing_for_test();
  let pool = thread_pool("wait_all", 2);

  let mut ids = Vec::new();
  for i in 0..5u64 {
    let handle = pool
      .submit(WorkUnit::callable(move || i * 10))
      .await
      .unwrap();
    ids.push(handle.id());
  }

  let outcomes = pool.wait_all(Some(Duration::from_secs(10))).await.unwrap();
  for (i, id) in ids.iter().enumerate() {
    let outcome = outcomes.get(id).expect("outcome missing for submitted task");
    assert_eq!(
      outcome.clone().unwrap().into_value().unwrap(),
      TaskValue::from(i as u64 * 10)
    );
  }

  pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn wait_all_times_out_and_leaves_tasks_running() {
  setup_tracing_for_test();
  let pool = thread_pool("wait_all_timeout", 1);

  let (release_tx, release_rx) = mpsc::channel::<()>();
  let handle = pool
    .submit(WorkUnit::callable(move || {
      release_rx.recv().ok();
      "late"
    }))
    .await
    .unwrap();

  assert_eq!(
    pool.wait_all(Some(Duration::from_millis(50))).await,
    Err(PoolError::WaitTimeout)
  );
  assert!(!handle.is_done(), "a timed-out wait_all must not touch the task");

  release_tx.send(()).unwrap();
  let outcomes = pool.wait_all(Some(Duration::from_secs(10))).await.unwrap();
  assert_eq!(
    outcomes.get(&handle.id()).unwrap().clone().unwrap().into_value().unwrap(),
    TaskValue::from("late")
  );

  pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn dropping_pool_with_queued_work_resolves_queued_handles() {
  setup_tracing_for_test();
  let pool = thread_pool("implicit_shutdown", 1);

  let (release_tx, release_rx) = mpsc::channel::<()>();
  let blocker = pool
    .submit(WorkUnit::callable(move || {
      release_rx.recv().ok();
      "blocker"
    }))
    .await
    .unwrap();
  // Let the blocker occupy the single execution slot so the next task
  // stays in the admission queue.
  tokio::time::sleep(Duration::from_millis(50)).await;
  let queued = pool.submit(WorkUnit::callable(|| "never runs")).await.unwrap();

  drop(pool);

  // Implicit shutdown must leave no handle waiting forever: the queued
  // task has no executor anymore and resolves as cancelled.
  assert_eq!(
    queued.wait(Some(Duration::from_secs(5))).await,
    Err(TaskError::Cancelled)
  );
  assert_eq!(queued.state(), TaskState::Cancelled);

  // The already-running task still finishes normally.
  release_tx.send(()).unwrap();
  assert_eq!(
    value_of(blocker.wait(Some(Duration::from_secs(5))).await.unwrap()),
    TaskValue::from("blocker")
  );
}

#[tokio::test]
async fn drain_shutdown_finishes_everything_then_closes() {
  setup_tracing_for_test();
  let pool = thread_pool("drain_shutdown", 2);

  let mut handles = Vec::new();
  for _ in 0..6 {
    handles.push(
      pool
        .submit(WorkUnit::callable(|| {
          std::thread::sleep(Duration::from_millis(20));
          "done"
        }))
        .await
        .unwrap(),
    );
  }

  pool.shutdown(ShutdownMode::Drain).await;

  for handle in &handles {
    assert!(handle.is_done(), "drain must leave every handle terminal");
    assert_eq!(handle.state(), TaskState::Completed);
  }

  let refused = pool.submit(WorkUnit::callable(|| "late")).await;
  assert_eq!(refused.unwrap_err(), PoolError::PoolClosed);
}

#[tokio::test]
async fn cancel_shutdown_drops_queued_work_and_closes() {
  setup_tracing_for_test();
  let pool = thread_pool("cancel_shutdown", 1);

  let running = pool
    .submit(WorkUnit::callable(|| {
      std::thread::sleep(Duration::from_millis(150));
      "ran"
    }))
    .await
    .unwrap();
  tokio::time::sleep(Duration::from_millis(50)).await;

  let queued = pool.submit(WorkUnit::callable(|| "starved")).await.unwrap();

  pool.shutdown(ShutdownMode::Cancel).await;

  assert_eq!(queued.wait(None).await, Err(TaskError::Cancelled));
  assert_eq!(queued.state(), TaskState::Cancelled);
  // The running closure cannot be stopped; it finishes on its own.
  assert_eq!(
    value_of(running.wait(None).await.unwrap()),
    TaskValue::from("ran")
  );

  let refused = pool.submit(WorkUnit::callable(|| "late")).await;
  assert_eq!(refused.unwrap_err(), PoolError::PoolClosed);
}

#[tokio::test]
async fn mismatched_work_is_rejected_at_submit() {
  setup_tracing_for_test();
  let pool = thread_pool("mismatch", 1);

  let refused = pool.submit(WorkUnit::command_line("echo hello")).await;
  assert!(matches!(refused, Err(PoolError::InvalidWork(_))));

  pool.shutdown(ShutdownMode::Drain).await;
}

#[tokio::test]
async fn registry_returns_one_pool_per_key() {
  setup_tracing_for_test();
  let registry = PoolRegistry::new();
  let handle = tokio::runtime::Handle::current();

  let first = registry
    .get_pool(PoolKind::Thread, PoolConfig::new("shared", 2), &handle)
    .unwrap();
  let second = registry
    .get_pool(PoolKind::Thread, PoolConfig::new("shared", 8), &handle)
    .unwrap();
  assert!(Arc::ptr_eq(&first, &second));
  // Config of the first request wins.
  assert_eq!(second.concurrency(), 2);

  let other_kind = registry
    .get_pool(PoolKind::Shell, PoolConfig::new("shared", 2), &handle)
    .unwrap();
  assert!(!Arc::ptr_eq(&first, &other_kind));
  assert_eq!(registry.len(), 2);

  registry.shutdown_all(ShutdownMode::Drain).await;
  assert!(registry.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_first_requests_construct_one_pool() {
  setup_tracing_for_test();
  let registry = Arc::new(PoolRegistry::new());
  let handle = tokio::runtime::Handle::current();

  let mut requests = Vec::new();
  for _ in 0..16 {
    let registry = registry.clone();
    let handle = handle.clone();
    requests.push(tokio::spawn(async move {
      registry
        .get_pool(PoolKind::Thread, PoolConfig::new("race", 2), &handle)
        .unwrap()
    }));
  }

  let mut pools = Vec::new();
  for request in requests {
    pools.push(request.await.unwrap());
  }
  for pool in &pools {
    assert!(Arc::ptr_eq(&pools[0], pool));
  }
  assert_eq!(registry.len(), 1);

  registry.shutdown_all(ShutdownMode::Drain).await;
}

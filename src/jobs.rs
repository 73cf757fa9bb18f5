//! Named job functions a worker program can execute.
//!
//! A [`JobRegistry`] maps job names to functions taking serde-typed
//! arguments. Worker programs build one, register their jobs and hand it to
//! [`serve_stdio`](crate::worker::serve_stdio) or
//! [`serve_tcp`](crate::worker::serve_tcp).

use crate::task::TaskValue;

use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

type JobFn = Arc<dyn Fn(TaskValue) -> Result<TaskValue, String> + Send + Sync + 'static>;

#[derive(Clone, Default)]
pub struct JobRegistry {
  jobs: Arc<DashMap<String, JobFn>>,
}

impl JobRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers a job under `name`. Arguments are decoded from JSON before
  /// the call and the return value encoded after it; either failing is
  /// reported to the requesting pool as a job error.
  pub fn register<A, R, F>(&self, name: impl Into<String>, f: F)
  where
    A: DeserializeOwned,
    R: Serialize,
    F: Fn(A) -> Result<R, String> + Send + Sync + 'static,
  {
    let wrapped: JobFn = Arc::new(move |args: TaskValue| {
      let decoded: A =
        serde_json::from_value(args).map_err(|e| format!("bad arguments: {}", e))?;
      let result = f(decoded)?;
      serde_json::to_value(result).map_err(|e| format!("result not serializable: {}", e))
    });
    self.jobs.insert(name.into(), wrapped);
  }

  pub fn contains(&self, name: &str) -> bool {
    self.jobs.contains_key(name)
  }

  pub fn len(&self) -> usize {
    self.jobs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.jobs.is_empty()
  }

  /// Runs a registered job. `None` if no job has that name.
  pub fn run(&self, name: &str, args: TaskValue) -> Option<Result<TaskValue, String>> {
    let f = self.jobs.get(name).map(|entry| entry.value().clone())?;
    Some(f(args))
  }
}

impl std::fmt::Debug for JobRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("JobRegistry").field("jobs", &self.jobs.len()).finish()
  }
}

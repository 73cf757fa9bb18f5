//! Line-delimited JSON job protocol spoken between a pool and its worker
//! programs, over stdin/stdout (process backend) or TCP (remote backend).
//!
//! One request or response per line. Request ids are the pool-side task ids,
//! unique per submission, so responses can always be matched to a request.

use crate::error::TaskError;
use crate::task::TaskValue;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobRequest {
  /// Run the named job with the given arguments.
  Run {
    id: u64,
    job: String,
    args: TaskValue,
  },
  /// Best-effort request to stop a previously submitted job.
  Cancel { id: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobResponse {
  Done { id: u64, value: TaskValue },
  Error { id: u64, message: String },
  UnknownJob { id: u64, job: String },
  Cancelled { id: u64 },
}

impl JobResponse {
  pub fn id(&self) -> u64 {
    match self {
      JobResponse::Done { id, .. }
      | JobResponse::Error { id, .. }
      | JobResponse::UnknownJob { id, .. }
      | JobResponse::Cancelled { id } => *id,
    }
  }

  /// Maps a worker's answer onto the task-error taxonomy.
  pub fn into_outcome(self) -> Result<TaskValue, TaskError> {
    match self {
      JobResponse::Done { value, .. } => Ok(value),
      JobResponse::Error { message, .. } => Err(TaskError::Job(message)),
      JobResponse::UnknownJob { job, .. } => Err(TaskError::Job(format!("unknown job '{}'", job))),
      JobResponse::Cancelled { .. } => Err(TaskError::Cancelled),
    }
  }
}

pub fn encode_line<T: Serialize>(message: &T) -> Result<String, TaskError> {
  let mut line = serde_json::to_string(message).map_err(|e| TaskError::Serialization(e.to_string()))?;
  line.push('\n');
  Ok(line)
}

pub fn decode_line<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, TaskError> {
  serde_json::from_str(line.trim_end()).map_err(|e| TaskError::Serialization(e.to_string()))
}

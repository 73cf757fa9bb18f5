//! One submit/wait/cancel contract over heterogeneous execution backends.
//!
//! A [`Pool`] owns a bounded worker set for one backend kind: in-process
//! blocking callables on worker threads, serialized jobs on local worker
//! child processes, external shell commands, or jobs on remote worker nodes
//! over TCP. Every pool hands back the same [`TaskHandle`] from
//! [`Pool::submit`], so callers never branch on how work actually runs.
//! The process-wide [`registry`] caches one pool per (kind, name).

mod backend;
mod config;
mod error;
mod handle;
pub mod jobs;
mod pool;
mod process;
pub mod protocol;
pub mod registry;
mod remote;
mod shell;
mod task;
mod thread;
pub mod worker;

pub use config::{PoolConfig, PoolKey, PoolKind};
pub use error::{PoolError, TaskError};
pub use handle::TaskHandle;
pub use jobs::JobRegistry;
pub use pool::{Pool, ShutdownMode};
pub use registry::{global, PoolRegistry};
pub use task::{
  CallableResult, CommandOutput, CommandSpec, JobCall, TaskOutcome, TaskOutput, TaskState,
  TaskValue, WorkUnit,
};

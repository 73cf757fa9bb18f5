use crate::config::{PoolConfig, PoolKey, PoolKind};
use crate::error::PoolError;
use crate::pool::{Pool, ShutdownMode};

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::runtime::Handle as TokioHandle;
use tracing::{debug, info, warn};

lazy_static::lazy_static! {
  static ref GLOBAL_REGISTRY: PoolRegistry = PoolRegistry::new();
}

/// Process-wide cache of pools, keyed by (kind, pool name).
///
/// Repeated requests for the same key return the same pool instance;
/// concurrent first requests serialize through the map's entry lock so
/// exactly one worker set is ever constructed per key. Tests that want
/// isolation construct their own registry instead of using [`global`].
#[derive(Debug, Default)]
pub struct PoolRegistry {
  pools: DashMap<PoolKey, Arc<Pool>>,
}

/// The process-wide registry. Lives until process exit; call
/// [`PoolRegistry::shutdown_all`] for an orderly teardown.
pub fn global() -> &'static PoolRegistry {
  &GLOBAL_REGISTRY
}

impl PoolRegistry {
  pub fn new() -> Self {
    Self {
      pools: DashMap::new(),
    }
  }

  /// Returns the pool for `(kind, config.name)`, constructing it exactly
  /// once. The configuration only takes effect at construction; a repeat
  /// request with a different worker count gets the existing pool and a
  /// warning, matching the "the thread pool" expectation of callers.
  pub fn get_pool(
    &self,
    kind: PoolKind,
    config: PoolConfig,
    tokio_handle: &TokioHandle,
  ) -> Result<Arc<Pool>, PoolError> {
    let key = PoolKey {
      kind,
      name: config.name.clone(),
    };

    match self.pools.entry(key) {
      Entry::Occupied(existing) => {
        let pool = existing.get();
        if pool.concurrency() != config.concurrency.max(1) {
          warn!(
            pool = %pool.name(),
            existing = pool.concurrency(),
            requested = config.concurrency,
            "Pool already exists with a different concurrency bound; reusing it."
          );
        }
        debug!(pool = %pool.name(), kind = kind.as_str(), "Reusing existing pool.");
        Ok(pool.clone())
      }
      Entry::Vacant(slot) => {
        info!(name = %config.name, kind = kind.as_str(), "Creating pool.");
        let pool = Pool::new(kind, config, tokio_handle.clone())?;
        slot.insert(pool.clone());
        Ok(pool)
      }
    }
  }

  pub fn len(&self) -> usize {
    self.pools.len()
  }

  pub fn is_empty(&self) -> bool {
    self.pools.is_empty()
  }

  /// Waits for all outstanding tasks on every registered pool.
  pub async fn wait_all_pools(&self) -> Result<(), PoolError> {
    let pools: Vec<Arc<Pool>> = self.pools.iter().map(|entry| entry.value().clone()).collect();
    for pool in pools {
      info!(pool = %pool.name(), "Waiting on pool.");
      pool.wait_all(None).await?;
    }
    Ok(())
  }

  /// Shuts down and removes every registered pool.
  pub async fn shutdown_all(&self, mode: ShutdownMode) {
    let pools: Vec<(PoolKey, Arc<Pool>)> = self
      .pools
      .iter()
      .map(|entry| (entry.key().clone(), entry.value().clone()))
      .collect();
    for (key, pool) in pools {
      info!(pool = %pool.name(), kind = key.kind.as_str(), "Shutting down pool.");
      pool.shutdown(mode).await;
      self.pools.remove(&key);
    }
  }
}

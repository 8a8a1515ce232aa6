//! Per-instance mutual exclusion.
//!
//! Every mutation of an instance runs while holding its lock. Locks for
//! different instances never contend, and an entry is evicted as soon as the
//! last holder or waiter lets go.

use dashmap::DashMap;
use flowcore::{FlowError, InstanceId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct InstanceLocks {
    table: Arc<DashMap<InstanceId, Arc<Mutex<()>>>>,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `wait` for exclusive access to `instance_id`.
    pub async fn acquire(
        &self,
        instance_id: InstanceId,
        wait: Duration,
    ) -> Result<InstanceGuard, FlowError> {
        let mutex = self.table.entry(instance_id).or_default().clone();

        match tokio::time::timeout(wait, mutex.lock_owned()).await {
            Ok(guard) => Ok(InstanceGuard {
                instance_id,
                guard: Some(guard),
                table: Arc::clone(&self.table),
            }),
            Err(_) => {
                tracing::warn!(
                    instance_id = %instance_id,
                    waited_ms = wait.as_millis() as u64,
                    "Timed out waiting for instance lock"
                );
                Err(FlowError::LockTimeout {
                    instance_id,
                    waited_ms: wait.as_millis() as u64,
                })
            }
        }
    }

    /// Number of instances with a live lock entry.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Held for the duration of one mutation; releases on drop, including
/// early returns and errors.
pub struct InstanceGuard {
    instance_id: InstanceId,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<DashMap<InstanceId, Arc<Mutex<()>>>>,
}

impl InstanceGuard {
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        // Release first so the table entry is the only remaining reference.
        drop(self.guard.take());
        self.table
            .remove_if(&self.instance_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

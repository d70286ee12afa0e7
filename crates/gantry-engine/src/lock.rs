//! Lease-based locking on top of a [`LockStore`].

use gantry_core::Result;
use gantry_core::ids::{JobRunId, RunId};
use gantry_core::ports::LockStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const RETRY_DELAY: Duration = Duration::from_millis(50);

pub fn craft_key(run_id: RunId) -> String {
    format!("gantry.craft.{run_id}")
}

pub fn run_key(run_id: RunId) -> String {
    format!("gantry.engine.{run_id}")
}

pub fn job_key(job_run_id: JobRunId) -> String {
    format!("gantry.job.{job_run_id}")
}

/// Non-blocking lock acquisition with a bounded number of attempts.
#[derive(Clone)]
pub struct Locker {
    store: Arc<dyn LockStore>,
    attempts: u32,
}

impl Locker {
    pub fn new(store: Arc<dyn LockStore>, attempts: u32) -> Self {
        Self {
            store,
            attempts: attempts.max(1),
        }
    }

    /// Try to take `key` for `lease`. Returns `false` when someone else holds it.
    pub async fn try_lock(&self, key: &str, lease: Duration) -> Result<bool> {
        for attempt in 1..=self.attempts {
            if self.store.try_acquire(key, lease).await? {
                return Ok(true);
            }
            if attempt < self.attempts {
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
        debug!(key, "Lock is busy");
        Ok(false)
    }

    /// Release `key`. Failures are logged; the lease expires on its own.
    pub async fn unlock(&self, key: &str) {
        if let Err(e) = self.store.release(key).await {
            warn!(key, error = %e, "Failed to release lock");
        }
    }
}

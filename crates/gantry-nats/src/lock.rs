//! Distributed locks on a JetStream key-value bucket.
//!
//! A lock is a key whose value records its owner and lease expiry. Keys are
//! taken with create-if-absent; an entry whose lease has run out may be
//! taken over with a compare-and-swap on its revision. Release deletes only
//! the revision its owner last saw. The bucket's own `max_age` bounds any
//! entry left behind by a crashed holder.

use crate::connection::NatsConnection;
use crate::metrics::NatsMetrics;
use async_nats::jetstream::kv::{self, CreateErrorKind, DeleteErrorKind, Operation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::ports::LockStore;
use gantry_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lease {
    owner: Uuid,
    expires_at: DateTime<Utc>,
}

impl Lease {
    fn new(owner: Uuid, lease: Duration) -> Self {
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        Self {
            owner,
            expires_at: Utc::now().checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// NATS subjects cannot carry every character a lock key may contain.
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '=' => c,
            _ => '_',
        })
        .collect()
}

/// Lease-based [`LockStore`] shared by every engine instance.
#[derive(Clone)]
pub struct NatsLockStore {
    store: kv::Store,
    owner: Uuid,
    metrics: Arc<NatsMetrics>,
}

impl NatsLockStore {
    /// Open the lock bucket, creating it if needed.
    pub async fn new(connection: &NatsConnection) -> Result<Self> {
        let config = connection.config();
        let jetstream = connection.jetstream();

        let store = match jetstream.get_key_value(&config.lock_bucket).await {
            Ok(store) => store,
            Err(_) => jetstream
                .create_key_value(kv::Config {
                    bucket: config.lock_bucket.clone(),
                    history: 1,
                    max_age: config.lock_max_age,
                    ..Default::default()
                })
                .await
                .map_err(|e| Error::Lock(format!("Failed to create lock bucket: {}", e)))?,
        };

        let owner = Uuid::new_v4();
        info!(bucket = %config.lock_bucket, %owner, "Lock store ready");

        Ok(Self {
            store,
            owner,
            metrics: connection.metrics().clone(),
        })
    }

    async fn take_over(&self, key: &str, lease: &Lease) -> Result<bool> {
        let Some(entry) = self
            .store
            .entry(key)
            .await
            .map_err(|e| Error::Lock(format!("Failed to read lock {}: {}", key, e)))?
        else {
            return Ok(false);
        };

        if entry.operation == Operation::Put {
            let current: Lease = serde_json::from_slice(&entry.value)?;
            if !current.is_expired() {
                return Ok(false);
            }
            debug!(key, previous = %current.owner, "Taking over expired lock");
        }

        let payload = serde_json::to_vec(lease)?;
        Ok(self
            .store
            .update(key, payload.into(), entry.revision)
            .await
            .is_ok())
    }
}

#[async_trait]
impl LockStore for NatsLockStore {
    async fn try_acquire(&self, key: &str, lease: Duration) -> Result<bool> {
        let key = sanitize(key);
        let value = Lease::new(self.owner, lease);
        let payload = serde_json::to_vec(&value)?;

        let acquired = match self.store.create(&key, payload.into()).await {
            Ok(_) => true,
            Err(e) if e.kind() == CreateErrorKind::AlreadyExists => self.take_over(&key, &value).await?,
            Err(e) => return Err(Error::Lock(format!("Failed to acquire lock {}: {}", key, e))),
        };

        self.metrics.record_lock(acquired);
        Ok(acquired)
    }

    async fn release(&self, key: &str) -> Result<()> {
        let key = sanitize(key);
        let Some(entry) = self
            .store
            .entry(&key)
            .await
            .map_err(|e| Error::Lock(format!("Failed to read lock {}: {}", key, e)))?
        else {
            return Ok(());
        };
        if entry.operation != Operation::Put {
            return Ok(());
        }

        let current: Lease = serde_json::from_slice(&entry.value)?;
        if current.owner != self.owner {
            debug!(key, owner = %current.owner, "Lock is held by another owner, not releasing");
            return Ok(());
        }

        // Only delete the revision we read: the lease may have been taken
        // over in between.
        match self.store.delete_expect_revision(&key, Some(entry.revision)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == DeleteErrorKind::WrongLastRevision => {
                debug!(key, "Lock changed hands before release, leaving it");
                Ok(())
            }
            Err(e) => Err(Error::Lock(format!("Failed to release lock {}: {}", key, e))),
        }
    }
}

//! Configuration for the NATS adapters.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration shared by the event bus, the lock store and the work queue.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URLs (comma-separated for cluster).
    pub urls: Vec<String>,
    /// Credentials file for authenticated clusters.
    pub credentials_file: Option<PathBuf>,
    /// Stream receiving engine events.
    pub events_stream: String,
    /// Work-queue stream holding durable run evaluations.
    pub work_stream: String,
    /// Subject evaluations are published on.
    pub work_subject: String,
    /// Durable consumer shared by every engine instance.
    pub work_consumer: String,
    /// Key-value bucket backing distributed locks.
    pub lock_bucket: String,
    /// Connection timeout.
    pub connection_timeout: Duration,
    /// Request timeout for JetStream operations.
    pub request_timeout: Duration,
    /// Enable dead letter queue for undecodable work.
    pub enable_dlq: bool,
    /// Dead letter queue stream name.
    pub dlq_stream: String,
    /// Maximum delivery attempts of a queued evaluation.
    pub max_deliver: i64,
    /// Time a dequeued evaluation may stay unacknowledged.
    pub ack_wait: Duration,
    /// Event retention period.
    pub events_max_age: Duration,
    /// Upper bound on any lock entry, whatever lease it was taken with.
    pub lock_max_age: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            urls: vec!["nats://localhost:4222".to_string()],
            credentials_file: None,
            events_stream: "GANTRY_EVENTS".to_string(),
            work_stream: "GANTRY_WORK".to_string(),
            work_subject: "gantry.work.evaluate".to_string(),
            work_consumer: "gantry-engine".to_string(),
            lock_bucket: "gantry_locks".to_string(),
            connection_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            enable_dlq: true,
            dlq_stream: "GANTRY_DLQ".to_string(),
            max_deliver: 5,
            ack_wait: Duration::from_secs(30),
            events_max_age: Duration::from_secs(86400 * 7), // 7 days
            lock_max_age: Duration::from_secs(3600),
        }
    }
}

impl NatsConfig {
    /// Create a new config with a single URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    /// Set multiple server URLs for cluster support.
    pub fn with_urls(mut self, urls: Vec<String>) -> Self {
        self.urls = urls;
        self
    }

    pub fn with_credentials_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_file = Some(path.into());
        self
    }

    /// Prefix every stream, bucket and consumer name, e.g. to isolate test runs.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        let upper = namespace.to_uppercase();
        self.events_stream = format!("{upper}_{}", self.events_stream);
        self.work_stream = format!("{upper}_{}", self.work_stream);
        self.dlq_stream = format!("{upper}_{}", self.dlq_stream);
        self.work_subject = format!("{namespace}.{}", self.work_subject);
        self.work_consumer = format!("{namespace}-{}", self.work_consumer);
        self.lock_bucket = format!("{namespace}_{}", self.lock_bucket);
        self
    }

    /// Enable or disable dead letter queue.
    pub fn with_dlq(mut self, enable: bool) -> Self {
        self.enable_dlq = enable;
        self
    }

    pub fn with_max_deliver(mut self, max: i64) -> Self {
        self.max_deliver = max;
        self
    }

    pub fn with_lock_max_age(mut self, max_age: Duration) -> Self {
        self.lock_max_age = max_age;
        self
    }
}

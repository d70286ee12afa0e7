//! Shared NATS connection and JetStream context.

use crate::config::NatsConfig;
use crate::metrics::NatsMetrics;
use async_nats::jetstream::stream::{Config as StreamConfig, RetentionPolicy, StorageType};
use async_nats::jetstream::{self, Context};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use gantry_core::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Subjects the engine publishes events on.
pub const EVENT_SUBJECTS: [&str; 2] = ["job.>", "run.>"];

const DLQ_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 3600);

/// A work message that could not be processed.
#[derive(Serialize)]
struct DeadLetter<'a> {
    subject: &'a str,
    reason: &'a str,
    /// Raw payload, base64 encoded.
    payload: String,
    failed_at: DateTime<Utc>,
}

/// One client connection shared by every adapter.
#[derive(Clone)]
pub struct NatsConnection {
    client: async_nats::Client,
    jetstream: Context,
    config: NatsConfig,
    metrics: Arc<NatsMetrics>,
}

impl NatsConnection {
    /// Connect and make sure the event and dead letter streams exist.
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let servers = config.urls.join(",");
        info!(servers = %servers, "Connecting to NATS");

        let options = match &config.credentials_file {
            Some(path) => async_nats::ConnectOptions::with_credentials_file(path)
                .await
                .map_err(|e| Error::EventBus(format!("reading credentials {}: {e}", path.display())))?,
            None => async_nats::ConnectOptions::new(),
        };
        let client = options
            .connection_timeout(config.connection_timeout)
            .request_timeout(Some(config.request_timeout))
            .retry_on_initial_connect()
            .connect(&servers)
            .await
            .map_err(|e| Error::EventBus(format!("connecting to {servers}: {e}")))?;

        let jetstream = jetstream::new(client.clone());
        ensure_stream(
            &jetstream,
            &config.events_stream,
            EVENT_SUBJECTS.iter().map(|s| s.to_string()).collect(),
            config.events_max_age,
        )
        .await
        .map_err(Error::EventBus)?;
        if config.enable_dlq {
            ensure_stream(
                &jetstream,
                &config.dlq_stream,
                vec![format!("{}.dlq.>", config.work_subject)],
                DLQ_MAX_AGE,
            )
            .await
            .map_err(Error::Queue)?;
        }

        let metrics = NatsMetrics::new();
        metrics.set_connected(true);
        info!(events = %config.events_stream, "NATS streams ready");

        Ok(Self {
            client,
            jetstream,
            config,
            metrics,
        })
    }

    pub fn jetstream(&self) -> &Context {
        &self.jetstream
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<NatsMetrics> {
        &self.metrics
    }

    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    /// Park an undecodable work message in the dead letter stream.
    pub async fn send_to_dlq(&self, subject: &str, payload: &[u8], reason: &str) -> Result<()> {
        if !self.config.enable_dlq {
            return Ok(());
        }

        let letter = DeadLetter {
            subject,
            reason,
            payload: STANDARD.encode(payload),
            failed_at: Utc::now(),
        };
        let body = serde_json::to_vec(&letter)?;
        let dlq_subject = format!("{}.dlq.{subject}", self.config.work_subject);

        self.jetstream
            .publish(dlq_subject, body.into())
            .await
            .map_err(|e| Error::Queue(format!("dead letter for {subject}: {e}")))?
            .await
            .map_err(|e| Error::Queue(format!("dead letter ack for {subject}: {e}")))?;

        self.metrics.record_dlq();
        warn!(subject = %subject, reason = %reason, "Work message dead-lettered");
        Ok(())
    }

    /// Flush pending publications and close the connection.
    pub async fn shutdown(&self) {
        info!("Draining NATS connection");
        if let Err(e) = self.client.drain().await {
            error!(error = %e, "NATS drain failed");
        }
        self.metrics.set_connected(false);
    }
}

async fn ensure_stream(
    jetstream: &Context,
    name: &str,
    subjects: Vec<String>,
    max_age: Duration,
) -> std::result::Result<(), String> {
    jetstream
        .get_or_create_stream(StreamConfig {
            name: name.to_string(),
            subjects,
            retention: RetentionPolicy::Limits,
            max_age,
            storage: StorageType::File,
            ..Default::default()
        })
        .await
        .map(|_| ())
        .map_err(|e| format!("creating stream {name}: {e}"))
}

//! Durable evaluation queue on a JetStream work-queue stream.
//!
//! Every engine instance pulls from the same durable consumer, so a queued
//! evaluation is handed to exactly one of them. Messages are acknowledged as
//! soon as they are decoded. One lost after its ack is recovered by the
//! dispatcher's resume ticker, which re-evaluates every building run.

use crate::connection::NatsConnection;
use async_nats::jetstream::consumer::{AckPolicy, PullConsumer, pull::Config as ConsumerConfig};
use async_nats::jetstream::stream::{Config as StreamConfig, RetentionPolicy, StorageType};
use async_trait::async_trait;
use futures::StreamExt;
use gantry_core::ports::WorkQueue;
use gantry_core::run::RunEvaluation;
use gantry_core::{Error, Result};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shortest fetch expiry the server accepts without complaining.
const MIN_FETCH_EXPIRY: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct NatsWorkQueue {
    connection: NatsConnection,
    consumer: PullConsumer,
}

impl NatsWorkQueue {
    /// Open the work stream and its durable consumer, creating them if needed.
    pub async fn new(connection: NatsConnection) -> Result<Self> {
        let config = connection.config().clone();
        let jetstream = connection.jetstream();

        let stream = jetstream
            .get_or_create_stream(StreamConfig {
                name: config.work_stream.clone(),
                subjects: vec![config.work_subject.clone()],
                retention: RetentionPolicy::WorkQueue,
                storage: StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Queue(format!("Failed to create work stream: {}", e)))?;

        let consumer = stream
            .get_or_create_consumer(
                &config.work_consumer,
                ConsumerConfig {
                    durable_name: Some(config.work_consumer.clone()),
                    ack_policy: AckPolicy::Explicit,
                    max_deliver: config.max_deliver,
                    ack_wait: config.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::Queue(format!("Failed to create work consumer: {}", e)))?;

        info!(stream = %config.work_stream, consumer = %config.work_consumer, "Work queue ready");

        Ok(Self {
            connection,
            consumer,
        })
    }
}

#[async_trait]
impl WorkQueue for NatsWorkQueue {
    async fn enqueue(&self, evaluation: RunEvaluation) -> Result<()> {
        let subject = self.connection.config().work_subject.clone();
        let payload = serde_json::to_vec(&evaluation)?;

        self.connection
            .jetstream()
            .publish(subject, payload.into())
            .await
            .map_err(|e| Error::Queue(format!("Failed to enqueue evaluation: {}", e)))?
            .await
            .map_err(|e| Error::Queue(format!("Failed to confirm enqueue: {}", e)))?;

        self.connection.metrics().record_enqueue();
        debug!(run_id = %evaluation.run_id, "Evaluation enqueued");
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<RunEvaluation>> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(1)
            .expires(timeout.max(MIN_FETCH_EXPIRY))
            .messages()
            .await
            .map_err(|e| Error::Queue(format!("Failed to fetch evaluation: {}", e)))?;

        let Some(message) = batch.next().await else {
            return Ok(None);
        };
        let message = message.map_err(|e| Error::Queue(format!("Message error: {}", e)))?;

        let decoded = serde_json::from_slice::<RunEvaluation>(&message.payload);
        message
            .ack()
            .await
            .map_err(|e| Error::Queue(format!("Failed to acknowledge evaluation: {}", e)))?;

        match decoded {
            Ok(evaluation) => {
                self.connection.metrics().record_dequeue();
                Ok(Some(evaluation))
            }
            Err(e) => {
                warn!(error = %e, "Undecodable evaluation");
                self.connection
                    .send_to_dlq(message.subject.as_str(), &message.payload, &e.to_string())
                    .await?;
                Ok(None)
            }
        }
    }
}

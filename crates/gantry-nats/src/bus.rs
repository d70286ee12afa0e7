//! JetStream event bus.

use crate::connection::NatsConnection;
use async_trait::async_trait;
use gantry_core::events::Event;
use gantry_core::ports::EventBus;
use gantry_core::{Error, Result};
use tracing::debug;

/// Publishes engine events to the events stream.
#[derive(Clone)]
pub struct NatsEventBus {
    connection: NatsConnection,
}

impl NatsEventBus {
    pub fn new(connection: NatsConnection) -> Self {
        Self { connection }
    }

    /// Get stream info.
    pub async fn stream_info(&self) -> Result<StreamInfo> {
        let mut stream = self
            .connection
            .jetstream()
            .get_stream(&self.connection.config().events_stream)
            .await
            .map_err(|e| Error::EventBus(format!("Failed to get stream: {}", e)))?;

        let info = stream
            .info()
            .await
            .map_err(|e| Error::EventBus(format!("Failed to get stream info: {}", e)))?;

        Ok(StreamInfo {
            name: info.config.name.clone(),
            messages: info.state.messages,
            bytes: info.state.bytes,
            last_seq: info.state.last_sequence,
        })
    }
}

/// Information about a JetStream stream.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub name: String,
    pub messages: u64,
    pub bytes: u64,
    pub last_seq: u64,
}

#[async_trait]
impl EventBus for NatsEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        let subject = event.subject();
        let payload = serde_json::to_vec(&event)?;
        let payload_len = payload.len() as u64;
        let metrics = self.connection.metrics();
        debug!("Publishing event to {}", subject);

        match self
            .connection
            .jetstream()
            .publish(subject.clone(), payload.into())
            .await
        {
            Ok(ack_future) => {
                ack_future
                    .await
                    .map_err(|e| Error::EventBus(format!("Failed to confirm publish: {}", e)))?;
                metrics.record_publish(payload_len);
                Ok(())
            }
            Err(e) => {
                metrics.record_publish_failure();
                Err(Error::EventBus(format!(
                    "Failed to publish to {}: {}",
                    subject, e
                )))
            }
        }
    }
}

//! NATS JetStream adapters for Gantry: event bus, distributed lock store and
//! durable work queue, all sharing one [`NatsConnection`].

mod bus;
pub mod config;
mod connection;
mod lock;
pub mod metrics;
mod queue;

pub use bus::{NatsEventBus, StreamInfo};
pub use config::NatsConfig;
pub use connection::{EVENT_SUBJECTS, NatsConnection};
pub use lock::NatsLockStore;
pub use metrics::{MetricsSnapshot, NatsMetrics};
pub use queue::NatsWorkQueue;

//! Gantry workflow engine.
//!
//! Crafts runs into executable job graphs, evaluates which jobs may start,
//! enforces concurrency groups and recovers stuck job runs. All state goes
//! through the collaborator ports of `gantry_core::ports`.

pub mod concurrency;
pub mod condition;
pub mod config;
pub mod crafter;
pub mod dispatch;
pub mod expression;
pub mod graph;
pub mod lock;
pub mod matrix;
pub mod monitor;
mod publish;
pub mod telemetry;
pub mod trigger;

pub use concurrency::{Admission, ConcurrencyController};
pub use condition::ConditionEvaluator;
pub use config::{EngineConfig, LogConfig};
pub use crafter::{CraftError, RunCrafter};
pub use dispatch::{Dispatcher, EnginePorts, Work, WorkSender};
pub use matrix::MatrixExpander;
pub use monitor::JobMonitor;
pub use trigger::{Trigger, TriggerOutcome};

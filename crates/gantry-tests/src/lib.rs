//! Test infrastructure for the Gantry engine.
//!
//! In-memory implementations of every collaborator port, fixtures for
//! workflows and runs, and a [`Harness`] that wires them into a crafter, a
//! trigger and a monitor.
//!
//! # Usage
//!
//! ```ignore
//! use gantry_tests::{Harness, RunFixture, WorkflowFixture};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let mut h = Harness::new();
//!     let run_id = h.start_run(RunFixture::building(WorkflowFixture::chain())).await;
//!     h.evaluate(run_id).await;
//! }
//! ```

pub mod fixtures;
pub mod harness;
pub mod helpers;
pub mod memory;

pub use fixtures::*;
pub use harness::Harness;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,gantry_engine=debug")),
        )
        .with_test_writer()
        .try_init();
}

//! Gantry Core
//!
//! Domain types, traits, and error handling for the Gantry workflow engine.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the engine and its adapters: workflow graphs, runs, job runs,
//! diagnostics, events, and the collaborator ports the engine drives.

pub mod context;
pub mod diagnostic;
pub mod entity;
pub mod error;
pub mod events;
pub mod ids;
pub mod ordered;
pub mod ports;
pub mod run;
pub mod workflow;

pub use error::{Error, Result};
pub use ids::*;

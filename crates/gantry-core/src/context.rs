//! Read-only projections of job results exposed to expressions.

use crate::run::JobStatus;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Terminal result of a job, or the aggregate of all its matrix cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobResult {
    pub result: JobStatus,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

impl JobResult {
    pub fn new(result: JobStatus) -> Self {
        Self {
            result,
            outputs: BTreeMap::new(),
        }
    }
}

/// Results keyed by job name.
pub type JobsContext = BTreeMap<String, JobResult>;

//! User-visible diagnostics attached to runs and job runs.

use crate::ids::{InfoId, JobRunId, RunId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InfoLevel {
    Info,
    Warning,
    Error,
}

/// A run-info record, or a job-info record when `job_run_id` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunInfo {
    pub id: InfoId,
    pub run_id: RunId,
    #[serde(default)]
    pub job_run_id: Option<JobRunId>,
    pub level: InfoLevel,
    pub message: String,
    pub issued_at: DateTime<Utc>,
}

impl RunInfo {
    pub fn new(run_id: RunId, level: InfoLevel, message: impl Into<String>) -> Self {
        Self {
            id: InfoId::new(),
            run_id,
            job_run_id: None,
            level,
            message: message.into(),
            issued_at: Utc::now(),
        }
    }

    pub fn info(run_id: RunId, message: impl Into<String>) -> Self {
        Self::new(run_id, InfoLevel::Info, message)
    }

    pub fn warning(run_id: RunId, message: impl Into<String>) -> Self {
        Self::new(run_id, InfoLevel::Warning, message)
    }

    pub fn error(run_id: RunId, message: impl Into<String>) -> Self {
        Self::new(run_id, InfoLevel::Error, message)
    }

    /// Attach the record to a job run.
    pub fn for_job(mut self, job_run_id: JobRunId) -> Self {
        self.job_run_id = Some(job_run_id);
        self
    }

    pub fn is_job_info(&self) -> bool {
        self.job_run_id.is_some()
    }
}

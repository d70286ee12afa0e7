//! Events published by the engine.

use crate::diagnostic::RunInfo;
use crate::ids::{JobRunId, RunId};
use crate::run::{JobRun, JobStatus, Run, RunStatus};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A job run is ready for an executor.
    JobQueued(JobQueuedPayload),
    RunInfoIssued(RunInfo),
    JobInfoIssued(RunInfo),
    RunStatusChanged(RunStatusChangedPayload),
    JobStatusChanged(JobStatusChangedPayload),
}

impl Event {
    /// Returns the NATS subject for this event.
    pub fn subject(&self) -> String {
        match self {
            Event::JobQueued(p) => format!(
                "job.queued.{}.{}",
                p.region,
                p.model_type.as_deref().unwrap_or("any")
            ),
            Event::RunInfoIssued(p) => format!("run.{}.info", p.run_id),
            Event::JobInfoIssued(p) => match p.job_run_id {
                Some(job_run_id) => format!("run.{}.job.{}.info", p.run_id, job_run_id),
                None => format!("run.{}.info", p.run_id),
            },
            Event::RunStatusChanged(p) => format!("run.{}.status", p.run_id),
            Event::JobStatusChanged(p) => format!("run.{}.job.{}.status", p.run_id, p.job_run_id),
        }
    }

    /// Event for a persisted diagnostic.
    pub fn for_info(info: RunInfo) -> Self {
        if info.is_job_info() {
            Event::JobInfoIssued(info)
        } else {
            Event::RunInfoIssued(info)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobQueuedPayload {
    pub region: String,
    pub model_type: Option<String>,
    pub job_run_id: JobRunId,
    pub run_id: RunId,
    pub run_number: u64,
    pub workflow_name: String,
    pub project_key: String,
    pub job_id: String,
}

impl From<&JobRun> for JobQueuedPayload {
    fn from(job_run: &JobRun) -> Self {
        Self {
            region: job_run.region.clone(),
            model_type: job_run.model_type.clone(),
            job_run_id: job_run.id,
            run_id: job_run.run_id,
            run_number: job_run.run_number,
            workflow_name: job_run.workflow_name.clone(),
            project_key: job_run.project_key.clone(),
            job_id: job_run.job_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunStatusChangedPayload {
    pub run_id: RunId,
    pub workflow_name: String,
    pub project_key: String,
    pub status: RunStatus,
    pub changed_at: DateTime<Utc>,
}

impl From<&Run> for RunStatusChangedPayload {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.id,
            workflow_name: run.workflow_name.clone(),
            project_key: run.project_key.clone(),
            status: run.status,
            changed_at: run.last_modified,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobStatusChangedPayload {
    pub run_id: RunId,
    pub job_run_id: JobRunId,
    pub job_id: String,
    pub status: JobStatus,
    pub changed_at: DateTime<Utc>,
}

impl From<&JobRun> for JobStatusChangedPayload {
    fn from(job_run: &JobRun) -> Self {
        Self {
            run_id: job_run.run_id,
            job_run_id: job_run.id,
            job_id: job_run.job_id.clone(),
            status: job_run.status,
            changed_at: Utc::now(),
        }
    }
}

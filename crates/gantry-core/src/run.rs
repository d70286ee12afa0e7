//! Run and job run records.

use crate::diagnostic::RunInfo;
use crate::entity::ResolvedEntities;
use crate::ids::{JobRunId, RunId};
use crate::workflow::{ConcurrencyOrder, JobDefinition, MatrixCoordinate, WorkflowDefinition};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One execution of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Run {
    pub id: RunId,
    pub project_key: String,
    pub vcs_server: String,
    pub repository: String,
    pub workflow_name: String,
    pub workflow_ref: String,
    pub workflow_sha: String,
    pub run_number: u64,
    pub run_attempt: u32,
    pub status: RunStatus,
    pub workflow: WorkflowDefinition,
    #[serde(default)]
    pub resolved: ResolvedEntities,
    pub contexts: RunContexts,
    pub started: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl Run {
    /// A fresh run in `Crafting` status.
    pub fn new(
        project_key: impl Into<String>,
        vcs_server: impl Into<String>,
        repository: impl Into<String>,
        workflow: WorkflowDefinition,
        contexts: RunContexts,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            project_key: project_key.into(),
            vcs_server: vcs_server.into(),
            repository: repository.into(),
            workflow_name: workflow.name.clone(),
            workflow_ref: contexts.git.git_ref.clone(),
            workflow_sha: contexts.git.sha.clone(),
            run_number: 1,
            run_attempt: 1,
            status: RunStatus::Crafting,
            workflow,
            resolved: ResolvedEntities::default(),
            contexts,
            started: now,
            last_modified: now,
        }
    }

    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.last_modified = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Crafting,
    Building,
    Success,
    Fail,
    Stopped,
    Skipped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Fail | RunStatus::Stopped | RunStatus::Skipped
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Crafting => "Crafting",
            RunStatus::Building => "Building",
            RunStatus::Success => "Success",
            RunStatus::Fail => "Fail",
            RunStatus::Stopped => "Stopped",
            RunStatus::Skipped => "Skipped",
        };
        f.write_str(s)
    }
}

/// Triggering context captured when the run was created.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RunContexts {
    pub git: GitContext,
    #[serde(default)]
    pub vars: BTreeMap<String, serde_json::Value>,
    pub initiator: Initiator,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct GitContext {
    pub server: String,
    pub repository: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub sha: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Initiator {
    pub user_id: String,
    pub username: String,
}

/// State of a job run instance.
///
/// `Blocked` instances are waiting on a concurrency group and move to
/// `Waiting` once unblocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Blocked,
    Waiting,
    Scheduling,
    Building,
    Success,
    Fail,
    Stopped,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Fail | JobStatus::Stopped | JobStatus::Skipped
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Blocked => "Blocked",
            JobStatus::Waiting => "Waiting",
            JobStatus::Scheduling => "Scheduling",
            JobStatus::Building => "Building",
            JobStatus::Success => "Success",
            JobStatus::Fail => "Fail",
            JobStatus::Stopped => "Stopped",
            JobStatus::Skipped => "Skipped",
        };
        f.write_str(s)
    }
}

/// Executor process a job has been handed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutorRef {
    pub id: String,
    pub name: String,
}

/// Domain within which a concurrency group name is unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConcurrencyScope {
    Workflow {
        project: String,
        vcs: String,
        repository: String,
        workflow: String,
    },
    Project {
        project: String,
    },
}

impl ConcurrencyScope {
    pub fn for_run(run: &Run) -> Self {
        ConcurrencyScope::Workflow {
            project: run.project_key.clone(),
            vcs: run.vcs_server.clone(),
            repository: run.repository.clone(),
            workflow: run.workflow_name.clone(),
        }
    }

    /// Scope of groups declared on the project, shared by all its workflows.
    pub fn for_project(run: &Run) -> Self {
        ConcurrencyScope::Project {
            project: run.project_key.clone(),
        }
    }
}

/// Concurrency group a job run was admitted under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConcurrencyBinding {
    pub name: String,
    pub scope: ConcurrencyScope,
    pub pool: u32,
    pub order: ConcurrencyOrder,
    pub cancel_in_progress: bool,
}

/// One concrete attempt to execute a job, or one cell of its matrix.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobRun {
    pub id: JobRunId,
    pub run_id: RunId,
    pub run_number: u64,
    pub run_attempt: u32,
    pub project_key: String,
    pub workflow_name: String,
    pub job_id: String,
    pub job: JobDefinition,
    pub status: JobStatus,
    #[serde(default)]
    pub matrix: MatrixCoordinate,
    pub region: String,
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub worker_model: Option<String>,
    #[serde(default)]
    pub executor: Option<ExecutorRef>,
    #[serde(default)]
    pub concurrency: Option<ConcurrencyBinding>,
    /// Set when a cancel-in-progress admission asked for this instance to stop.
    #[serde(default)]
    pub pending_cancel: bool,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    pub user_id: String,
    pub queued: DateTime<Utc>,
    #[serde(default)]
    pub scheduled: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended: Option<DateTime<Utc>>,
}

impl JobRun {
    pub fn new(run: &Run, job_id: impl Into<String>, job: JobDefinition, status: JobStatus) -> Self {
        let now = Utc::now();
        Self {
            id: JobRunId::new(),
            run_id: run.id,
            run_number: run.run_number,
            run_attempt: run.run_attempt,
            project_key: run.project_key.clone(),
            workflow_name: run.workflow_name.clone(),
            job_id: job_id.into(),
            job,
            status,
            matrix: MatrixCoordinate::default(),
            region: String::new(),
            model_type: None,
            worker_model: None,
            executor: None,
            concurrency: None,
            pending_cancel: false,
            outputs: BTreeMap::new(),
            user_id: run.contexts.initiator.user_id.clone(),
            queued: now,
            scheduled: None,
            started: None,
            ended: if status.is_terminal() { Some(now) } else { None },
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to a terminal status and stamp the end time.
    pub fn finish(&mut self, status: JobStatus) {
        self.status = status;
        self.ended = Some(Utc::now());
    }
}

/// Writes produced by one engine pass, committed atomically.
#[derive(Debug, Clone, Default)]
pub struct RunChangeSet {
    pub run: Option<Run>,
    pub new_job_runs: Vec<JobRun>,
    pub updated_job_runs: Vec<JobRun>,
    pub infos: Vec<RunInfo>,
}

impl RunChangeSet {
    pub fn is_empty(&self) -> bool {
        self.run.is_none()
            && self.new_job_runs.is_empty()
            && self.updated_job_runs.is_empty()
            && self.infos.is_empty()
    }
}

/// Request to evaluate a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RunEvaluation {
    pub run_id: RunId,
    /// Jobs explicitly requested; empty for whole-run evaluation.
    #[serde(default)]
    pub job_names: Vec<String>,
    pub user_id: String,
}

impl RunEvaluation {
    pub fn new(run_id: RunId, user_id: impl Into<String>) -> Self {
        Self {
            run_id,
            job_names: Vec::new(),
            user_id: user_id.into(),
        }
    }

    pub fn with_jobs(mut self, jobs: Vec<String>) -> Self {
        self.job_names = jobs;
        self
    }
}

//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the engine and the external
//! collaborators it drives: persistence, entity lookup, repositories,
//! authorization, distributed locking, durable queueing, event publication
//! and executor liveness.

use crate::entity::{ActionDefinition, EntityKey, JobTemplate, WorkerModel};
use crate::events::Event;
use crate::ids::{JobRunId, RunId};
use crate::run::{ConcurrencyScope, ExecutorRef, JobRun, JobStatus, Run, RunChangeSet, RunEvaluation, RunStatus};
use crate::workflow::ConcurrencyRule;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Transactional store for runs, job runs and diagnostics.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn load_run(&self, id: RunId) -> Result<Option<Run>>;

    /// Identifiers of every run currently in `status`.
    async fn load_run_ids_by_status(&self, status: RunStatus) -> Result<Vec<RunId>>;

    /// Job runs of a run attempt.
    async fn load_job_runs(&self, run_id: RunId, run_attempt: u32) -> Result<Vec<JobRun>>;

    async fn load_job_run(&self, id: JobRunId) -> Result<Option<JobRun>>;

    /// Job runs that entered `status` before `before`.
    async fn load_job_runs_by_status(
        &self,
        status: JobStatus,
        before: DateTime<Utc>,
    ) -> Result<Vec<JobRun>>;

    /// Job runs bound to a concurrency group and currently in one of `statuses`.
    async fn load_concurrency_job_runs(
        &self,
        scope: &ConcurrencyScope,
        name: &str,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobRun>>;

    /// Apply every change of the set atomically, or none of them.
    async fn commit(&self, changes: RunChangeSet) -> Result<()>;
}

/// Lookup of reusable entities at a given revision.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn load_action(&self, key: &EntityKey) -> Result<Option<ActionDefinition>>;

    async fn load_worker_model(&self, key: &EntityKey) -> Result<Option<WorkerModel>>;

    async fn load_template(&self, key: &EntityKey) -> Result<Option<JobTemplate>>;

    async fn region_exists(&self, region: &str) -> Result<bool>;

    /// Concurrency rule declared at the project level.
    async fn load_project_concurrency(&self, project: &str, name: &str) -> Result<Option<ConcurrencyRule>>;
}

/// VCS repository client.
#[async_trait]
pub trait RepositoryClient: Send + Sync {
    /// Default branch ref, e.g. `refs/heads/main`.
    async fn default_branch(&self, project: &str, vcs: &str, repo: &str) -> Result<String>;
}

/// Permission checks delegated to the RBAC layer.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn can_execute_in_region(&self, user_id: &str, project: &str, region: &str)
    -> Result<bool>;

    async fn has_variable_set_rights(
        &self,
        user_id: &str,
        project: &str,
        variable_set: &str,
    ) -> Result<bool>;
}

/// Lease-based distributed lock shared by every engine instance.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Take `key` for `lease` if nobody holds it. Never waits.
    async fn try_acquire(&self, key: &str, lease: Duration) -> Result<bool>;

    async fn release(&self, key: &str) -> Result<()>;
}

/// Durable at-least-once queue of run evaluations.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, evaluation: RunEvaluation) -> Result<()>;

    /// Wait up to `timeout` for the next evaluation.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<RunEvaluation>>;
}

/// Event bus for publishing events.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;
}

/// Liveness of executor processes.
#[async_trait]
pub trait ExecutorLiveness: Send + Sync {
    async fn is_alive(&self, executor: &ExecutorRef) -> Result<bool>;
}

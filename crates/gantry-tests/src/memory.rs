//! In-memory implementations of the collaborator ports.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::diagnostic::RunInfo;
use gantry_core::entity::{ActionDefinition, EntityKey, JobTemplate, WorkerModel};
use gantry_core::events::Event;
use gantry_core::ids::{JobRunId, RunId};
use gantry_core::ports::{
    Authorizer, EntityStore, EventBus, ExecutorLiveness, LockStore, RepositoryClient, RunStore,
    WorkQueue,
};
use gantry_core::run::{
    ConcurrencyScope, ExecutorRef, JobRun, JobStatus, Run, RunChangeSet, RunEvaluation, RunStatus,
};
use gantry_core::workflow::ConcurrencyRule;
use gantry_core::{Error, Result};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;

#[derive(Default)]
struct StoreState {
    runs: HashMap<RunId, Run>,
    job_runs: BTreeMap<JobRunId, JobRun>,
    infos: Vec<RunInfo>,
}

/// Run store keeping everything in maps. Commits are all-or-nothing.
#[derive(Default)]
pub struct MemoryRunStore {
    state: RwLock<StoreState>,
    fail_commits: AtomicBool,
    commits: AtomicUsize,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_run(&self, run: Run) {
        self.state.write().await.runs.insert(run.id, run);
    }

    pub async fn insert_job_run(&self, job_run: JobRun) {
        self.state.write().await.job_runs.insert(job_run.id, job_run);
    }

    pub async fn run(&self, id: RunId) -> Option<Run> {
        self.state.read().await.runs.get(&id).cloned()
    }

    /// Every job run of a run, any attempt, oldest first.
    pub async fn job_runs_of(&self, run_id: RunId) -> Vec<JobRun> {
        self.state
            .read()
            .await
            .job_runs
            .values()
            .filter(|jr| jr.run_id == run_id)
            .cloned()
            .collect()
    }

    pub async fn infos_of(&self, run_id: RunId) -> Vec<RunInfo> {
        self.state
            .read()
            .await
            .infos
            .iter()
            .filter(|i| i.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Mutate a stored job run in place, as an executor would.
    pub async fn update_job_run(&self, id: JobRunId, update: impl FnOnce(&mut JobRun)) {
        if let Some(job_run) = self.state.write().await.job_runs.get_mut(&id) {
            update(job_run);
        }
    }

    pub async fn set_run_status(&self, id: RunId, status: RunStatus) {
        if let Some(run) = self.state.write().await.runs.get_mut(&id) {
            run.set_status(status);
        }
    }

    /// Make every following commit fail until reset.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

/// Time a job run entered its current status.
fn entered_status(job_run: &JobRun) -> DateTime<Utc> {
    match job_run.status {
        JobStatus::Scheduling => job_run.scheduled.unwrap_or(job_run.queued),
        JobStatus::Building => job_run.started.unwrap_or(job_run.queued),
        status if status.is_terminal() => job_run.ended.unwrap_or(job_run.queued),
        _ => job_run.queued,
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn load_run(&self, id: RunId) -> Result<Option<Run>> {
        Ok(self.run(id).await)
    }

    async fn load_run_ids_by_status(&self, status: RunStatus) -> Result<Vec<RunId>> {
        Ok(self
            .state
            .read()
            .await
            .runs
            .values()
            .filter(|r| r.status == status)
            .map(|r| r.id)
            .collect())
    }

    async fn load_job_runs(&self, run_id: RunId, run_attempt: u32) -> Result<Vec<JobRun>> {
        Ok(self
            .state
            .read()
            .await
            .job_runs
            .values()
            .filter(|jr| jr.run_id == run_id && jr.run_attempt == run_attempt)
            .cloned()
            .collect())
    }

    async fn load_job_run(&self, id: JobRunId) -> Result<Option<JobRun>> {
        Ok(self.state.read().await.job_runs.get(&id).cloned())
    }

    async fn load_job_runs_by_status(
        &self,
        status: JobStatus,
        before: DateTime<Utc>,
    ) -> Result<Vec<JobRun>> {
        Ok(self
            .state
            .read()
            .await
            .job_runs
            .values()
            .filter(|jr| jr.status == status && entered_status(jr) < before)
            .cloned()
            .collect())
    }

    async fn load_concurrency_job_runs(
        &self,
        scope: &ConcurrencyScope,
        name: &str,
        statuses: &[JobStatus],
    ) -> Result<Vec<JobRun>> {
        Ok(self
            .state
            .read()
            .await
            .job_runs
            .values()
            .filter(|jr| statuses.contains(&jr.status))
            .filter(|jr| {
                jr.concurrency
                    .as_ref()
                    .is_some_and(|b| b.name == name && &b.scope == scope)
            })
            .cloned()
            .collect())
    }

    async fn commit(&self, changes: RunChangeSet) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(Error::Database("commit refused".to_string()));
        }

        let mut state = self.state.write().await;
        for job_run in &changes.updated_job_runs {
            if !state.job_runs.contains_key(&job_run.id) {
                return Err(Error::JobRunNotFound(job_run.id.to_string()));
            }
        }

        if let Some(run) = changes.run {
            state.runs.insert(run.id, run);
        }
        for job_run in changes.new_job_runs.into_iter().chain(changes.updated_job_runs) {
            state.job_runs.insert(job_run.id, job_run);
        }
        state.infos.extend(changes.infos);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Entity store over fixed maps, counting loads.
#[derive(Default)]
pub struct MemoryEntityStore {
    actions: HashMap<EntityKey, ActionDefinition>,
    worker_models: HashMap<EntityKey, WorkerModel>,
    templates: HashMap<EntityKey, JobTemplate>,
    project_concurrencies: HashMap<(String, String), ConcurrencyRule>,
    regions: HashSet<String>,
    loads: AtomicUsize,
}

impl MemoryEntityStore {
    /// A store knowing only the `default` region.
    pub fn new() -> Self {
        Self::default().with_region("default")
    }

    pub fn with_action(mut self, key: EntityKey, action: ActionDefinition) -> Self {
        self.actions.insert(key, action);
        self
    }

    pub fn with_worker_model(mut self, key: EntityKey, model: WorkerModel) -> Self {
        self.worker_models.insert(key, model);
        self
    }

    pub fn with_template(mut self, key: EntityKey, template: JobTemplate) -> Self {
        self.templates.insert(key, template);
        self
    }

    pub fn with_project_concurrency(mut self, project: &str, rule: ConcurrencyRule) -> Self {
        self.project_concurrencies
            .insert((project.to_string(), rule.name.clone()), rule);
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.regions.insert(region.into());
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn load_action(&self, key: &EntityKey) -> Result<Option<ActionDefinition>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.actions.get(key).cloned())
    }

    async fn load_worker_model(&self, key: &EntityKey) -> Result<Option<WorkerModel>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.worker_models.get(key).cloned())
    }

    async fn load_template(&self, key: &EntityKey) -> Result<Option<JobTemplate>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.templates.get(key).cloned())
    }

    async fn region_exists(&self, region: &str) -> Result<bool> {
        Ok(self.regions.contains(region))
    }

    async fn load_project_concurrency(&self, project: &str, name: &str) -> Result<Option<ConcurrencyRule>> {
        Ok(self
            .project_concurrencies
            .get(&(project.to_string(), name.to_string()))
            .cloned())
    }
}

/// Repository client answering `refs/heads/main` unless told otherwise.
#[derive(Default)]
pub struct MemoryRepositories {
    default_branches: HashMap<(String, String, String), String>,
    calls: AtomicUsize,
}

impl MemoryRepositories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_branch(mut self, project: &str, vcs: &str, repo: &str, branch: &str) -> Self {
        self.default_branches.insert(
            (project.to_string(), vcs.to_string(), repo.to_string()),
            branch.to_string(),
        );
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepositoryClient for MemoryRepositories {
    async fn default_branch(&self, project: &str, vcs: &str, repo: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let key = (project.to_string(), vcs.to_string(), repo.to_string());
        Ok(self
            .default_branches
            .get(&key)
            .cloned()
            .unwrap_or_else(|| "refs/heads/main".to_string()))
    }
}

/// Authorizer granting everything except explicit denials.
#[derive(Default)]
pub struct MemoryAuthorizer {
    denied_regions: RwLock<HashSet<String>>,
    denied_variable_sets: RwLock<HashSet<String>>,
}

impl MemoryAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn deny_region(&self, region: &str) {
        self.denied_regions.write().await.insert(region.to_string());
    }

    pub async fn deny_variable_set(&self, variable_set: &str) {
        self.denied_variable_sets
            .write()
            .await
            .insert(variable_set.to_string());
    }
}

#[async_trait]
impl Authorizer for MemoryAuthorizer {
    async fn can_execute_in_region(&self, _user_id: &str, _project: &str, region: &str) -> Result<bool> {
        Ok(!self.denied_regions.read().await.contains(region))
    }

    async fn has_variable_set_rights(
        &self,
        _user_id: &str,
        _project: &str,
        variable_set: &str,
    ) -> Result<bool> {
        Ok(!self.denied_variable_sets.read().await.contains(variable_set))
    }
}

/// Lock store with lease expiry on the tokio clock.
#[derive(Default)]
pub struct MemoryLockStore {
    held: RwLock<HashMap<String, Instant>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_held(&self, key: &str) -> bool {
        self.held
            .read()
            .await
            .get(key)
            .is_some_and(|expiry| *expiry > Instant::now())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_acquire(&self, key: &str, lease: Duration) -> Result<bool> {
        let mut held = self.held.write().await;
        let now = Instant::now();
        if held.get(key).is_some_and(|expiry| *expiry > now) {
            return Ok(false);
        }
        held.insert(key.to_string(), now + lease);
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<()> {
        self.held.write().await.remove(key);
        Ok(())
    }
}

/// FIFO work queue.
#[derive(Default)]
pub struct MemoryWorkQueue {
    items: RwLock<VecDeque<RunEvaluation>>,
    notify: Notify,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    pub async fn drain(&self) -> Vec<RunEvaluation> {
        self.items.write().await.drain(..).collect()
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(&self, evaluation: RunEvaluation) -> Result<()> {
        self.items.write().await.push_back(evaluation);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<RunEvaluation>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(evaluation) = self.items.write().await.pop_front() {
                return Ok(Some(evaluation));
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }
}

/// Event bus recording every published event.
#[derive(Default)]
pub struct RecordingEventBus {
    events: RwLock<Vec<Event>>,
}

impl RecordingEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.read().await.clone()
    }

    /// Job runs announced to executors, in publication order.
    pub async fn queued_job_runs(&self) -> Vec<JobRunId> {
        self.events
            .read()
            .await
            .iter()
            .filter_map(|e| match e {
                Event::JobQueued(p) => Some(p.job_run_id),
                _ => None,
            })
            .collect()
    }

    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

#[async_trait]
impl EventBus for RecordingEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        self.events.write().await.push(event);
        Ok(())
    }
}

/// Every executor is alive until declared dead.
#[derive(Default)]
pub struct MemoryLiveness {
    dead: RwLock<HashSet<String>>,
}

impl MemoryLiveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn kill(&self, executor_id: &str) {
        self.dead.write().await.insert(executor_id.to_string());
    }
}

#[async_trait]
impl ExecutorLiveness for MemoryLiveness {
    async fn is_alive(&self, executor: &ExecutorRef) -> Result<bool> {
        Ok(!self.dead.read().await.contains(&executor.id))
    }
}

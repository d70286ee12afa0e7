//! Engine components wired to in-memory collaborators.
//!
//! The harness never spawns the dispatch loop: work sent by the engine
//! stays in the channel until [`Harness::drain_work`] processes it on the
//! test task, which keeps scenarios deterministic.

use crate::memory::{
    MemoryAuthorizer, MemoryEntityStore, MemoryLiveness, MemoryLockStore, MemoryRepositories,
    MemoryRunStore, MemoryWorkQueue, RecordingEventBus,
};
use chrono::Utc;
use gantry_core::diagnostic::RunInfo;
use gantry_core::ids::{JobRunId, RunId};
use gantry_core::ports::WorkQueue;
use gantry_core::run::{ExecutorRef, JobRun, JobStatus, Run, RunEvaluation, RunStatus};
use gantry_engine::{
    EngineConfig, EnginePorts, JobMonitor, RunCrafter, Trigger, TriggerOutcome, Work, WorkSender,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Upper bound on work items processed by one drain.
const MAX_DRAIN: usize = 1000;

pub struct Harness {
    pub runs: Arc<MemoryRunStore>,
    pub entities: Arc<MemoryEntityStore>,
    pub repositories: Arc<MemoryRepositories>,
    pub authorizer: Arc<MemoryAuthorizer>,
    pub locks: Arc<MemoryLockStore>,
    pub queue: Arc<MemoryWorkQueue>,
    pub events: Arc<RecordingEventBus>,
    pub liveness: Arc<MemoryLiveness>,
    pub config: EngineConfig,
    pub work: WorkSender,
    pub crafter: RunCrafter,
    pub trigger: Arc<Trigger>,
    pub monitor: JobMonitor,
    rx: mpsc::Receiver<Work>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::build(MemoryEntityStore::new(), MemoryRepositories::new(), EngineConfig::default())
    }

    pub fn with_entities(entities: MemoryEntityStore) -> Self {
        Self::build(entities, MemoryRepositories::new(), EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::build(MemoryEntityStore::new(), MemoryRepositories::new(), config)
    }

    pub fn build(
        entities: MemoryEntityStore,
        repositories: MemoryRepositories,
        config: EngineConfig,
    ) -> Self {
        let runs = Arc::new(MemoryRunStore::new());
        let entities = Arc::new(entities);
        let repositories = Arc::new(repositories);
        let authorizer = Arc::new(MemoryAuthorizer::new());
        let locks = Arc::new(MemoryLockStore::new());
        let queue = Arc::new(MemoryWorkQueue::new());
        let events = Arc::new(RecordingEventBus::new());
        let liveness = Arc::new(MemoryLiveness::new());

        let ports = EnginePorts {
            runs: runs.clone(),
            entities: entities.clone(),
            repositories: repositories.clone(),
            authorizer: authorizer.clone(),
            locks: locks.clone(),
            queue: queue.clone(),
            events: events.clone(),
            liveness: liveness.clone(),
        };

        let (work, rx) = WorkSender::channel(config.channel_capacity, ports.queue.clone());
        let trigger = Arc::new(Trigger::new(&ports, work.clone(), config.clone()));
        let crafter = RunCrafter::new(&ports, work.clone(), config.clone());
        let monitor = JobMonitor::new(&ports, trigger.clone(), config.clone());

        Self {
            runs,
            entities,
            repositories,
            authorizer,
            locks,
            queue,
            events,
            liveness,
            config,
            work,
            crafter,
            trigger,
            monitor,
            rx,
        }
    }

    /// Collaborators as the engine sees them.
    pub fn ports(&self) -> EnginePorts {
        EnginePorts {
            runs: self.runs.clone(),
            entities: self.entities.clone(),
            repositories: self.repositories.clone(),
            authorizer: self.authorizer.clone(),
            locks: self.locks.clone(),
            queue: self.queue.clone(),
            events: self.events.clone(),
            liveness: self.liveness.clone(),
        }
    }

    /// Store a run and request its crafting or evaluation, without
    /// processing anything.
    pub async fn start_run(&self, run: Run) -> RunId {
        let id = run.id;
        let crafting = run.status == RunStatus::Crafting;
        let user_id = run.contexts.initiator.user_id.clone();
        self.runs.insert_run(run).await;
        if crafting {
            self.work.request_craft(id);
        } else {
            self.work
                .enqueue(RunEvaluation::new(id, user_id))
                .await
                .expect("enqueue evaluation");
        }
        id
    }

    /// Store a run and process work until the engine is idle.
    pub async fn launch(&mut self, run: Run) -> RunId {
        let id = self.start_run(run).await;
        self.drain_work().await;
        id
    }

    /// Evaluate a run once, as a whole-run pass from its initiator.
    pub async fn evaluate(&self, run_id: RunId) -> TriggerOutcome {
        self.trigger
            .trigger(&RunEvaluation::new(run_id, ""))
            .await
            .expect("trigger")
    }

    /// Evaluate the named jobs of a run on behalf of `user_id`.
    pub async fn evaluate_jobs(&self, run_id: RunId, user_id: &str, jobs: &[&str]) -> TriggerOutcome {
        let evaluation = RunEvaluation::new(run_id, user_id)
            .with_jobs(jobs.iter().map(|j| j.to_string()).collect());
        self.trigger.trigger(&evaluation).await.expect("trigger")
    }

    /// Process queued work on the test task until both the channel and the
    /// durable queue are empty. Returns the number of items processed.
    pub async fn drain_work(&mut self) -> usize {
        let mut processed = 0;
        while processed < MAX_DRAIN {
            let work = match self.rx.try_recv() {
                Ok(work) => work,
                Err(_) => match self.queue.dequeue(Duration::ZERO).await.expect("dequeue") {
                    Some(evaluation) => Work::Evaluate(evaluation),
                    None => break,
                },
            };
            self.process(work).await;
            processed += 1;
        }
        processed
    }

    /// Pending work items in the channel, without processing them.
    pub fn pending_work(&mut self) -> Vec<Work> {
        let mut pending = Vec::new();
        while let Ok(work) = self.rx.try_recv() {
            pending.push(work);
        }
        pending
    }

    async fn process(&self, work: Work) {
        debug!(work = ?work, "Processing work");
        match work {
            Work::Craft(run_id) => self.crafter.craft(run_id).await.expect("craft"),
            Work::Evaluate(evaluation) => {
                self.trigger.trigger(&evaluation).await.expect("trigger");
            }
            Work::JobEnded(job_run_id) => self.trigger.job_ended(job_run_id).await.expect("job ended"),
        }
    }

    pub async fn run(&self, run_id: RunId) -> Run {
        self.runs.run(run_id).await.expect("run exists")
    }

    pub async fn run_status(&self, run_id: RunId) -> RunStatus {
        self.run(run_id).await.status
    }

    pub async fn job_runs(&self, run_id: RunId) -> Vec<JobRun> {
        self.runs.job_runs_of(run_id).await
    }

    /// Every instance of a job, oldest first.
    pub async fn instances(&self, run_id: RunId, job_id: &str) -> Vec<JobRun> {
        self.job_runs(run_id)
            .await
            .into_iter()
            .filter(|jr| jr.job_id == job_id)
            .collect()
    }

    /// The single instance of a job, if it has one.
    pub async fn job_run(&self, run_id: RunId, job_id: &str) -> Option<JobRun> {
        let mut instances = self.instances(run_id, job_id).await;
        assert!(instances.len() <= 1, "job {job_id} has {} instances", instances.len());
        instances.pop()
    }

    pub async fn job_status(&self, run_id: RunId, job_id: &str) -> Option<JobStatus> {
        self.job_run(run_id, job_id).await.map(|jr| jr.status)
    }

    pub async fn infos(&self, run_id: RunId) -> Vec<RunInfo> {
        self.runs.infos_of(run_id).await
    }

    /// Messages of every diagnostic issued for a run.
    pub async fn messages(&self, run_id: RunId) -> Vec<String> {
        self.infos(run_id).await.into_iter().map(|i| i.message).collect()
    }

    /// An executor takes a job run.
    pub async fn schedule(&self, job_run_id: JobRunId, executor: &str) {
        self.runs
            .update_job_run(job_run_id, |jr| {
                jr.status = JobStatus::Scheduling;
                jr.scheduled = Some(Utc::now());
                jr.executor = Some(ExecutorRef {
                    id: executor.to_string(),
                    name: executor.to_string(),
                });
            })
            .await;
    }

    /// The executor holding a job run starts it.
    pub async fn start(&self, job_run_id: JobRunId, executor: &str) {
        self.schedule(job_run_id, executor).await;
        self.runs
            .update_job_run(job_run_id, |jr| {
                jr.status = JobStatus::Building;
                jr.started = Some(Utc::now());
            })
            .await;
    }

    /// Finish one job run as an executor would, then let the engine react.
    pub async fn finish_job_run(&mut self, job_run_id: JobRunId, status: JobStatus) {
        self.runs
            .update_job_run(job_run_id, |jr| jr.finish(status))
            .await;
        self.work.job_ended(job_run_id).await.expect("job ended");
        self.drain_work().await;
    }

    /// Finish every unfinished instance of a job.
    pub async fn finish_job(&mut self, run_id: RunId, job_id: &str, status: JobStatus) {
        let pending: Vec<JobRunId> = self
            .instances(run_id, job_id)
            .await
            .into_iter()
            .filter(|jr| !jr.is_terminal())
            .map(|jr| jr.id)
            .collect();
        assert!(!pending.is_empty(), "job {job_id} has no unfinished instance");
        for id in pending {
            self.finish_job_run(id, status).await;
        }
    }
}

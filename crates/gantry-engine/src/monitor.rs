//! Periodic sweepers over stuck job runs.
//!
//! Every sweeper follows the same pattern per job run: take the job lock,
//! reload, check the status still holds, act, release. The blocked sweeper
//! works per concurrency group instead and hands free slots to successors.

use crate::config::EngineConfig;
use crate::dispatch::EnginePorts;
use crate::lock::{self, Locker};
use crate::publish::publish_all;
use crate::trigger::Trigger;
use chrono::{DateTime, TimeDelta, Utc};
use gantry_core::Result;
use gantry_core::diagnostic::RunInfo;
use gantry_core::events::{Event, JobQueuedPayload, JobStatusChangedPayload};
use gantry_core::ids::JobRunId;
use gantry_core::ports::{EventBus, ExecutorLiveness, RunStore};
use gantry_core::run::{ConcurrencyBinding, JobRun, JobStatus, RunChangeSet};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Which sweeper is looking at a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sweep {
    Waiting { cutoff: DateTime<Utc> },
    Scheduling { cutoff: DateTime<Utc> },
    DeadExecutor,
}

impl Sweep {
    fn status(&self) -> JobStatus {
        match self {
            Sweep::Waiting { .. } => JobStatus::Waiting,
            Sweep::Scheduling { .. } => JobStatus::Scheduling,
            Sweep::DeadExecutor => JobStatus::Building,
        }
    }

    fn before(&self) -> DateTime<Utc> {
        match self {
            Sweep::Waiting { cutoff } | Sweep::Scheduling { cutoff } => *cutoff,
            Sweep::DeadExecutor => Utc::now(),
        }
    }
}

/// Recovers job runs stuck waiting, scheduling, or bound to a dead executor.
pub struct JobMonitor {
    store: Arc<dyn RunStore>,
    events: Arc<dyn EventBus>,
    liveness: Arc<dyn ExecutorLiveness>,
    locker: Locker,
    trigger: Arc<Trigger>,
    config: EngineConfig,
}

impl JobMonitor {
    pub fn new(ports: &EnginePorts, trigger: Arc<Trigger>, config: EngineConfig) -> Self {
        Self {
            store: ports.runs.clone(),
            events: ports.events.clone(),
            liveness: ports.liveness.clone(),
            locker: Locker::new(ports.locks.clone(), config.lock_retries),
            trigger,
            config,
        }
    }

    /// Fail job runs that waited for an executor longer than the waiting timeout.
    #[instrument(skip(self))]
    pub async fn sweep_waiting(&self) -> Result<usize> {
        let cutoff = Utc::now() - TimeDelta::seconds(self.config.waiting_timeout_secs as i64);
        self.sweep(Sweep::Waiting { cutoff }).await
    }

    /// Requeue job runs an executor took but never started.
    #[instrument(skip(self))]
    pub async fn sweep_scheduling(&self) -> Result<usize> {
        let cutoff = Utc::now() - TimeDelta::seconds(self.config.scheduling_timeout_secs as i64);
        self.sweep(Sweep::Scheduling { cutoff }).await
    }

    /// Stop building job runs whose executor is gone.
    #[instrument(skip(self))]
    pub async fn sweep_dead_executors(&self) -> Result<usize> {
        self.sweep(Sweep::DeadExecutor).await
    }

    /// Unblock successors of groups that have a free slot nobody handed over.
    #[instrument(skip(self))]
    pub async fn sweep_blocked(&self) -> Result<usize> {
        let blocked = self
            .store
            .load_job_runs_by_status(JobStatus::Blocked, Utc::now())
            .await?;

        let mut groups: Vec<ConcurrencyBinding> = Vec::new();
        for binding in blocked.into_iter().filter_map(|jr| jr.concurrency) {
            if !groups.contains(&binding) {
                groups.push(binding);
            }
        }

        let mut released = 0;
        for binding in &groups {
            match self.trigger.release_slots(binding).await {
                Ok(count) => released += count,
                Err(e) => error!(group = %binding.name, error = %e, "Failed to release group slots"),
            }
        }
        if released > 0 {
            info!(released, "Unblocked job runs");
        }
        Ok(released)
    }

    async fn sweep(&self, sweep: Sweep) -> Result<usize> {
        let candidates = self
            .store
            .load_job_runs_by_status(sweep.status(), sweep.before())
            .await?;

        let mut handled = 0;
        for candidate in candidates {
            match self.check(sweep, candidate.id).await {
                Ok(true) => handled += 1,
                Ok(false) => {}
                Err(e) => error!(job_run_id = %candidate.id, error = %e, "Failed to check job run"),
            }
        }
        if handled > 0 {
            info!(status = %sweep.status(), handled, "Recovered stuck job runs");
        }
        Ok(handled)
    }

    async fn check(&self, sweep: Sweep, job_run_id: JobRunId) -> Result<bool> {
        let key = lock::job_key(job_run_id);
        if !self.locker.try_lock(&key, self.config.job_lock_lease()).await? {
            debug!(%job_run_id, "Job run is locked, skipping");
            return Ok(false);
        }
        let result = self.check_locked(sweep, job_run_id).await;
        self.locker.unlock(&key).await;
        result
    }

    async fn check_locked(&self, sweep: Sweep, job_run_id: JobRunId) -> Result<bool> {
        let Some(mut job_run) = self.store.load_job_run(job_run_id).await? else {
            return Ok(false);
        };
        if job_run.status != sweep.status() {
            return Ok(false);
        }

        match sweep {
            Sweep::Waiting { cutoff } => {
                if job_run.queued >= cutoff {
                    return Ok(false);
                }
                let message = format!(
                    "job {}: no executor took the job within {}s",
                    job_run.job_id, self.config.waiting_timeout_secs
                );
                job_run.finish(JobStatus::Fail);
                let info = RunInfo::error(job_run.run_id, message);
                self.end(job_run, info).await?;
            }
            Sweep::Scheduling { cutoff } => {
                if job_run.scheduled.unwrap_or(job_run.queued) >= cutoff {
                    return Ok(false);
                }
                self.requeue(job_run).await?;
            }
            Sweep::DeadExecutor => {
                let alive = match &job_run.executor {
                    Some(executor) => self.liveness.is_alive(executor).await?,
                    None => false,
                };
                if alive {
                    return Ok(false);
                }
                let executor = job_run
                    .executor
                    .as_ref()
                    .map(|e| e.name.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                let message = format!("job {}: executor {executor} is not alive anymore", job_run.job_id);
                job_run.finish(JobStatus::Stopped);
                let info = RunInfo::warning(job_run.run_id, message);
                self.end(job_run, info).await?;
            }
        }
        Ok(true)
    }

    /// Commit a forced terminal status, then release the job's slot and
    /// re-evaluate its run.
    async fn end(&self, job_run: JobRun, info: RunInfo) -> Result<()> {
        let info = info.for_job(job_run.id);
        warn!(job_run_id = %job_run.id, job = %job_run.job_id, status = %job_run.status, "{}", info.message);

        self.store
            .commit(RunChangeSet {
                updated_job_runs: vec![job_run.clone()],
                infos: vec![info.clone()],
                ..Default::default()
            })
            .await?;

        publish_all(
            self.events.as_ref(),
            vec![
                Event::for_info(info),
                Event::JobStatusChanged(JobStatusChangedPayload::from(&job_run)),
            ],
        )
        .await;

        self.trigger.job_ended(job_run.id).await
    }

    /// Hand a job run back to the executors. This is a retry, not a failure.
    async fn requeue(&self, mut job_run: JobRun) -> Result<()> {
        job_run.status = JobStatus::Waiting;
        job_run.executor = None;
        job_run.scheduled = None;

        self.store
            .commit(RunChangeSet {
                updated_job_runs: vec![job_run.clone()],
                ..Default::default()
            })
            .await?;

        info!(job_run_id = %job_run.id, job = %job_run.job_id, "Job run requeued after scheduling timeout");
        publish_all(
            self.events.as_ref(),
            vec![
                Event::JobQueued(JobQueuedPayload::from(&job_run)),
                Event::JobStatusChanged(JobStatusChangedPayload::from(&job_run)),
            ],
        )
        .await;
        Ok(())
    }
}

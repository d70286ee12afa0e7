//! Run evaluation: deciding which jobs run next.
//!
//! A pass loads every job run of the current attempt, projects the finished
//! ones into job results and walks the jobs that have no instance yet. Each
//! eligible job goes through its condition, authorization and concurrency
//! admission before its matrix is materialized. All writes of a pass are
//! committed together; events are published once the commit succeeded.

use crate::concurrency::{self, Admission, ConcurrencyController};
use crate::condition::{ConditionEvaluator, collect_results};
use crate::config::EngineConfig;
use crate::dispatch::{EnginePorts, WorkSender};
use crate::expression::evaluate_condition;
use crate::graph::{JobGraph, StageGate};
use crate::lock::{self, Locker};
use crate::matrix::MatrixExpander;
use crate::publish::publish_all;
use chrono::Utc;
use gantry_core::diagnostic::RunInfo;
use gantry_core::events::{Event, JobQueuedPayload, JobStatusChangedPayload, RunStatusChangedPayload};
use gantry_core::ids::JobRunId;
use gantry_core::ports::{Authorizer, EntityStore, EventBus, RunStore};
use gantry_core::run::{
    ConcurrencyBinding, ConcurrencyScope, JobRun, JobStatus, Run, RunChangeSet, RunEvaluation,
    RunStatus,
};
use gantry_core::workflow::{JobDefinition, MatrixSpec};
use gantry_core::{Error, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Result of a trigger request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The pass ran to completion.
    Evaluated { created: usize, terminal: usize },
    /// Another evaluation holds the run lock; the request should be retried.
    LockBusy,
    /// Nothing to do for this run.
    Ignored,
}

/// Aggregate status of a run from its job runs.
///
/// `Building` while anything is unfinished, then `Stopped` over `Fail` over
/// `Success`. Failures of jobs that continue on error do not fail the run.
pub fn aggregate_status(job_runs: &[JobRun]) -> RunStatus {
    if job_runs.iter().any(|jr| !jr.is_terminal()) {
        return RunStatus::Building;
    }
    if job_runs.iter().any(|jr| jr.status == JobStatus::Stopped) {
        return RunStatus::Stopped;
    }
    if job_runs
        .iter()
        .any(|jr| jr.status == JobStatus::Fail && !jr.job.continue_on_error)
    {
        return RunStatus::Fail;
    }
    RunStatus::Success
}

/// Everything a pass wants to write and announce.
#[derive(Default)]
struct Pass {
    changes: RunChangeSet,
    events: Vec<Event>,
    terminal: usize,
}

impl Pass {
    fn info(&mut self, info: RunInfo) {
        self.changes.infos.push(info);
    }

    fn add(&mut self, job_run: JobRun) {
        if job_run.is_terminal() {
            self.terminal += 1;
        }
        if job_run.status == JobStatus::Waiting {
            self.events.push(Event::JobQueued(JobQueuedPayload::from(&job_run)));
        }
        self.events
            .push(Event::JobStatusChanged(JobStatusChangedPayload::from(&job_run)));
        self.changes.new_job_runs.push(job_run);
    }

    /// Record a job that cannot run, with the reason as an error job-info.
    fn fail(&mut self, run: &Run, job_id: &str, job: &JobDefinition, user_id: &str, message: String) {
        let mut job_run = JobRun::new(run, job_id, job.clone(), JobStatus::Fail);
        job_run.user_id = user_id.to_string();
        self.info(RunInfo::error(run.id, message).for_job(job_run.id));
        self.add(job_run);
    }

    fn flag_for_cancel(&mut self, job_runs: Vec<JobRun>) {
        for jr in job_runs {
            if !self.changes.updated_job_runs.iter().any(|u| u.id == jr.id) {
                self.changes.updated_job_runs.push(jr);
            }
        }
    }
}

/// Evaluates runs and materializes their next job runs.
pub struct Trigger {
    store: Arc<dyn RunStore>,
    entities: Arc<dyn EntityStore>,
    authorizer: Arc<dyn Authorizer>,
    events: Arc<dyn EventBus>,
    locker: Locker,
    work: WorkSender,
    concurrency: ConcurrencyController,
    matrix: MatrixExpander,
    config: EngineConfig,
}

impl Trigger {
    pub fn new(ports: &EnginePorts, work: WorkSender, config: EngineConfig) -> Self {
        Self {
            store: ports.runs.clone(),
            entities: ports.entities.clone(),
            authorizer: ports.authorizer.clone(),
            events: ports.events.clone(),
            locker: Locker::new(ports.locks.clone(), config.lock_retries),
            work,
            concurrency: ConcurrencyController::new(ports.runs.clone()),
            matrix: MatrixExpander::new(),
            config,
        }
    }

    /// Evaluate a run under its run lock.
    #[instrument(skip(self, evaluation), fields(run_id = %evaluation.run_id))]
    pub async fn trigger(&self, evaluation: &RunEvaluation) -> Result<TriggerOutcome> {
        let key = lock::run_key(evaluation.run_id);
        if !self.locker.try_lock(&key, self.config.run_lock_lease()).await? {
            debug!("Run is locked by another evaluation");
            return Ok(TriggerOutcome::LockBusy);
        }

        let result = self.evaluate(evaluation).await;
        self.locker.unlock(&key).await;
        result
    }

    async fn evaluate(&self, evaluation: &RunEvaluation) -> Result<TriggerOutcome> {
        let Some(mut run) = self.store.load_run(evaluation.run_id).await? else {
            debug!("Run not found");
            return Ok(TriggerOutcome::Ignored);
        };
        if run.status == RunStatus::Crafting {
            debug!("Run is still crafting");
            return Ok(TriggerOutcome::Ignored);
        }

        let explicit = !evaluation.job_names.is_empty();
        if run.status.is_terminal() && !explicit {
            debug!(status = %run.status, "Run already ended");
            return Ok(TriggerOutcome::Ignored);
        }

        let job_runs = self.store.load_job_runs(run.id, run.run_attempt).await?;
        let mut pass = Pass::default();

        if explicit && !run.status.is_terminal() && !job_runs.is_empty() {
            pass.info(RunInfo::warning(
                run.id,
                "unable to start a job on a running workflow",
            ));
            self.finish(&run, pass).await?;
            return Ok(TriggerOutcome::Evaluated {
                created: 0,
                terminal: 0,
            });
        }

        let user_id = if evaluation.user_id.is_empty() {
            run.contexts.initiator.user_id.clone()
        } else {
            evaluation.user_id.clone()
        };

        let graph = JobGraph::build(&run.workflow)
            .map_err(|e| Error::InvalidWorkflow(format!("run {}: {e}", run.id)))?;
        let results = collect_results(&job_runs);
        let evaluator = ConditionEvaluator::new(&run, &graph, &results);
        let stages = StageGate::compute(&run.workflow, &job_runs);

        let existing: BTreeSet<&str> = job_runs.iter().map(|jr| jr.job_id.as_str()).collect();
        let candidates: Vec<String> = if explicit {
            let mut requested = Vec::new();
            for name in &evaluation.job_names {
                if !run.workflow.jobs.contains_key(name) {
                    pass.info(RunInfo::warning(run.id, format!("job {name}: not found in workflow")));
                } else if !existing.contains(name.as_str()) {
                    requested.push(name.clone());
                }
            }
            requested
        } else {
            run.workflow
                .jobs
                .keys()
                .filter(|name| !existing.contains(name.as_str()))
                .cloned()
                .collect()
        };

        for job_id in &candidates {
            let job = &run.workflow.jobs[job_id];

            if let Some(stage) = job.stage.as_deref() {
                if run.workflow.uses_stages() && !stages.can_run(stage) {
                    if explicit {
                        pass.info(RunInfo::warning(
                            run.id,
                            format!("job {job_id}: stage {stage} cannot be run yet"),
                        ));
                    }
                    continue;
                }
            }

            let missing = evaluator.missing_needs(job_id);
            if !missing.is_empty() {
                if explicit {
                    pass.info(RunInfo::warning(
                        run.id,
                        format!("job {job_id}: missing some required job: {}", missing.join(", ")),
                    ));
                }
                continue;
            }

            match evaluator.evaluate(job_id) {
                Err(e) => {
                    pass.fail(
                        &run,
                        job_id,
                        job,
                        &user_id,
                        format!("job {job_id}: unable to evaluate condition: {e}"),
                    );
                    continue;
                }
                Ok(false) if explicit => {
                    pass.info(RunInfo::warning(
                        run.id,
                        format!("job {job_id}: cannot be run because of if statement"),
                    ));
                    continue;
                }
                Ok(false) => {
                    let mut skipped = JobRun::new(&run, job_id.as_str(), job.clone(), JobStatus::Skipped);
                    skipped.user_id = user_id.clone();
                    pass.info(
                        RunInfo::info(
                            run.id,
                            format!("job {job_id}: cannot be run because of if statement"),
                        )
                        .for_job(skipped.id),
                    );
                    pass.add(skipped);
                    continue;
                }
                Ok(true) => {}
            }

            let region = job
                .region
                .clone()
                .unwrap_or_else(|| self.config.default_region.clone());
            if !self.authorize(&run, job_id, job, &region, &user_id, &mut pass).await? {
                continue;
            }

            let binding = match self.binding(&run, job_id, job, &evaluator, &mut pass).await? {
                Ok(binding) => binding,
                Err(message) => {
                    pass.fail(&run, job_id, job, &user_id, message);
                    continue;
                }
            };

            let empty = MatrixSpec::new();
            for coordinate in self.matrix.expand(job.matrix().unwrap_or(&empty)) {
                let mut status = JobStatus::Waiting;
                let mut blocked_by = None;
                if let Some(binding) = &binding {
                    match self
                        .concurrency
                        .admit(binding, &pass.changes.new_job_runs)
                        .await?
                    {
                        Admission::Admit { cancel } => pass.flag_for_cancel(cancel),
                        Admission::Block { message } => {
                            status = JobStatus::Blocked;
                            blocked_by = Some(message);
                        }
                    }
                }

                let mut job_run = JobRun::new(&run, job_id.as_str(), job.clone(), status);
                job_run.matrix = coordinate;
                job_run.region = region.clone();
                job_run.worker_model = job.runs_on.clone();
                job_run.model_type = job
                    .runs_on
                    .as_ref()
                    .and_then(|m| run.resolved.worker_models.get(m))
                    .map(|m| m.model_type.clone());
                job_run.concurrency = binding.clone();
                job_run.user_id = user_id.clone();
                if let Some(message) = blocked_by {
                    pass.info(RunInfo::info(run.id, message).for_job(job_run.id));
                }
                debug!(
                    job = %self.matrix.display_name(job_id, &job_run.matrix),
                    status = %job_run.status,
                    "Job run created"
                );
                pass.add(job_run);
            }
        }

        let created = pass.changes.new_job_runs.len();
        let terminal = pass.terminal;

        if created > 0 && run.status.is_terminal() {
            run.set_status(RunStatus::Building);
            pass.changes.run = Some(run.clone());
        } else if created == 0 && !explicit && !run.status.is_terminal() {
            let status = aggregate_status(&job_runs);
            if status != run.status {
                run.set_status(status);
                pass.changes.run = Some(run.clone());
            }
        }

        self.finish(&run, pass).await?;

        if terminal > 0 {
            self.work.enqueue(RunEvaluation::new(run.id, user_id)).await?;
        }

        info!(created, terminal, status = %run.status, "Run evaluated");
        Ok(TriggerOutcome::Evaluated { created, terminal })
    }

    /// Check the region and variable set rights of the triggering user.
    async fn authorize(
        &self,
        run: &Run,
        job_id: &str,
        job: &JobDefinition,
        region: &str,
        user_id: &str,
        pass: &mut Pass,
    ) -> Result<bool> {
        if !self
            .authorizer
            .can_execute_in_region(user_id, &run.project_key, region)
            .await?
        {
            pass.fail(
                run,
                job_id,
                job,
                user_id,
                format!("you don't have the right to execute job {job_id} in region {region}"),
            );
            return Ok(false);
        }

        for variable_set in &job.vars {
            if !self
                .authorizer
                .has_variable_set_rights(user_id, &run.project_key, variable_set)
                .await?
            {
                pass.fail(
                    run,
                    job_id,
                    job,
                    user_id,
                    format!("job {job_id}: you don't have the right to use variable set {variable_set}"),
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The concurrency group a job is admitted under, if any.
    ///
    /// Root jobs without a group of their own fall under the workflow group.
    /// Concurrency group of a job: its own, or the workflow's for root jobs.
    /// Names are looked up on the workflow first, then on the project.
    async fn binding(
        &self,
        run: &Run,
        job_id: &str,
        job: &JobDefinition,
        evaluator: &ConditionEvaluator<'_>,
        pass: &mut Pass,
    ) -> Result<std::result::Result<Option<ConcurrencyBinding>, String>> {
        let name = match (&job.concurrency, &run.workflow.concurrency) {
            (Some(name), _) => name,
            (None, Some(name)) if job.needs.is_empty() => name,
            _ => return Ok(Ok(None)),
        };

        let (rule, scope) = match run.workflow.concurrency_rule(name) {
            Some(rule) => (rule.clone(), ConcurrencyScope::for_run(run)),
            None => match self.entities.load_project_concurrency(&run.project_key, name).await? {
                Some(rule) => (rule, ConcurrencyScope::for_project(run)),
                None => {
                    return Ok(Err(format!(
                        "job {job_id}: concurrency {name} not found on workflow nor on project"
                    )));
                }
            },
        };

        if let Some(condition) = rule.condition.as_deref() {
            match evaluate_condition(condition, &evaluator.context_for(job_id, None)) {
                Ok(true) => {}
                Ok(false) => {
                    pass.info(RunInfo::info(run.id, format!("concurrency {name} skipped")));
                    return Ok(Ok(None));
                }
                Err(e) => {
                    return Ok(Err(format!(
                        "job {job_id}: unable to evaluate concurrency {name} condition: {e}"
                    )));
                }
            }
        }

        Ok(Ok(Some(concurrency::bind(scope, &rule))))
    }

    async fn finish(&self, run: &Run, mut pass: Pass) -> Result<()> {
        if pass.changes.is_empty() {
            return Ok(());
        }

        let run_changed = pass.changes.run.is_some();
        let infos = pass.changes.infos.clone();
        self.store.commit(pass.changes).await?;

        pass.events.extend(infos.into_iter().map(Event::for_info));
        if run_changed {
            pass.events
                .push(Event::RunStatusChanged(RunStatusChangedPayload::from(run)));
        }
        publish_all(self.events.as_ref(), pass.events).await;
        Ok(())
    }

    /// React to a job run reaching a terminal status: hand its concurrency
    /// slot to a successor and re-evaluate its run.
    #[instrument(skip(self))]
    pub async fn job_ended(&self, job_run_id: JobRunId) -> Result<()> {
        let Some(job_run) = self.store.load_job_run(job_run_id).await? else {
            warn!(%job_run_id, "Ended job run not found");
            return Ok(());
        };

        if let Some(binding) = &job_run.concurrency {
            self.release_slots(binding).await?;
        }

        self.work
            .enqueue(RunEvaluation::new(job_run.run_id, job_run.user_id.clone()))
            .await
    }

    /// Hand the free slots of a group to its blocked instances, in the
    /// group's order. Returns how many were unblocked.
    ///
    /// A successor whose job lock is busy stays blocked until the next
    /// blocked sweep.
    pub async fn release_slots(&self, binding: &ConcurrencyBinding) -> Result<usize> {
        let mut released = 0;
        while (released as u64) < u64::from(binding.pool) {
            let Some(candidate) = self.concurrency.successor(binding).await? else {
                break;
            };

            let key = lock::job_key(candidate.id);
            if !self.locker.try_lock(&key, self.config.job_lock_lease()).await? {
                debug!(job_run_id = %candidate.id, "Successor is locked");
                break;
            }
            let result = self.unblock(candidate.id).await;
            self.locker.unlock(&key).await;
            if !result? {
                break;
            }
            released += 1;
        }
        Ok(released)
    }

    async fn unblock(&self, job_run_id: JobRunId) -> Result<bool> {
        let Some(mut job_run) = self.store.load_job_run(job_run_id).await? else {
            return Ok(false);
        };
        if job_run.status != JobStatus::Blocked {
            return Ok(false);
        }

        job_run.status = JobStatus::Waiting;
        job_run.queued = Utc::now();
        self.store
            .commit(RunChangeSet {
                updated_job_runs: vec![job_run.clone()],
                ..Default::default()
            })
            .await?;

        info!(job_run_id = %job_run.id, job = %job_run.job_id, "Job run unblocked");
        publish_all(
            self.events.as_ref(),
            vec![
                Event::JobQueued(JobQueuedPayload::from(&job_run)),
                Event::JobStatusChanged(JobStatusChangedPayload::from(&job_run)),
            ],
        )
        .await;

        self.work
            .enqueue(RunEvaluation::new(job_run.run_id, job_run.user_id.clone()))
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::run::RunContexts;
    use gantry_core::workflow::WorkflowDefinition;

    fn job_run(status: JobStatus, continue_on_error: bool) -> JobRun {
        let run = Run::new("PROJ", "github", "org/app", WorkflowDefinition::default(), RunContexts::default());
        let job = JobDefinition {
            continue_on_error,
            ..Default::default()
        };
        JobRun::new(&run, "job", job, status)
    }

    #[test]
    fn test_aggregate_status() {
        assert_eq!(aggregate_status(&[]), RunStatus::Success);
        assert_eq!(
            aggregate_status(&[job_run(JobStatus::Success, false), job_run(JobStatus::Blocked, false)]),
            RunStatus::Building
        );
        assert_eq!(
            aggregate_status(&[job_run(JobStatus::Fail, false), job_run(JobStatus::Stopped, false)]),
            RunStatus::Stopped
        );
        assert_eq!(
            aggregate_status(&[job_run(JobStatus::Fail, true), job_run(JobStatus::Skipped, false)]),
            RunStatus::Success
        );
        assert_eq!(
            aggregate_status(&[job_run(JobStatus::Fail, false), job_run(JobStatus::Success, false)]),
            RunStatus::Fail
        );
    }
}

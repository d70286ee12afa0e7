//! Job result contexts and run conditions.

use crate::expression::{ExpressionContext, ExpressionError, evaluate_condition};
use crate::graph::JobGraph;
use gantry_core::context::{JobResult, JobsContext};
use gantry_core::run::{JobRun, JobStatus, Run};
use gantry_core::workflow::MatrixCoordinate;
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Project finished job runs into per-job results.
///
/// A job appears only once every one of its instances is terminal. Matrix
/// cells aggregate as `Stopped` over `Fail` over `Success`; the failure of a
/// cell whose job continues on error counts as a success here.
pub fn collect_results(job_runs: &[JobRun]) -> JobsContext {
    let mut by_job: BTreeMap<&str, Vec<&JobRun>> = BTreeMap::new();
    for jr in job_runs {
        by_job.entry(jr.job_id.as_str()).or_default().push(jr);
    }

    by_job
        .into_iter()
        .filter(|(_, runs)| runs.iter().all(|jr| jr.is_terminal()))
        .map(|(job_id, runs)| (job_id.to_string(), aggregate(&runs)))
        .collect()
}

fn aggregate(runs: &[&JobRun]) -> JobResult {
    if let [single] = runs {
        if single.matrix.is_empty() {
            return JobResult {
                result: single.status,
                outputs: single.outputs.clone(),
            };
        }
    }

    let mut outputs = BTreeMap::new();
    let mut stopped = false;
    let mut failed = false;
    let mut all_skipped = true;
    for jr in runs {
        outputs.extend(jr.outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        match jr.status {
            JobStatus::Stopped => stopped = true,
            JobStatus::Fail if !jr.job.continue_on_error => failed = true,
            _ => {}
        }
        if jr.status != JobStatus::Skipped {
            all_skipped = false;
        }
    }

    let result = if stopped {
        JobStatus::Stopped
    } else if failed {
        JobStatus::Fail
    } else if all_skipped {
        JobStatus::Skipped
    } else {
        JobStatus::Success
    };
    JobResult { result, outputs }
}

/// Evaluates `if` conditions of a run's jobs.
pub struct ConditionEvaluator<'a> {
    run: &'a Run,
    graph: &'a JobGraph,
    results: &'a JobsContext,
}

impl<'a> ConditionEvaluator<'a> {
    pub fn new(run: &'a Run, graph: &'a JobGraph, results: &'a JobsContext) -> Self {
        Self {
            run,
            graph,
            results,
        }
    }

    /// Direct needs of `job_id` that have no result yet.
    pub fn missing_needs(&self, job_id: &str) -> Vec<String> {
        self.run
            .workflow
            .jobs
            .get(job_id)
            .map(|job| {
                job.needs
                    .iter()
                    .filter(|need| !self.results.contains_key(*need))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Results of the direct needs of a job, as seen by its condition.
    pub fn needs_context(&self, job_id: &str) -> JobsContext {
        let Some(job) = self.run.workflow.jobs.get(job_id) else {
            return JobsContext::new();
        };

        job.needs
            .iter()
            .filter_map(|need| {
                let mut result = self.results.get(need)?.clone();
                let continues = self
                    .run
                    .workflow
                    .jobs
                    .get(need)
                    .is_some_and(|j| j.continue_on_error);
                if continues && result.result == JobStatus::Fail {
                    result.result = JobStatus::Success;
                }
                Some((need.clone(), result))
            })
            .collect()
    }

    /// Results of every transitive dependency of a job. Siblings are never visible.
    pub fn jobs_context(&self, job_id: &str) -> JobsContext {
        self.graph
            .ancestors(job_id)
            .into_iter()
            .filter_map(|name| self.results.get(&name).map(|r| (name, r.clone())))
            .collect()
    }

    /// Every context an expression of `job_id` can read.
    pub fn context_for(&self, job_id: &str, matrix: Option<&MatrixCoordinate>) -> ExpressionContext {
        let run = self.run;
        let mut ctx = ExpressionContext::new()
            .with(
                "cds",
                json!({
                    "project_key": run.project_key,
                    "workflow": run.workflow_name,
                    "workflow_ref": run.workflow_ref,
                    "workflow_sha": run.workflow_sha,
                    "run_id": run.id.to_string(),
                    "run_number": run.run_number,
                    "run_attempt": run.run_attempt,
                    "job": job_id,
                    "triggering_actor": run.contexts.initiator.username,
                }),
            )
            .with("git", to_value(&run.contexts.git))
            .with("vars", to_value(&run.contexts.vars))
            .with("jobs", to_value(&self.jobs_context(job_id)))
            .with("needs", to_value(&self.needs_context(job_id)));
        if let Some(matrix) = matrix {
            ctx.insert("matrix", to_value(matrix));
        }
        ctx
    }

    /// Whether `job_id` should run.
    ///
    /// Without an `if`, a job runs when all its direct needs succeeded.
    pub fn evaluate(&self, job_id: &str) -> Result<bool, ExpressionError> {
        let condition = self
            .run
            .workflow
            .jobs
            .get(job_id)
            .and_then(|job| job.condition.as_deref())
            .filter(|c| !c.trim().is_empty());

        match condition {
            None => Ok(self
                .needs_context(job_id)
                .values()
                .all(|r| r.result == JobStatus::Success)),
            Some(condition) => evaluate_condition(condition, &self.context_for(job_id, None)),
        }
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

//! Run crafting: turning a freshly created run into an executable job graph.
//!
//! Crafting expands job templates, lints the resulting graph and resolves
//! every action, worker model and region a job refers to. Any resolution
//! problem stops the run with a diagnostic; a clean pass moves the run to
//! `Building` and asks for its first evaluation.

mod finder;
mod template;

pub use finder::{EntityFinder, EntityKind, EntityPath, ResolutionCache};

use crate::config::EngineConfig;
use crate::dispatch::{EnginePorts, WorkSender};
use crate::expression::{ExpressionContext, ExpressionError, interpolate};
use crate::graph::{self, GraphError};
use crate::lock::{self, Locker};
use crate::publish::publish_all;
use gantry_core::diagnostic::{InfoLevel, RunInfo};
use gantry_core::entity::{EntityKey, ResolvedEntities};
use gantry_core::events::{Event, RunStatusChangedPayload};
use gantry_core::ids::RunId;
use gantry_core::ports::{EntityStore, EventBus, RepositoryClient, RunStore};
use gantry_core::run::{Run, RunChangeSet, RunEvaluation, RunStatus};
use gantry_core::workflow::{JobDefinition, WorkflowDefinition};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Problems found while crafting a run.
#[derive(Debug, Error)]
pub enum CraftError {
    #[error("unable to parse the {kind} reference {reference}")]
    InvalidReference { kind: EntityKind, reference: String },

    #[error("invalid workflow: unable to find {kind} {reference}")]
    NotFound { kind: EntityKind, reference: String },

    #[error("{kind} {reference} is no longer available at {git_ref}")]
    Obsolete {
        kind: EntityKind,
        reference: String,
        git_ref: String,
    },

    #[error("job {job}: job {duplicate} defined in template {template} already exists in the parent workflow")]
    DuplicateJob {
        job: String,
        duplicate: String,
        template: String,
    },

    #[error("job {job}: missing parameter {parameter} for template {template}")]
    MissingParameter {
        job: String,
        parameter: String,
        template: String,
    },

    #[error("template {template} is still nested after {max_depth} expansions")]
    TemplateDepth { template: String, max_depth: usize },

    #[error("wrong configuration on job {job:?}. No hatchery can run it with model [{model}]")]
    InvalidWorkerModel { job: String, model: String },

    #[error("region {0} not found")]
    UnknownRegion(String),

    #[error("unable to interpolate {field}: {source}")]
    Interpolation {
        field: String,
        source: ExpressionError,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Backend(#[from] gantry_core::Error),
}

impl CraftError {
    /// Severity of the diagnostic, or `None` for infrastructure failures.
    pub fn level(&self) -> Option<InfoLevel> {
        match self {
            CraftError::Backend(_) => None,
            CraftError::Obsolete { .. } => Some(InfoLevel::Warning),
            _ => Some(InfoLevel::Error),
        }
    }
}

/// Collect a crafting problem as a diagnostic, or propagate it.
fn report(run_id: RunId, err: CraftError, infos: &mut Vec<RunInfo>) -> gantry_core::Result<()> {
    match (err.level(), err) {
        (Some(level), err) => {
            infos.push(RunInfo::new(run_id, level, err.to_string()));
            Ok(())
        }
        (None, CraftError::Backend(e)) => Err(e),
        (None, err) => Err(gantry_core::Error::Internal(err.to_string())),
    }
}

/// Crafts runs sitting in `Crafting`.
pub struct RunCrafter {
    store: Arc<dyn RunStore>,
    entities: Arc<dyn EntityStore>,
    repositories: Arc<dyn RepositoryClient>,
    events: Arc<dyn EventBus>,
    locker: Locker,
    work: WorkSender,
    config: EngineConfig,
}

impl RunCrafter {
    pub fn new(ports: &EnginePorts, work: WorkSender, config: EngineConfig) -> Self {
        Self {
            store: ports.runs.clone(),
            entities: ports.entities.clone(),
            repositories: ports.repositories.clone(),
            events: ports.events.clone(),
            locker: Locker::new(ports.locks.clone(), config.lock_retries),
            work,
            config,
        }
    }

    /// Craft a run. A busy lock or a run that is no longer crafting is a no-op.
    #[instrument(skip(self))]
    pub async fn craft(&self, run_id: RunId) -> gantry_core::Result<()> {
        let key = lock::craft_key(run_id);
        if !self.locker.try_lock(&key, self.config.run_lock_lease()).await? {
            debug!(%run_id, "Run is already being crafted");
            return Ok(());
        }

        let result = self.craft_locked(run_id).await;
        self.locker.unlock(&key).await;
        result
    }

    async fn craft_locked(&self, run_id: RunId) -> gantry_core::Result<()> {
        let Some(mut run) = self.store.load_run(run_id).await? else {
            warn!(%run_id, "Run to craft not found");
            return Ok(());
        };
        if run.status != RunStatus::Crafting {
            debug!(%run_id, status = %run.status, "Run is not crafting anymore");
            return Ok(());
        }

        let mut workflow = run.workflow.clone();
        let mut resolved = ResolvedEntities::default();
        let mut infos = Vec::new();
        {
            let mut finder =
                EntityFinder::new(&run, self.entities.as_ref(), self.repositories.as_ref());
            self.resolve(&run, &mut workflow, &mut resolved, &mut finder, &mut infos)
                .await?;
        }

        let stopping = infos.iter().any(|i| i.level >= InfoLevel::Warning);
        if stopping {
            let failed = infos.iter().any(|i| i.level == InfoLevel::Error);
            run.set_status(if failed {
                RunStatus::Fail
            } else {
                RunStatus::Skipped
            });
        } else {
            run.workflow = workflow;
            run.resolved = resolved;
            run.set_status(RunStatus::Building);
        }

        self.store
            .commit(RunChangeSet {
                run: Some(run.clone()),
                infos: infos.clone(),
                ..Default::default()
            })
            .await?;

        info!(%run_id, status = %run.status, diagnostics = infos.len(), "Run crafted");

        let mut events: Vec<Event> = infos.into_iter().map(Event::for_info).collect();
        events.push(Event::RunStatusChanged(RunStatusChangedPayload::from(&run)));
        publish_all(self.events.as_ref(), events).await;

        if run.status == RunStatus::Building {
            let evaluation = RunEvaluation::new(run.id, run.contexts.initiator.user_id.clone());
            self.work.enqueue(evaluation).await?;
        }
        Ok(())
    }

    async fn resolve(
        &self,
        run: &Run,
        workflow: &mut WorkflowDefinition,
        resolved: &mut ResolvedEntities,
        finder: &mut EntityFinder<'_>,
        infos: &mut Vec<RunInfo>,
    ) -> gantry_core::Result<()> {
        let origins = match template::expand_templates(workflow, finder, self.config.max_template_depth).await {
            Ok(origins) => origins,
            Err(e) => return report(run.id, e, infos),
        };

        let lint = graph::lint(workflow);
        if !lint.is_empty() {
            for e in lint {
                report(run.id, e.into(), infos)?;
            }
            return Ok(());
        }

        let ctx = run_context(run);
        for (job_id, job) in workflow.jobs.iter_mut() {
            let origin = origins.get(job_id);
            if let Err(e) = self.resolve_job(job_id, job, origin, resolved, finder, &ctx).await {
                report(run.id, e, infos)?;
            }
        }

        for rule in workflow.concurrencies.iter_mut() {
            match interpolate_name(&rule.name, &ctx, "concurrency name") {
                Ok(name) => rule.name = name,
                Err(e) => report(run.id, e, infos)?,
            }
        }
        if let Some(name) = workflow.concurrency.as_mut() {
            match interpolate_name(name, &ctx, "workflow concurrency") {
                Ok(interpolated) => *name = interpolated,
                Err(e) => report(run.id, e, infos)?,
            }
        }

        Ok(())
    }

    async fn resolve_job(
        &self,
        job_id: &str,
        job: &mut JobDefinition,
        origin: Option<&EntityKey>,
        resolved: &mut ResolvedEntities,
        finder: &mut EntityFinder<'_>,
        ctx: &ExpressionContext,
    ) -> Result<(), CraftError> {
        for step in job.steps.iter_mut() {
            if let Some(uses) = step.uses.as_deref() {
                let complete = resolve_action(uses, origin, resolved, finder).await?;
                step.uses = Some(format!("actions/{complete}"));
            }
        }

        if let Some(runs_on) = job.runs_on.as_deref() {
            let runs_on = interpolate_name(runs_on, ctx, &format!("runs-on of job {job_id}"))?;
            job.runs_on = Some(match finder.find_worker_model(&runs_on, origin).await {
                Ok((key, model)) => {
                    let complete = key.to_string();
                    resolved.worker_models.insert(complete.clone(), model);
                    complete
                }
                Err(CraftError::NotFound { .. }) if !runs_on.contains('/') => runs_on,
                Err(CraftError::NotFound { .. } | CraftError::InvalidReference { .. }) => {
                    return Err(CraftError::InvalidWorkerModel {
                        job: job_id.to_string(),
                        model: runs_on,
                    });
                }
                Err(e) => return Err(e),
            });
        }

        let region = match job.region.as_deref() {
            Some(region) => interpolate_name(region, ctx, &format!("region of job {job_id}"))?,
            None => self.config.default_region.clone(),
        };
        if !self.entities.region_exists(&region).await? {
            return Err(CraftError::UnknownRegion(region));
        }
        job.region = Some(region);

        if let Some(concurrency) = job.concurrency.as_deref() {
            let name = interpolate_name(concurrency, ctx, &format!("concurrency of job {job_id}"))?;
            job.concurrency = Some(name);
        }

        Ok(())
    }
}

/// Resolve an action and every action it uses, returning its complete path.
///
/// Nested references resolve relative to the action that holds them.
async fn resolve_action(
    reference: &str,
    origin: Option<&EntityKey>,
    resolved: &mut ResolvedEntities,
    finder: &mut EntityFinder<'_>,
) -> Result<String, CraftError> {
    let mut pending = vec![(reference.to_string(), origin.cloned())];
    let mut visited = HashSet::new();
    let mut root = None;

    while let Some((reference, base)) = pending.pop() {
        let name = reference.strip_prefix("actions/").unwrap_or(&reference);
        let (key, action) = finder.find_action(name, base.as_ref()).await?;
        let complete = key.to_string();
        if root.is_none() {
            root = Some(complete.clone());
        }
        if !visited.insert(complete.clone()) {
            continue;
        }
        pending.extend(
            action
                .steps
                .iter()
                .filter_map(|s| s.uses.clone())
                .map(|uses| (uses, Some(key.clone()))),
        );
        resolved.actions.insert(complete, action);
    }

    root.ok_or_else(|| {
        CraftError::Backend(gantry_core::Error::Internal(format!(
            "action {reference} resolved to nothing"
        )))
    })
}

/// Contexts available while crafting: no job has run yet.
fn run_context(run: &Run) -> ExpressionContext {
    ExpressionContext::new()
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
            }),
        )
        .with("git", serde_json::to_value(&run.contexts.git).unwrap_or(Value::Null))
        .with("vars", serde_json::to_value(&run.contexts.vars).unwrap_or(Value::Null))
}

fn interpolate_name(raw: &str, ctx: &ExpressionContext, field: &str) -> Result<String, CraftError> {
    if !raw.contains("${{") {
        return Ok(raw.to_string());
    }
    match interpolate(raw, ctx) {
        Ok(Value::String(s)) => Ok(s),
        Ok(other) => Ok(other.to_string()),
        Err(source) => Err(CraftError::Interpolation {
            field: field.to_string(),
            source,
        }),
    }
}

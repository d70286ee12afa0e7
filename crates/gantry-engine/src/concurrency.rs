//! Concurrency group admission.
//!
//! Pool counts are queried from the run store at decision time and never
//! cached. Two runs admitting at the edge of a freshly released slot may
//! both get in.

use gantry_core::Result;
use gantry_core::ports::RunStore;
use gantry_core::run::{ConcurrencyBinding, ConcurrencyScope, JobRun, JobStatus};
use gantry_core::workflow::{ConcurrencyOrder, ConcurrencyRule};
use std::sync::Arc;
use tracing::debug;

/// Statuses that hold or wait for a slot of a group.
pub const ACTIVE_STATUSES: [JobStatus; 4] = [
    JobStatus::Blocked,
    JobStatus::Waiting,
    JobStatus::Scheduling,
    JobStatus::Building,
];

/// Outcome of an admission request.
#[derive(Debug, Clone)]
pub enum Admission {
    /// Start now. `cancel` lists instances flagged for cancellation.
    Admit { cancel: Vec<JobRun> },
    /// Wait behind the group.
    Block { message: String },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admit { .. })
    }
}

/// Build the binding a job run carries for `rule` within `scope`.
pub fn bind(scope: ConcurrencyScope, rule: &ConcurrencyRule) -> ConcurrencyBinding {
    ConcurrencyBinding {
        name: rule.name.clone(),
        scope,
        pool: rule.pool.max(1),
        order: rule.order,
        cancel_in_progress: rule.cancel_in_progress,
    }
}

/// Most conservative settings among the requested binding and the bindings
/// of active instances: the smallest pool, `oldest_first` if anyone asks for
/// it, and cancel-in-progress only when every instance agrees.
pub fn merge<'a>(
    requested: &ConcurrencyBinding,
    active: impl IntoIterator<Item = &'a JobRun>,
) -> ConcurrencyBinding {
    let mut merged = requested.clone();
    for binding in active.into_iter().filter_map(|jr| jr.concurrency.as_ref()) {
        merged.pool = merged.pool.min(binding.pool);
        if binding.order == ConcurrencyOrder::OldestFirst {
            merged.order = ConcurrencyOrder::OldestFirst;
        }
        merged.cancel_in_progress &= binding.cancel_in_progress;
    }
    merged
}

/// Admission controller for concurrency groups.
pub struct ConcurrencyController {
    store: Arc<dyn RunStore>,
}

impl ConcurrencyController {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    async fn active(&self, binding: &ConcurrencyBinding) -> Result<Vec<JobRun>> {
        self.store
            .load_concurrency_job_runs(&binding.scope, &binding.name, &ACTIVE_STATUSES)
            .await
    }

    /// Decide whether a new instance bound to `binding` may start.
    ///
    /// `pending` holds instances created earlier in the same pass and not
    /// yet committed.
    pub async fn admit(&self, binding: &ConcurrencyBinding, pending: &[JobRun]) -> Result<Admission> {
        let stored = self.active(binding).await?;
        let active: Vec<&JobRun> = stored
            .iter()
            .chain(pending.iter().filter(|jr| {
                jr.concurrency
                    .as_ref()
                    .is_some_and(|b| b.name == binding.name && b.scope == binding.scope)
            }))
            .collect();

        let rule = merge(binding, active.iter().copied());
        let blocked = active
            .iter()
            .filter(|jr| jr.status == JobStatus::Blocked)
            .count();
        let in_progress = active.len() - blocked;

        debug!(
            concurrency = %binding.name,
            pool = rule.pool,
            in_progress,
            blocked,
            "Evaluating concurrency admission"
        );

        if rule.cancel_in_progress {
            let cancel = stored
                .into_iter()
                .filter(|jr| !jr.pending_cancel)
                .map(|mut jr| {
                    jr.pending_cancel = true;
                    jr
                })
                .collect();
            return Ok(Admission::Admit { cancel });
        }

        let full = (in_progress + blocked) as u64 >= u64::from(rule.pool);
        let queue_ahead = rule.order == ConcurrencyOrder::OldestFirst && blocked > 0;
        if full || queue_ahead {
            return Ok(Admission::Block {
                message: format!("locked by concurrency '{}'", binding.name),
            });
        }

        Ok(Admission::Admit { cancel: Vec::new() })
    }

    /// Pick the blocked instance that should take a freed slot of the group,
    /// if any slot is free.
    pub async fn successor(&self, binding: &ConcurrencyBinding) -> Result<Option<JobRun>> {
        let active = self.active(binding).await?;
        let rule = merge(binding, &active);

        let in_progress = active
            .iter()
            .filter(|jr| jr.status != JobStatus::Blocked)
            .count();
        if in_progress as u64 >= u64::from(rule.pool) {
            return Ok(None);
        }

        let blocked = active.into_iter().filter(|jr| jr.status == JobStatus::Blocked);
        let next = match rule.order {
            ConcurrencyOrder::OldestFirst => blocked.min_by_key(|jr| jr.queued),
            ConcurrencyOrder::NewestFirst => blocked.max_by_key(|jr| jr.queued),
        };
        Ok(next)
    }
}

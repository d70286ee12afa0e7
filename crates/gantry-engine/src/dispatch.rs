//! Dispatch loop.
//!
//! Evaluation requests travel over a bounded in-process channel. When the
//! channel is full they overflow to the durable [`WorkQueue`], which the
//! loop drains alongside the channel. Tickers resume runs whose crafting or
//! evaluation signal was lost and drive the job monitor.

use crate::config::EngineConfig;
use crate::crafter::RunCrafter;
use crate::monitor::JobMonitor;
use crate::trigger::{Trigger, TriggerOutcome};
use gantry_core::ids::{JobRunId, RunId};
use gantry_core::ports::{
    Authorizer, EntityStore, EventBus, ExecutorLiveness, LockStore, RepositoryClient, RunStore,
    WorkQueue,
};
use gantry_core::run::{RunEvaluation, RunStatus};
use gantry_core::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, warn};

/// Delay before a trigger that found its run locked is retried.
const LOCK_BUSY_RETRY: Duration = Duration::from_millis(500);

/// Collaborators the engine drives.
#[derive(Clone)]
pub struct EnginePorts {
    pub runs: Arc<dyn RunStore>,
    pub entities: Arc<dyn EntityStore>,
    pub repositories: Arc<dyn RepositoryClient>,
    pub authorizer: Arc<dyn Authorizer>,
    pub locks: Arc<dyn LockStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub events: Arc<dyn EventBus>,
    pub liveness: Arc<dyn ExecutorLiveness>,
}

/// A unit of work for the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Work {
    Craft(RunId),
    Evaluate(RunEvaluation),
    JobEnded(JobRunId),
}

/// Producer side of the dispatch loop.
#[derive(Clone)]
pub struct WorkSender {
    tx: mpsc::Sender<Work>,
    queue: Arc<dyn WorkQueue>,
}

impl WorkSender {
    pub fn channel(capacity: usize, queue: Arc<dyn WorkQueue>) -> (Self, mpsc::Receiver<Work>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, queue }, rx)
    }

    /// Request an evaluation, overflowing to the durable queue when the
    /// channel is full or closed.
    pub async fn enqueue(&self, evaluation: RunEvaluation) -> Result<()> {
        let Err(e) = self.tx.try_send(Work::Evaluate(evaluation)) else {
            return Ok(());
        };
        let Work::Evaluate(evaluation) = e.into_inner() else {
            return Ok(());
        };
        debug!(run_id = %evaluation.run_id, "Evaluation channel unavailable, using durable queue");
        self.queue.enqueue(evaluation).await
    }

    /// Request crafting of a run. A dropped request is picked up by the
    /// resume ticker.
    pub fn request_craft(&self, run_id: RunId) {
        if let Err(e) = self.tx.try_send(Work::Craft(run_id)) {
            debug!(%run_id, error = %e, "Craft request dropped");
        }
    }

    /// Notify the engine that a job run reached a terminal status.
    pub async fn job_ended(&self, job_run_id: JobRunId) -> Result<()> {
        self.tx
            .send(Work::JobEnded(job_run_id))
            .await
            .map_err(|_| Error::Queue("dispatch loop is not running".to_string()))
    }
}

/// The components a piece of work is handed to.
struct Workers {
    crafter: RunCrafter,
    trigger: Arc<Trigger>,
    monitor: JobMonitor,
    runs: Arc<dyn RunStore>,
    work: WorkSender,
}

impl Workers {
    async fn process(self: Arc<Self>, work: Work) {
        match work {
            Work::Craft(run_id) => {
                if let Err(e) = self.crafter.craft(run_id).await {
                    error!(%run_id, error = %e, "Crafting failed");
                }
            }
            Work::Evaluate(evaluation) => self.evaluate(evaluation).await,
            Work::JobEnded(job_run_id) => {
                if let Err(e) = self.trigger.job_ended(job_run_id).await {
                    error!(%job_run_id, error = %e, "Failed to handle job end");
                }
            }
        }
    }

    async fn evaluate(&self, evaluation: RunEvaluation) {
        let run_id = evaluation.run_id;
        match self.trigger.trigger(&evaluation).await {
            Ok(TriggerOutcome::LockBusy) => {
                tokio::time::sleep(LOCK_BUSY_RETRY).await;
                if let Err(e) = self.work.enqueue(evaluation).await {
                    error!(%run_id, error = %e, "Failed to re-enqueue evaluation");
                }
            }
            Ok(outcome) => debug!(%run_id, ?outcome, "Evaluation done"),
            Err(e) => error!(%run_id, error = %e, "Evaluation failed"),
        }
    }

    /// Craft runs left in `Crafting` and re-evaluate runs left in
    /// `Building`, covering requests lost on the way.
    async fn resume_pending(&self) -> Result<()> {
        let run_ids = self.runs.load_run_ids_by_status(RunStatus::Crafting).await?;
        if !run_ids.is_empty() {
            debug!(count = run_ids.len(), "Crafting pending runs");
        }
        for run_id in run_ids {
            if let Err(e) = self.crafter.craft(run_id).await {
                error!(%run_id, error = %e, "Crafting failed");
            }
        }

        let run_ids = self.runs.load_run_ids_by_status(RunStatus::Building).await?;
        for run_id in run_ids {
            match self.trigger.trigger(&RunEvaluation::new(run_id, "")).await {
                Ok(TriggerOutcome::Evaluated { created, .. }) if created > 0 => {
                    info!(%run_id, created, "Resumed building run");
                }
                Ok(_) => {}
                Err(e) => error!(%run_id, error = %e, "Evaluation failed"),
            }
        }
        Ok(())
    }
}

/// Drives crafting, evaluation and monitoring until shutdown.
pub struct Dispatcher {
    workers: Arc<Workers>,
    queue: Arc<dyn WorkQueue>,
    rx: mpsc::Receiver<Work>,
    config: EngineConfig,
}

impl Dispatcher {
    pub fn new(ports: EnginePorts, config: EngineConfig) -> Self {
        let (work, rx) = WorkSender::channel(config.channel_capacity, ports.queue.clone());
        let trigger = Arc::new(Trigger::new(&ports, work.clone(), config.clone()));
        let workers = Workers {
            crafter: RunCrafter::new(&ports, work.clone(), config.clone()),
            monitor: JobMonitor::new(&ports, trigger.clone(), config.clone()),
            trigger,
            runs: ports.runs.clone(),
            work,
        };
        Self {
            workers: Arc::new(workers),
            queue: ports.queue,
            rx,
            config,
        }
    }

    /// Handle for submitting work to this dispatcher.
    pub fn sender(&self) -> WorkSender {
        self.workers.work.clone()
    }

    /// Request an evaluation of a run.
    pub async fn enqueue(&self, evaluation: RunEvaluation) -> Result<()> {
        self.workers.work.enqueue(evaluation).await
    }

    pub fn trigger(&self) -> Arc<Trigger> {
        self.workers.trigger.clone()
    }

    /// Run the loop until `shutdown` flips to `true`, then wait for the work
    /// in flight.
    #[instrument(skip_all)]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.sweep_interval();
        let mut resume_ticker = ticker(period);
        let mut waiting_ticker = ticker(period);
        let mut scheduling_ticker = ticker(period);
        let mut executor_ticker = ticker(period);
        let mut blocked_ticker = ticker(period);

        let mut tasks = JoinSet::new();
        tasks.spawn(drain_queue(
            self.queue.clone(),
            self.workers.work.tx.clone(),
            self.config.queue_poll(),
            shutdown.clone(),
        ));

        info!(
            sweep_interval_secs = period.as_secs(),
            channel_capacity = self.config.channel_capacity,
            "Starting dispatcher"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Dispatcher shutting down");
                        break;
                    }
                }
                work = self.rx.recv() => {
                    let Some(work) = work else { break };
                    tasks.spawn(self.workers.clone().process(work));
                }
                _ = resume_ticker.tick() => {
                    let workers = self.workers.clone();
                    tasks.spawn(async move {
                        if let Err(e) = workers.resume_pending().await {
                            error!(error = %e, "Failed to load runs to resume");
                        }
                    });
                }
                _ = waiting_ticker.tick() => {
                    let workers = self.workers.clone();
                    tasks.spawn(sweep("waiting", async move { workers.monitor.sweep_waiting().await }));
                }
                _ = scheduling_ticker.tick() => {
                    let workers = self.workers.clone();
                    tasks.spawn(sweep("scheduling", async move { workers.monitor.sweep_scheduling().await }));
                }
                _ = executor_ticker.tick() => {
                    let workers = self.workers.clone();
                    tasks.spawn(sweep("executor", async move { workers.monitor.sweep_dead_executors().await }));
                }
                _ = blocked_ticker.tick() => {
                    let workers = self.workers.clone();
                    tasks.spawn(sweep("blocked", async move { workers.monitor.sweep_blocked().await }));
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Dispatcher task panicked");
                    }
                }
            }
        }

        self.rx.close();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Dispatcher task panicked");
            }
        }
        info!("Dispatcher stopped");
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

async fn sweep(name: &'static str, run: impl Future<Output = Result<usize>>) {
    if let Err(e) = run.await {
        error!(sweeper = name, error = %e, "Monitor sweep failed");
    }
}

/// Move durable evaluations into the channel.
///
/// Runs in its own task so a pending dequeue is never dropped mid-flight.
async fn drain_queue(
    queue: Arc<dyn WorkQueue>,
    tx: mpsc::Sender<Work>,
    poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            dequeued = queue.dequeue(poll) => match dequeued {
                Ok(Some(evaluation)) => {
                    if tx.send(Work::Evaluate(evaluation)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Failed to dequeue evaluation");
                    tokio::time::sleep(poll).await;
                }
            },
        }
    }
}

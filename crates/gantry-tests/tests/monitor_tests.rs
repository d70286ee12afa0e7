//! Recovery of stuck job runs by the periodic sweepers.

use chrono::{TimeDelta, Utc};
use gantry_core::diagnostic::InfoLevel;
use gantry_core::ports::LockStore;
use gantry_core::run::{JobStatus, RunEvaluation, RunStatus};
use gantry_core::workflow::ConcurrencyOrder;
use gantry_engine::{Work, lock};
use gantry_tests::{Harness, INITIATOR, RunFixture, WorkflowFixture};
use pretty_assertions::assert_eq;
use std::time::Duration;

#[tokio::test]
async fn test_waiting_timeout_fails_job_and_reevaluates_run() {
    gantry_tests::init_test_logging();
    let mut h = Harness::new();
    let run_id = h.launch(RunFixture::building(WorkflowFixture::single())).await;
    let build = h.job_run(run_id, "build").await.unwrap();
    h.runs
        .update_job_run(build.id, |jr| jr.queued = Utc::now() - TimeDelta::hours(2))
        .await;

    assert_eq!(h.monitor.sweep_waiting().await.unwrap(), 1);

    let build = h.job_run(run_id, "build").await.unwrap();
    assert_eq!(build.status, JobStatus::Fail);
    assert!(build.ended.is_some());

    let infos = h.infos(run_id).await;
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].level, InfoLevel::Error);
    assert_eq!(infos[0].job_run_id, Some(build.id));
    assert_eq!(
        infos[0].message,
        "job build: no executor took the job within 3600s"
    );

    assert_eq!(
        h.pending_work(),
        vec![Work::Evaluate(RunEvaluation::new(run_id, INITIATOR))]
    );
    h.evaluate(run_id).await;
    assert_eq!(h.run_status(run_id).await, RunStatus::Fail);
}

#[tokio::test]
async fn test_recent_waiting_job_is_left_alone() {
    let mut h = Harness::new();
    let run_id = h.launch(RunFixture::building(WorkflowFixture::single())).await;

    assert_eq!(h.monitor.sweep_waiting().await.unwrap(), 0);
    assert_eq!(h.job_status(run_id, "build").await, Some(JobStatus::Waiting));
    assert!(h.infos(run_id).await.is_empty());
    assert!(h.pending_work().is_empty());
}

#[tokio::test]
async fn test_scheduling_timeout_requeues_job() {
    let mut h = Harness::new();
    let run_id = h.launch(RunFixture::building(WorkflowFixture::single())).await;
    let build = h.job_run(run_id, "build").await.unwrap();
    h.schedule(build.id, "exec-1").await;
    h.runs
        .update_job_run(build.id, |jr| {
            jr.scheduled = Some(Utc::now() - TimeDelta::minutes(20));
        })
        .await;

    assert_eq!(h.monitor.sweep_scheduling().await.unwrap(), 1);

    let build = h.job_run(run_id, "build").await.unwrap();
    assert_eq!(build.status, JobStatus::Waiting);
    assert!(build.executor.is_none());
    assert!(build.scheduled.is_none());
    assert_eq!(h.events.queued_job_runs().await, vec![build.id, build.id]);
    assert!(h.infos(run_id).await.is_empty());
    assert_eq!(h.run_status(run_id).await, RunStatus::Building);
}

#[tokio::test]
async fn test_recent_scheduling_job_is_left_alone() {
    let mut h = Harness::new();
    let run_id = h.launch(RunFixture::building(WorkflowFixture::single())).await;
    let build = h.job_run(run_id, "build").await.unwrap();
    h.schedule(build.id, "exec-1").await;

    assert_eq!(h.monitor.sweep_scheduling().await.unwrap(), 0);
    assert_eq!(h.job_status(run_id, "build").await, Some(JobStatus::Scheduling));
}

#[tokio::test]
async fn test_dead_executor_stops_job() {
    let mut h = Harness::new();
    let run_id = h.launch(RunFixture::building(WorkflowFixture::diamond())).await;
    let a = h.job_run(run_id, "a").await.unwrap();
    let b = h.job_run(run_id, "b").await.unwrap();
    for (id, executor) in [(a.id, "exec-1"), (b.id, "exec-2")] {
        h.start(id, executor).await;
        h.runs
            .update_job_run(id, |jr| jr.started = Some(Utc::now() - TimeDelta::seconds(5)))
            .await;
    }
    h.liveness.kill("exec-1").await;

    assert_eq!(h.monitor.sweep_dead_executors().await.unwrap(), 1);

    assert_eq!(h.job_status(run_id, "a").await, Some(JobStatus::Stopped));
    assert_eq!(h.job_status(run_id, "b").await, Some(JobStatus::Building));
    let infos = h.infos(run_id).await;
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].level, InfoLevel::Warning);
    assert_eq!(infos[0].message, "job a: executor exec-1 is not alive anymore");

    h.drain_work().await;
    assert_eq!(h.run_status(run_id).await, RunStatus::Building);

    h.finish_job(run_id, "b", JobStatus::Success).await;
    assert_eq!(h.job_status(run_id, "c").await, Some(JobStatus::Skipped));
    assert_eq!(h.run_status(run_id).await, RunStatus::Stopped);
}

#[tokio::test]
async fn test_locked_job_is_skipped() {
    let mut h = Harness::new();
    let run_id = h.launch(RunFixture::building(WorkflowFixture::single())).await;
    let build = h.job_run(run_id, "build").await.unwrap();
    h.runs
        .update_job_run(build.id, |jr| jr.queued = Utc::now() - TimeDelta::hours(2))
        .await;

    let key = lock::job_key(build.id);
    assert!(h.locks.try_acquire(&key, Duration::from_secs(60)).await.unwrap());
    assert_eq!(h.monitor.sweep_waiting().await.unwrap(), 0);
    assert_eq!(h.job_status(run_id, "build").await, Some(JobStatus::Waiting));

    h.locks.release(&key).await.unwrap();
    assert_eq!(h.monitor.sweep_waiting().await.unwrap(), 1);
    assert_eq!(h.job_status(run_id, "build").await, Some(JobStatus::Fail));
}

#[tokio::test]
async fn test_waiting_sweep_ignores_scheduled_job() {
    let mut h = Harness::new();
    let run_id = h.launch(RunFixture::building(WorkflowFixture::single())).await;
    let build = h.job_run(run_id, "build").await.unwrap();
    h.runs
        .update_job_run(build.id, |jr| jr.queued = Utc::now() - TimeDelta::hours(2))
        .await;
    h.schedule(build.id, "exec-1").await;

    assert_eq!(h.monitor.sweep_waiting().await.unwrap(), 0);
    assert_eq!(h.job_status(run_id, "build").await, Some(JobStatus::Scheduling));
}

#[tokio::test]
async fn test_timed_out_job_releases_concurrency_successor() {
    let mut h = Harness::new();
    let rule = WorkflowFixture::concurrency("prod", 1, ConcurrencyOrder::OldestFirst);
    let first = h.launch(RunFixture::building(WorkflowFixture::guarded(rule.clone()))).await;
    let second = h.launch(RunFixture::building(WorkflowFixture::guarded(rule))).await;
    assert_eq!(h.job_status(second, "deploy").await, Some(JobStatus::Blocked));

    let deploy = h.job_run(first, "deploy").await.unwrap();
    h.runs
        .update_job_run(deploy.id, |jr| jr.queued = Utc::now() - TimeDelta::hours(2))
        .await;

    assert_eq!(h.monitor.sweep_waiting().await.unwrap(), 1);
    assert_eq!(h.job_status(first, "deploy").await, Some(JobStatus::Fail));
    assert_eq!(h.job_status(second, "deploy").await, Some(JobStatus::Waiting));

    h.drain_work().await;
    assert_eq!(h.run_status(first).await, RunStatus::Fail);
    assert_eq!(h.run_status(second).await, RunStatus::Building);
}

#[tokio::test]
async fn test_blocked_sweep_hands_over_a_missed_slot() {
    let mut h = Harness::new();
    let rule = WorkflowFixture::concurrency("prod", 1, ConcurrencyOrder::OldestFirst);
    let first = h.launch(RunFixture::building(WorkflowFixture::guarded(rule.clone()))).await;
    let second = h.launch(RunFixture::building(WorkflowFixture::guarded(rule))).await;
    let successor = h.job_run(second, "deploy").await.unwrap();
    assert_eq!(successor.status, JobStatus::Blocked);

    let key = lock::job_key(successor.id);
    assert!(h.locks.try_acquire(&key, Duration::from_secs(60)).await.unwrap());
    h.finish_job(first, "deploy", JobStatus::Success).await;
    assert_eq!(h.job_status(second, "deploy").await, Some(JobStatus::Blocked));
    assert_eq!(h.monitor.sweep_blocked().await.unwrap(), 0);

    h.locks.release(&key).await.unwrap();
    assert_eq!(h.monitor.sweep_blocked().await.unwrap(), 1);
    assert_eq!(h.job_status(second, "deploy").await, Some(JobStatus::Waiting));
    assert!(h.events.queued_job_runs().await.contains(&successor.id));

    assert_eq!(h.monitor.sweep_blocked().await.unwrap(), 0);
}

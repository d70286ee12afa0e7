//! Run evaluation scenarios against in-memory collaborators.

use gantry_core::diagnostic::InfoLevel;
use gantry_core::entity::WorkerModel;
use gantry_core::events::Event;
use gantry_core::ids::RunId;
use gantry_core::ports::LockStore;
use gantry_core::run::{JobRun, JobStatus, RunEvaluation, RunStatus};
use gantry_core::workflow::{MatrixSpec, Strategy};
use gantry_engine::{TriggerOutcome, Work, lock};
use gantry_tests::{Harness, INITIATOR, RunFixture, WorkflowFixture};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;

fn statuses(job_runs: &[JobRun]) -> Vec<JobStatus> {
    job_runs.iter().map(|jr| jr.status).collect()
}

#[tokio::test]
async fn test_first_pass_creates_one_waiting_instance_per_root_coordinate() {
    gantry_tests::init_test_logging();
    let mut h = Harness::new();
    let wf = WorkflowFixture::with_jobs(
        "fanout",
        vec![
            (
                "build",
                WorkflowFixture::matrix(vec![
                    ("os", vec![json!("linux"), json!("darwin")]),
                    ("arch", vec![json!("amd64")]),
                ]),
            ),
            ("lint", WorkflowFixture::job()),
            ("test", WorkflowFixture::needs(&["build"])),
        ],
    );
    let run_id = h.launch(RunFixture::building(wf)).await;

    let builds = h.instances(run_id, "build").await;
    assert_eq!(statuses(&builds), vec![JobStatus::Waiting, JobStatus::Waiting]);
    let mut oses: Vec<_> = builds.iter().map(|jr| jr.matrix.get("os").cloned()).collect();
    oses.sort_by_key(|v| v.as_ref().map(|v| v.to_string()));
    assert_eq!(oses, vec![Some(json!("darwin")), Some(json!("linux"))]);
    assert!(builds.iter().all(|jr| jr.matrix.get("arch") == Some(&json!("amd64"))));

    let lint = h.job_run(run_id, "lint").await.unwrap();
    assert_eq!(lint.status, JobStatus::Waiting);
    assert!(lint.matrix.is_empty());

    assert!(h.instances(run_id, "test").await.is_empty());
    assert_eq!(h.run_status(run_id).await, RunStatus::Building);
}

#[tokio::test]
async fn test_empty_matrix_runs_once() {
    let mut h = Harness::new();
    let mut job = WorkflowFixture::job();
    job.strategy = Some(Strategy {
        matrix: MatrixSpec::new(),
    });
    let run_id = h
        .launch(RunFixture::building(WorkflowFixture::with_jobs("once", vec![("build", job)])))
        .await;

    let builds = h.instances(run_id, "build").await;
    assert_eq!(builds.len(), 1);
    assert!(builds[0].matrix.is_empty());
}

#[tokio::test]
async fn test_workflow_without_jobs_succeeds() {
    let mut h = Harness::new();
    let run_id = h
        .launch(RunFixture::crafting(WorkflowFixture::with_jobs("empty", Vec::new())))
        .await;

    assert_eq!(h.run_status(run_id).await, RunStatus::Success);
    assert!(h.job_runs(run_id).await.is_empty());
    assert!(h.pending_work().is_empty());
}

#[tokio::test]
async fn test_dependent_waits_for_every_matrix_cell() {
    let mut h = Harness::new();
    let wf = WorkflowFixture::with_jobs(
        "matrix",
        vec![
            ("build", WorkflowFixture::matrix(vec![("os", vec![json!("linux"), json!("darwin")])])),
            ("test", WorkflowFixture::needs(&["build"])),
        ],
    );
    let run_id = h.launch(RunFixture::building(wf)).await;

    let builds = h.instances(run_id, "build").await;
    h.finish_job_run(builds[0].id, JobStatus::Success).await;
    assert!(h.instances(run_id, "test").await.is_empty());

    h.finish_job_run(builds[1].id, JobStatus::Success).await;
    assert_eq!(h.job_status(run_id, "test").await, Some(JobStatus::Waiting));
}

#[tokio::test]
async fn test_chain_scenario() {
    let mut h = Harness::new();
    let wf = WorkflowFixture::with_jobs(
        "pair",
        vec![
            ("job1", WorkflowFixture::job()),
            ("job2", WorkflowFixture::needs(&["job1"])),
        ],
    );
    let run_id = h.launch(RunFixture::building(wf)).await;

    let job_runs = h.job_runs(run_id).await;
    assert_eq!(job_runs.len(), 1);
    assert_eq!(job_runs[0].job_id, "job1");
    assert_eq!(job_runs[0].status, JobStatus::Waiting);

    h.finish_job(run_id, "job1", JobStatus::Success).await;
    assert_eq!(h.job_status(run_id, "job2").await, Some(JobStatus::Waiting));
    assert_eq!(h.run_status(run_id).await, RunStatus::Building);

    h.finish_job(run_id, "job2", JobStatus::Success).await;
    assert_eq!(h.run_status(run_id).await, RunStatus::Success);

    let changed: Vec<RunStatus> = h
        .events
        .events()
        .await
        .into_iter()
        .filter_map(|e| match e {
            Event::RunStatusChanged(p) => Some(p.status),
            _ => None,
        })
        .collect();
    assert_eq!(changed, vec![RunStatus::Success]);
}

#[tokio::test]
async fn test_skip_then_always_scenario() {
    let mut h = Harness::new();
    let wf = WorkflowFixture::with_jobs(
        "skip",
        vec![
            ("check", WorkflowFixture::with_condition(&[], "1 == 2")),
            ("report", WorkflowFixture::with_condition(&["check"], "${{ always() }}")),
        ],
    );
    let run = RunFixture::building(wf);
    let run_id = run.id;
    h.runs.insert_run(run).await;

    let outcome = h.evaluate(run_id).await;
    assert_eq!(outcome, TriggerOutcome::Evaluated { created: 1, terminal: 1 });
    assert_eq!(h.job_status(run_id, "check").await, Some(JobStatus::Skipped));
    assert!(h.instances(run_id, "report").await.is_empty());

    let infos = h.infos(run_id).await;
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].level, InfoLevel::Info);
    assert_eq!(infos[0].message, "job check: cannot be run because of if statement");
    assert!(infos[0].is_job_info());

    assert_eq!(
        h.pending_work(),
        vec![Work::Evaluate(RunEvaluation::new(run_id, INITIATOR))]
    );

    h.evaluate(run_id).await;
    assert_eq!(h.job_status(run_id, "report").await, Some(JobStatus::Waiting));
    assert_eq!(h.infos(run_id).await.len(), 1);
}

#[tokio::test]
async fn test_failure_condition_runs_only_after_a_failed_need() {
    let notify = || WorkflowFixture::with_condition(&["a", "b"], "${{ failure() }}");

    let mut h = Harness::new();
    let wf = WorkflowFixture::with_jobs(
        "notify",
        vec![("a", WorkflowFixture::job()), ("b", WorkflowFixture::job()), ("notify", notify())],
    );
    let run_id = h.launch(RunFixture::building(wf.clone())).await;
    h.finish_job(run_id, "a", JobStatus::Success).await;
    h.finish_job(run_id, "b", JobStatus::Fail).await;
    assert_eq!(h.job_status(run_id, "notify").await, Some(JobStatus::Waiting));

    let run_id = h.launch(RunFixture::building(wf.clone())).await;
    h.finish_job(run_id, "a", JobStatus::Success).await;
    h.finish_job(run_id, "b", JobStatus::Success).await;
    assert_eq!(h.job_status(run_id, "notify").await, Some(JobStatus::Skipped));
    assert_eq!(h.run_status(run_id).await, RunStatus::Success);

    let mut tolerant = wf;
    tolerant.jobs.get_mut("b").unwrap().continue_on_error = true;
    let run_id = h.launch(RunFixture::building(tolerant)).await;
    h.finish_job(run_id, "a", JobStatus::Success).await;
    h.finish_job(run_id, "b", JobStatus::Fail).await;
    assert_eq!(h.job_status(run_id, "notify").await, Some(JobStatus::Skipped));
    assert_eq!(h.run_status(run_id).await, RunStatus::Success);
}

#[tokio::test]
async fn test_default_condition_skips_after_failed_need() {
    let mut h = Harness::new();
    let run_id = h.launch(RunFixture::building(WorkflowFixture::chain())).await;

    h.finish_job(run_id, "build", JobStatus::Fail).await;
    assert_eq!(h.job_status(run_id, "test").await, Some(JobStatus::Skipped));
    assert_eq!(h.job_status(run_id, "deploy").await, Some(JobStatus::Skipped));
    assert_eq!(h.run_status(run_id).await, RunStatus::Fail);
}

#[tokio::test]
async fn test_stopped_takes_precedence_over_fail() {
    let mut h = Harness::new();
    let run_id = h.launch(RunFixture::building(WorkflowFixture::diamond())).await;

    h.finish_job(run_id, "a", JobStatus::Fail).await;
    h.finish_job(run_id, "b", JobStatus::Stopped).await;
    assert_eq!(h.job_status(run_id, "c").await, Some(JobStatus::Skipped));
    assert_eq!(h.run_status(run_id).await, RunStatus::Stopped);
}

#[tokio::test]
async fn test_retrigger_without_changes_is_idempotent() {
    let mut h = Harness::new();
    let run_id = h.launch(RunFixture::building(WorkflowFixture::chain())).await;
    let commits = h.runs.commit_count();
    let events = h.events.events().await.len();

    for _ in 0..2 {
        let outcome = h.evaluate(run_id).await;
        assert_eq!(outcome, TriggerOutcome::Evaluated { created: 0, terminal: 0 });
    }

    assert_eq!(h.job_runs(run_id).await.len(), 1);
    assert!(h.infos(run_id).await.is_empty());
    assert_eq!(h.runs.commit_count(), commits);
    assert_eq!(h.events.events().await.len(), events);
    assert!(h.pending_work().is_empty());
}

#[tokio::test]
async fn test_stage_gates_dependent_stage() {
    let mut h = Harness::new();
    let run_id = h.launch(RunFixture::building(WorkflowFixture::staged())).await;

    assert_eq!(h.job_status(run_id, "compile").await, Some(JobStatus::Waiting));
    assert!(h.instances(run_id, "ship").await.is_empty());

    h.finish_job(run_id, "compile", JobStatus::Success).await;
    assert_eq!(h.job_status(run_id, "ship").await, Some(JobStatus::Waiting));
}

#[tokio::test]
async fn test_explicit_jobs_on_running_workflow_are_rejected() {
    let mut h = Harness::new();
    let run_id = h.launch(RunFixture::building(WorkflowFixture::chain())).await;

    let outcome = h.evaluate_jobs(run_id, "bob", &["test"]).await;
    assert_eq!(outcome, TriggerOutcome::Evaluated { created: 0, terminal: 0 });
    assert!(h.instances(run_id, "test").await.is_empty());

    let infos = h.infos(run_id).await;
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].level, InfoLevel::Warning);
    assert_eq!(infos[0].message, "unable to start a job on a running workflow");
}

#[tokio::test]
async fn test_explicit_jobs_warn_instead_of_skipping() {
    let h = Harness::new();
    let mut wf = WorkflowFixture::chain();
    wf.jobs.insert("gated".to_string(), WorkflowFixture::with_condition(&[], "1 == 2"));
    let run = RunFixture::building(wf);
    let run_id = run.id;
    h.runs.insert_run(run).await;

    h.evaluate_jobs(run_id, "bob", &["test", "gated", "nope"]).await;

    assert!(h.job_runs(run_id).await.is_empty());
    let mut messages = h.messages(run_id).await;
    messages.sort();
    assert_eq!(
        messages,
        vec![
            "job gated: cannot be run because of if statement".to_string(),
            "job nope: not found in workflow".to_string(),
            "job test: missing some required job: build".to_string(),
        ]
    );
    assert!(
        h.infos(run_id)
            .await
            .iter()
            .all(|i| i.level == InfoLevel::Warning && !i.is_job_info())
    );
}

#[tokio::test]
async fn test_explicit_job_in_gated_stage_warns() {
    let h = Harness::new();
    let run = RunFixture::building(WorkflowFixture::staged());
    let run_id = run.id;
    h.runs.insert_run(run).await;

    h.evaluate_jobs(run_id, "bob", &["ship"]).await;

    assert!(h.job_runs(run_id).await.is_empty());
    assert_eq!(
        h.messages(run_id).await,
        vec!["job ship: stage release cannot be run yet".to_string()]
    );
}

#[tokio::test]
async fn test_rerun_job_of_terminal_run() {
    let mut h = Harness::new();
    let wf = WorkflowFixture::with_jobs(
        "rerun",
        vec![
            ("build", WorkflowFixture::job()),
            ("cleanup", WorkflowFixture::with_condition(&["build"], "${{ always() }}")),
        ],
    );
    let mut run = RunFixture::building(wf.clone());
    run.status = RunStatus::Fail;
    let run_id = run.id;
    let mut build = JobRun::new(&run, "build", wf.jobs["build"].clone(), JobStatus::Waiting);
    build.finish(JobStatus::Fail);
    h.runs.insert_run(run).await;
    h.runs.insert_job_run(build).await;

    assert_eq!(h.evaluate(run_id).await, TriggerOutcome::Ignored);

    let outcome = h.evaluate_jobs(run_id, "bob", &["cleanup"]).await;
    assert_eq!(outcome, TriggerOutcome::Evaluated { created: 1, terminal: 0 });

    let cleanup = h.job_run(run_id, "cleanup").await.unwrap();
    assert_eq!(cleanup.status, JobStatus::Waiting);
    assert_eq!(cleanup.user_id, "bob");
    assert_eq!(h.run_status(run_id).await, RunStatus::Building);

    h.drain_work().await;
    h.finish_job(run_id, "cleanup", JobStatus::Success).await;
    assert_eq!(h.run_status(run_id).await, RunStatus::Fail);
}

#[tokio::test]
async fn test_region_denial_fails_job() {
    let mut h = Harness::new();
    h.authorizer.deny_region("default").await;
    let run_id = h.launch(RunFixture::building(WorkflowFixture::single())).await;

    let build = h.job_run(run_id, "build").await.unwrap();
    assert_eq!(build.status, JobStatus::Fail);
    assert!(build.ended.is_some());

    let infos = h.infos(run_id).await;
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].level, InfoLevel::Error);
    assert_eq!(infos[0].job_run_id, Some(build.id));
    assert_eq!(
        infos[0].message,
        "you don't have the right to execute job build in region default"
    );
    assert_eq!(h.run_status(run_id).await, RunStatus::Fail);
    assert!(h.events.queued_job_runs().await.is_empty());
}

#[tokio::test]
async fn test_variable_set_denial_fails_job() {
    let mut h = Harness::new();
    h.authorizer.deny_variable_set("prod-secrets").await;
    let mut job = WorkflowFixture::job();
    job.vars = vec!["common".to_string(), "prod-secrets".to_string()];
    let run_id = h
        .launch(RunFixture::building(WorkflowFixture::with_jobs("vars", vec![("deploy", job)])))
        .await;

    assert_eq!(h.job_status(run_id, "deploy").await, Some(JobStatus::Fail));
    assert_eq!(
        h.messages(run_id).await,
        vec!["job deploy: you don't have the right to use variable set prod-secrets".to_string()]
    );
}

#[tokio::test]
async fn test_condition_error_fails_job() {
    let mut h = Harness::new();
    let wf = WorkflowFixture::with_jobs(
        "broken",
        vec![
            ("typed", WorkflowFixture::with_condition(&[], "${{ 'hello' }}")),
            ("unknown", WorkflowFixture::with_condition(&[], "${{ nope() }}")),
        ],
    );
    let run_id = h.launch(RunFixture::building(wf)).await;

    assert_eq!(h.job_status(run_id, "typed").await, Some(JobStatus::Fail));
    assert_eq!(h.job_status(run_id, "unknown").await, Some(JobStatus::Fail));

    let infos = h.infos(run_id).await;
    assert_eq!(infos.len(), 2);
    assert!(infos.iter().all(|i| i.level == InfoLevel::Error));
    assert!(
        infos
            .iter()
            .any(|i| i.message.starts_with("job typed: unable to evaluate condition: "))
    );
    assert!(
        infos
            .iter()
            .any(|i| i.message.starts_with("job unknown: unable to evaluate condition: "))
    );
    assert_eq!(h.run_status(run_id).await, RunStatus::Fail);
}

#[tokio::test]
async fn test_continue_on_error_does_not_fail_run() {
    let mut h = Harness::new();
    let mut wf = WorkflowFixture::chain();
    wf.jobs.get_mut("build").unwrap().continue_on_error = true;
    let run_id = h.launch(RunFixture::building(wf)).await;

    h.finish_job(run_id, "build", JobStatus::Fail).await;
    assert_eq!(h.job_status(run_id, "test").await, Some(JobStatus::Waiting));
    h.finish_job(run_id, "test", JobStatus::Success).await;
    h.finish_job(run_id, "deploy", JobStatus::Success).await;
    assert_eq!(h.run_status(run_id).await, RunStatus::Success);
}

#[tokio::test]
async fn test_job_queued_events_carry_region_and_model_type() {
    let mut h = Harness::new();
    let model_key = "PROJ/github/org/app/rust-builder@refs/heads/main".to_string();
    let mut build = WorkflowFixture::job();
    build.runs_on = Some(model_key.clone());
    build.region = Some("eu".to_string());
    let wf = WorkflowFixture::with_jobs("queued", vec![("build", build), ("lint", WorkflowFixture::job())]);
    let mut run = RunFixture::building(wf);
    run.resolved.worker_models.insert(
        model_key.clone(),
        WorkerModel {
            name: "rust-builder".to_string(),
            model_type: "docker".to_string(),
            os_arch: None,
        },
    );
    let run_id = h.launch(run).await;

    let build = h.job_run(run_id, "build").await.unwrap();
    assert_eq!(build.region, "eu");
    assert_eq!(build.model_type.as_deref(), Some("docker"));
    assert_eq!(build.worker_model.as_deref(), Some(model_key.as_str()));

    let mut subjects: Vec<String> = h
        .events
        .events()
        .await
        .iter()
        .filter(|e| matches!(e, Event::JobQueued(_)))
        .map(Event::subject)
        .collect();
    subjects.sort();
    assert_eq!(subjects, vec!["job.queued.default.any", "job.queued.eu.docker"]);
}

#[tokio::test]
async fn test_busy_run_lock_defers_evaluation() {
    let h = Harness::new();
    let run = RunFixture::building(WorkflowFixture::single());
    let run_id = run.id;
    h.runs.insert_run(run).await;

    let key = lock::run_key(run_id);
    assert!(h.locks.try_acquire(&key, Duration::from_secs(60)).await.unwrap());

    assert_eq!(h.evaluate(run_id).await, TriggerOutcome::LockBusy);
    assert!(h.job_runs(run_id).await.is_empty());

    h.locks.release(&key).await.unwrap();
    assert_eq!(
        h.evaluate(run_id).await,
        TriggerOutcome::Evaluated { created: 1, terminal: 0 }
    );
    assert!(!h.locks.is_held(&key).await);
}

#[tokio::test]
async fn test_ignored_runs() {
    let h = Harness::new();
    assert_eq!(h.evaluate(RunId::new()).await, TriggerOutcome::Ignored);

    let crafting = RunFixture::crafting(WorkflowFixture::single());
    let crafting_id = crafting.id;
    h.runs.insert_run(crafting).await;
    assert_eq!(h.evaluate(crafting_id).await, TriggerOutcome::Ignored);

    let mut ended = RunFixture::building(WorkflowFixture::single());
    ended.status = RunStatus::Success;
    let ended_id = ended.id;
    h.runs.insert_run(ended).await;
    assert_eq!(h.evaluate(ended_id).await, TriggerOutcome::Ignored);
    assert!(h.job_runs(ended_id).await.is_empty());
}

#[tokio::test]
async fn test_failed_commit_writes_and_publishes_nothing() {
    let h = Harness::new();
    let run = RunFixture::building(WorkflowFixture::diamond());
    let run_id = run.id;
    h.runs.insert_run(run).await;

    h.runs.fail_commits(true);
    let result = h.trigger.trigger(&RunEvaluation::new(run_id, INITIATOR)).await;
    assert!(result.is_err());
    assert!(h.job_runs(run_id).await.is_empty());
    assert!(h.events.events().await.is_empty());

    h.runs.fail_commits(false);
    assert_eq!(
        h.evaluate(run_id).await,
        TriggerOutcome::Evaluated { created: 2, terminal: 0 }
    );
    assert_eq!(h.events.queued_job_runs().await.len(), 2);
}

#[tokio::test]
async fn test_yaml_workflow_runs_stage_by_stage() {
    let mut h = Harness::new();
    let wf = WorkflowFixture::from_yaml(
        r#"
name: release
stages:
  build: {}
  release:
    needs: [build]
jobs:
  compile:
    stage: build
    strategy:
      matrix:
        os: [linux, darwin]
  ship:
    stage: release
    needs: [compile]
    if: "${{ success() }}"
"#,
    )
    .unwrap();
    let run_id = h.launch(RunFixture::building(wf)).await;

    assert_eq!(
        statuses(&h.instances(run_id, "compile").await),
        vec![JobStatus::Waiting, JobStatus::Waiting]
    );
    assert!(h.instances(run_id, "ship").await.is_empty());

    h.finish_job(run_id, "compile", JobStatus::Success).await;
    assert_eq!(h.job_status(run_id, "ship").await, Some(JobStatus::Waiting));
    assert_eq!(h.run_status(run_id).await, RunStatus::Building);

    h.finish_job(run_id, "ship", JobStatus::Success).await;
    assert_eq!(h.run_status(run_id).await, RunStatus::Success);
}

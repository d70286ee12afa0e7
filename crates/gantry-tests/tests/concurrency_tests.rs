//! Concurrency group admission and release across runs.

use gantry_core::diagnostic::InfoLevel;
use gantry_core::ids::RunId;
use gantry_core::run::{ConcurrencyScope, JobRun, JobStatus, RunStatus};
use gantry_core::workflow::{ConcurrencyOrder, ConcurrencyRule, WorkflowDefinition};
use gantry_tests::memory::MemoryEntityStore;
use gantry_tests::{Harness, PROJECT, RunFixture, WorkflowFixture};
use pretty_assertions::assert_eq;
use serde_json::json;

async fn deploy_status(h: &Harness, run_id: RunId) -> JobStatus {
    h.job_status(run_id, "deploy").await.expect("deploy instance")
}

fn count(instances: &[JobRun], status: JobStatus) -> usize {
    instances.iter().filter(|jr| jr.status == status).count()
}

async fn launch_guarded(h: &mut Harness, rule: ConcurrencyRule) -> RunId {
    h.launch(RunFixture::building(WorkflowFixture::guarded(rule))).await
}

#[tokio::test]
async fn test_pool_of_one_admits_oldest_blocked_successor() {
    gantry_tests::init_test_logging();
    let mut h = Harness::new();
    let rule = WorkflowFixture::concurrency("prod", 1, ConcurrencyOrder::OldestFirst);

    let first = launch_guarded(&mut h, rule.clone()).await;
    let second = launch_guarded(&mut h, rule.clone()).await;
    let third = launch_guarded(&mut h, rule).await;

    assert_eq!(deploy_status(&h, first).await, JobStatus::Waiting);
    assert_eq!(deploy_status(&h, second).await, JobStatus::Blocked);
    assert_eq!(deploy_status(&h, third).await, JobStatus::Blocked);

    let infos = h.infos(second).await;
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].level, InfoLevel::Info);
    assert_eq!(infos[0].message, "locked by concurrency 'prod'");
    assert!(infos[0].is_job_info());

    let first_deploy = h.job_run(first, "deploy").await.unwrap();
    h.start(first_deploy.id, "exec-1").await;
    assert_eq!(h.events.queued_job_runs().await, vec![first_deploy.id]);

    h.finish_job(first, "deploy", JobStatus::Success).await;
    assert_eq!(deploy_status(&h, second).await, JobStatus::Waiting);
    assert_eq!(deploy_status(&h, third).await, JobStatus::Blocked);
    assert_eq!(h.run_status(first).await, RunStatus::Success);

    let second_deploy = h.job_run(second, "deploy").await.unwrap();
    assert_eq!(
        h.events.queued_job_runs().await,
        vec![first_deploy.id, second_deploy.id]
    );

    h.finish_job(second, "deploy", JobStatus::Fail).await;
    assert_eq!(deploy_status(&h, third).await, JobStatus::Waiting);
}

#[tokio::test]
async fn test_newest_first_releases_latest_request() {
    let mut h = Harness::new();
    let rule = WorkflowFixture::concurrency("prod", 1, ConcurrencyOrder::NewestFirst);

    let first = launch_guarded(&mut h, rule.clone()).await;
    let second = launch_guarded(&mut h, rule.clone()).await;
    let third = launch_guarded(&mut h, rule).await;
    assert_eq!(deploy_status(&h, second).await, JobStatus::Blocked);
    assert_eq!(deploy_status(&h, third).await, JobStatus::Blocked);

    h.finish_job(first, "deploy", JobStatus::Success).await;
    assert_eq!(deploy_status(&h, second).await, JobStatus::Blocked);
    assert_eq!(deploy_status(&h, third).await, JobStatus::Waiting);
}

#[tokio::test]
async fn test_pool_counts_blocked_and_running_instances() {
    let mut h = Harness::new();
    let rule = WorkflowFixture::concurrency("prod", 2, ConcurrencyOrder::OldestFirst);

    let first = launch_guarded(&mut h, rule.clone()).await;
    let second = launch_guarded(&mut h, rule.clone()).await;
    let third = launch_guarded(&mut h, rule).await;

    assert_eq!(deploy_status(&h, first).await, JobStatus::Waiting);
    assert_eq!(deploy_status(&h, second).await, JobStatus::Waiting);
    assert_eq!(deploy_status(&h, third).await, JobStatus::Blocked);

    h.finish_job(second, "deploy", JobStatus::Success).await;
    assert_eq!(deploy_status(&h, third).await, JobStatus::Waiting);
}

#[tokio::test]
async fn test_conflicting_rules_merge_to_smallest_pool() {
    let mut h = Harness::new();
    let first = launch_guarded(
        &mut h,
        WorkflowFixture::concurrency("prod", 1, ConcurrencyOrder::OldestFirst),
    )
    .await;
    let second = launch_guarded(
        &mut h,
        WorkflowFixture::concurrency("prod", 5, ConcurrencyOrder::NewestFirst),
    )
    .await;

    assert_eq!(deploy_status(&h, first).await, JobStatus::Waiting);
    assert_eq!(deploy_status(&h, second).await, JobStatus::Blocked);
}

#[tokio::test]
async fn test_jobs_of_one_pass_share_the_pool() {
    let mut h = Harness::new();
    let mut eu = WorkflowFixture::job();
    eu.concurrency = Some("prod".to_string());
    let us = eu.clone();
    let mut wf = WorkflowFixture::with_jobs("regions", vec![("deploy-eu", eu), ("deploy-us", us)]);
    wf.concurrencies
        .push(WorkflowFixture::concurrency("prod", 1, ConcurrencyOrder::OldestFirst));

    let run_id = h.launch(RunFixture::building(wf)).await;
    let mut statuses: Vec<JobStatus> = h.job_runs(run_id).await.iter().map(|jr| jr.status).collect();
    statuses.sort_by_key(|s| s.to_string());
    assert_eq!(statuses, vec![JobStatus::Blocked, JobStatus::Waiting]);
}

#[tokio::test]
async fn test_matrix_cells_are_admitted_one_by_one() {
    let mut h = Harness::new();
    let mut job = WorkflowFixture::matrix(vec![("zone", vec![json!("a"), json!("b"), json!("c")])]);
    job.concurrency = Some("prod".to_string());
    let mut wf = WorkflowFixture::with_jobs("zones", vec![("deploy", job)]);
    wf.concurrencies
        .push(WorkflowFixture::concurrency("prod", 2, ConcurrencyOrder::OldestFirst));

    let run_id = h.launch(RunFixture::building(wf)).await;
    let instances = h.instances(run_id, "deploy").await;
    assert_eq!(instances.len(), 3);
    assert_eq!(count(&instances, JobStatus::Waiting), 2);
    assert_eq!(count(&instances, JobStatus::Blocked), 1);
    assert_eq!(h.messages(run_id).await, vec!["locked by concurrency 'prod'".to_string()]);

    let admitted = instances
        .iter()
        .find(|jr| jr.status == JobStatus::Waiting)
        .map(|jr| jr.id)
        .unwrap();
    h.finish_job_run(admitted, JobStatus::Success).await;

    let instances = h.instances(run_id, "deploy").await;
    assert_eq!(count(&instances, JobStatus::Waiting), 2);
    assert_eq!(count(&instances, JobStatus::Blocked), 0);
}

#[tokio::test]
async fn test_cancel_in_progress_flags_running_instances() {
    let mut h = Harness::new();
    let mut rule = WorkflowFixture::concurrency("prod", 1, ConcurrencyOrder::OldestFirst);
    rule.cancel_in_progress = true;

    let first = launch_guarded(&mut h, rule.clone()).await;
    let first_deploy = h.job_run(first, "deploy").await.unwrap();
    h.start(first_deploy.id, "exec-1").await;

    let second = launch_guarded(&mut h, rule).await;
    assert_eq!(deploy_status(&h, second).await, JobStatus::Waiting);

    let first_deploy = h.job_run(first, "deploy").await.unwrap();
    assert!(first_deploy.pending_cancel);
    assert_eq!(first_deploy.status, JobStatus::Building);
    assert!(!h.job_run(second, "deploy").await.unwrap().pending_cancel);
}

#[tokio::test]
async fn test_unknown_group_fails_job() {
    let mut h = Harness::new();
    let mut job = WorkflowFixture::job();
    job.concurrency = Some("ghost".to_string());
    let run_id = h
        .launch(RunFixture::building(WorkflowFixture::with_jobs("ghost", vec![("deploy", job)])))
        .await;

    assert_eq!(deploy_status(&h, run_id).await, JobStatus::Fail);
    assert_eq!(
        h.messages(run_id).await,
        vec!["job deploy: concurrency ghost not found on workflow nor on project".to_string()]
    );
    assert_eq!(h.run_status(run_id).await, RunStatus::Fail);
}

#[tokio::test]
async fn test_rule_condition_false_leaves_job_unbound() {
    let mut h = Harness::new();
    let mut rule = WorkflowFixture::concurrency("prod", 1, ConcurrencyOrder::OldestFirst);
    rule.condition = Some("git.ref == 'refs/heads/release'".to_string());

    let first = launch_guarded(&mut h, rule.clone()).await;
    let second = launch_guarded(&mut h, rule).await;

    for run_id in [first, second] {
        let deploy = h.job_run(run_id, "deploy").await.unwrap();
        assert_eq!(deploy.status, JobStatus::Waiting);
        assert!(deploy.concurrency.is_none());

        let infos = h.infos(run_id).await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].level, InfoLevel::Info);
        assert_eq!(infos[0].message, "concurrency prod skipped");
    }
}

#[tokio::test]
async fn test_project_group_is_shared_across_workflows() {
    let rule = WorkflowFixture::concurrency("release", 1, ConcurrencyOrder::OldestFirst);
    let entities = MemoryEntityStore::new().with_project_concurrency(PROJECT, rule);
    let mut h = Harness::with_entities(entities);

    let workflow = |name: &str| -> WorkflowDefinition {
        let mut job = WorkflowFixture::job();
        job.concurrency = Some("release".to_string());
        WorkflowFixture::with_jobs(name, vec![("deploy", job)])
    };
    let api = h.launch(RunFixture::building(workflow("api"))).await;
    let web = h.launch(RunFixture::building(workflow("web"))).await;

    let binding = h.job_run(api, "deploy").await.unwrap().concurrency.unwrap();
    assert_eq!(
        binding.scope,
        ConcurrencyScope::Project {
            project: PROJECT.to_string()
        }
    );
    assert_eq!(deploy_status(&h, api).await, JobStatus::Waiting);
    assert_eq!(deploy_status(&h, web).await, JobStatus::Blocked);

    h.finish_job(api, "deploy", JobStatus::Success).await;
    assert_eq!(deploy_status(&h, web).await, JobStatus::Waiting);
}

#[tokio::test]
async fn test_workflow_rule_shadows_project_rule() {
    let entities = MemoryEntityStore::new().with_project_concurrency(
        PROJECT,
        WorkflowFixture::concurrency("prod", 5, ConcurrencyOrder::OldestFirst),
    );
    let mut h = Harness::with_entities(entities);
    let rule = WorkflowFixture::concurrency("prod", 1, ConcurrencyOrder::OldestFirst);

    let run_id = launch_guarded(&mut h, rule).await;
    let binding = h.job_run(run_id, "deploy").await.unwrap().concurrency.unwrap();
    assert_eq!(binding.pool, 1);
    assert!(matches!(binding.scope, ConcurrencyScope::Workflow { .. }));
}

#[tokio::test]
async fn test_workflow_group_binds_root_jobs_only() {
    let mut h = Harness::new();
    let workflow = || -> WorkflowDefinition {
        let mut wf = WorkflowFixture::chain();
        wf.concurrency = Some("pipeline".to_string());
        wf.concurrencies
            .push(WorkflowFixture::concurrency("pipeline", 1, ConcurrencyOrder::OldestFirst));
        wf
    };

    let first = h.launch(RunFixture::building(workflow())).await;
    let second = h.launch(RunFixture::building(workflow())).await;

    let build = h.job_run(first, "build").await.unwrap();
    assert_eq!(build.concurrency.as_ref().map(|b| b.name.as_str()), Some("pipeline"));
    assert_eq!(h.job_status(second, "build").await, Some(JobStatus::Blocked));

    h.finish_job(first, "build", JobStatus::Success).await;
    assert_eq!(h.job_status(second, "build").await, Some(JobStatus::Waiting));

    let test = h.job_run(first, "test").await.unwrap();
    assert_eq!(test.status, JobStatus::Waiting);
    assert!(test.concurrency.is_none());
}

//! Test fixtures for creating sample workflows and runs.

use gantry_core::run::{GitContext, Initiator, Run, RunContexts, RunStatus};
use gantry_core::workflow::{
    ConcurrencyOrder, ConcurrencyRule, JobDefinition, StageDefinition, StepDefinition, Strategy,
    WorkflowDefinition,
};
use anyhow::Context;
use serde_json::Value;

pub const PROJECT: &str = "PROJ";
pub const VCS: &str = "github";
pub const REPOSITORY: &str = "org/app";
pub const GIT_REF: &str = "refs/heads/main";
pub const INITIATOR: &str = "alice";

/// Factory for creating test workflows.
pub struct WorkflowFixture;

impl WorkflowFixture {
    /// Parse a workflow written as YAML.
    pub fn from_yaml(source: &str) -> anyhow::Result<WorkflowDefinition> {
        serde_yaml::from_str(source).context("invalid workflow yaml")
    }

    /// A workflow from `(name, job)` pairs.
    pub fn with_jobs(name: &str, jobs: Vec<(&str, JobDefinition)>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: name.to_string(),
            jobs: jobs.into_iter().map(|(n, j)| (n.to_string(), j)).collect(),
            ..Default::default()
        }
    }

    /// A single job without dependencies.
    pub fn single() -> WorkflowDefinition {
        Self::with_jobs("single", vec![("build", Self::job())])
    }

    /// `build -> test -> deploy`.
    pub fn chain() -> WorkflowDefinition {
        Self::with_jobs(
            "chain",
            vec![
                ("build", Self::job()),
                ("test", Self::needs(&["build"])),
                ("deploy", Self::needs(&["test"])),
            ],
        )
    }

    /// `a` and `b` both feeding `c`.
    pub fn diamond() -> WorkflowDefinition {
        Self::with_jobs(
            "diamond",
            vec![
                ("a", Self::job()),
                ("b", Self::job()),
                ("c", Self::needs(&["a", "b"])),
            ],
        )
    }

    /// `compile` in stage `build`, `ship` in stage `release` which needs `build`.
    pub fn staged() -> WorkflowDefinition {
        let mut wf = Self::with_jobs(
            "staged",
            vec![
                ("compile", Self::in_stage("build")),
                ("ship", Self::in_stage("release")),
            ],
        );
        wf.stages.insert("build".to_string(), StageDefinition::default());
        wf.stages.insert(
            "release".to_string(),
            StageDefinition {
                needs: vec!["build".to_string()],
            },
        );
        wf
    }

    /// A single `deploy` job bound to `rule`.
    pub fn guarded(rule: ConcurrencyRule) -> WorkflowDefinition {
        let mut job = Self::job();
        job.concurrency = Some(rule.name.clone());
        let mut wf = Self::with_jobs("guarded", vec![("deploy", job)]);
        wf.concurrencies.push(rule);
        wf
    }

    pub fn job() -> JobDefinition {
        JobDefinition {
            steps: vec![StepDefinition {
                run: Some("make".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    pub fn needs(needs: &[&str]) -> JobDefinition {
        JobDefinition {
            needs: needs.iter().map(|n| n.to_string()).collect(),
            ..Self::job()
        }
    }

    pub fn with_condition(needs: &[&str], condition: &str) -> JobDefinition {
        JobDefinition {
            condition: Some(condition.to_string()),
            ..Self::needs(needs)
        }
    }

    pub fn in_stage(stage: &str) -> JobDefinition {
        JobDefinition {
            stage: Some(stage.to_string()),
            ..Self::job()
        }
    }

    /// A job with one matrix dimension per `(name, values)` pair, in order.
    pub fn matrix(dimensions: Vec<(&str, Vec<Value>)>) -> JobDefinition {
        JobDefinition {
            strategy: Some(Strategy {
                matrix: dimensions.into_iter().collect(),
            }),
            ..Self::job()
        }
    }

    pub fn concurrency(name: &str, pool: u32, order: ConcurrencyOrder) -> ConcurrencyRule {
        ConcurrencyRule {
            pool,
            order,
            ..ConcurrencyRule::new(name)
        }
    }
}

/// Factory for creating test runs.
pub struct RunFixture;

impl RunFixture {
    pub fn contexts() -> RunContexts {
        RunContexts {
            git: GitContext {
                server: VCS.to_string(),
                repository: REPOSITORY.to_string(),
                git_ref: GIT_REF.to_string(),
                sha: "4f2a9c1".to_string(),
            },
            vars: Default::default(),
            initiator: Initiator {
                user_id: INITIATOR.to_string(),
                username: INITIATOR.to_string(),
            },
        }
    }

    /// A run still waiting to be crafted.
    pub fn crafting(workflow: WorkflowDefinition) -> Run {
        Run::new(PROJECT, VCS, REPOSITORY, workflow, Self::contexts())
    }

    /// A run crafted as is, ready for evaluation.
    pub fn building(workflow: WorkflowDefinition) -> Run {
        let mut run = Self::crafting(workflow);
        run.status = RunStatus::Building;
        run
    }

    /// A crafting run on another branch of the repository.
    pub fn crafting_on(workflow: WorkflowDefinition, git_ref: &str) -> Run {
        let mut contexts = Self::contexts();
        contexts.git.git_ref = git_ref.to_string();
        Run::new(PROJECT, VCS, REPOSITORY, workflow, contexts)
    }
}

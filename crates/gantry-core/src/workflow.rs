//! Workflow graph definitions.
//!
//! These are the already-parsed declarations a run is crafted from: jobs,
//! stages, matrix strategies and concurrency rules.

use crate::ordered::OrderedMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A complete workflow declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stages: BTreeMap<String, StageDefinition>,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub concurrencies: Vec<ConcurrencyRule>,
    /// Concurrency group applied to the whole workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<String>,
}

impl WorkflowDefinition {
    pub fn uses_stages(&self) -> bool {
        !self.stages.is_empty()
    }

    pub fn concurrency_rule(&self, name: &str) -> Option<&ConcurrencyRule> {
        self.concurrencies.iter().find(|c| c.name == name)
    }

    /// Direct dependents of a job.
    pub fn dependents_of<'a>(&'a self, job_id: &'a str) -> impl Iterator<Item = &'a String> {
        self.jobs
            .iter()
            .filter(move |(_, job)| job.needs.iter().any(|n| n == job_id))
            .map(|(name, _)| name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StageDefinition {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
}

/// A named node of the job graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobDefinition {
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<String>,
    #[serde(default)]
    pub continue_on_error: bool,
    /// Worker model reference or a plain executor label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runs_on: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepDefinition>,
    /// Template reference; the job is replaced by the template's jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    /// Variable sets the job reads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vars: Vec<String>,
}

impl JobDefinition {
    pub fn matrix(&self) -> Option<&MatrixSpec> {
        self.strategy.as_ref().map(|s| &s.matrix)
    }

    pub fn has_matrix(&self) -> bool {
        self.matrix().is_some_and(|m| !m.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Strategy {
    #[serde(default)]
    pub matrix: MatrixSpec,
}

/// Matrix dimensions in declaration order.
pub type MatrixSpec = OrderedMap<Vec<serde_json::Value>>;

/// One cell of an expanded matrix.
pub type MatrixCoordinate = OrderedMap<serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Action reference, e.g. `actions/checkout` or `actions/proj/vcs/org/repo/build@main`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub with: BTreeMap<String, String>,
}

/// Named admission-control configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConcurrencyRule {
    pub name: String,
    #[serde(default = "default_pool")]
    pub pool: u32,
    #[serde(default)]
    pub order: ConcurrencyOrder,
    #[serde(default)]
    pub cancel_in_progress: bool,
    /// The rule applies only when this expression holds.
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

fn default_pool() -> u32 {
    1
}

impl ConcurrencyRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool: default_pool(),
            order: ConcurrencyOrder::default(),
            cancel_in_progress: false,
            condition: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

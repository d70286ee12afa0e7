//! Reusable entities referenced from workflows: actions, worker models and
//! job templates, plus the qualified keys used to load them.

use crate::workflow::{JobDefinition, StageDefinition, StepDefinition};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Project key of the built-in entity library.
pub const LIBRARY_PROJECT: &str = "library";

/// Fully-qualified location of an entity at a given revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct EntityKey {
    pub project: String,
    pub vcs: Option<String>,
    pub repo: Option<String>,
    pub name: String,
    pub git_ref: Option<String>,
}

impl EntityKey {
    pub fn library(name: impl Into<String>) -> Self {
        Self {
            project: LIBRARY_PROJECT.to_string(),
            vcs: None,
            repo: None,
            name: name.into(),
            git_ref: None,
        }
    }

    pub fn is_library(&self) -> bool {
        self.project == LIBRARY_PROJECT
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.vcs, &self.repo) {
            (Some(vcs), Some(repo)) => write!(f, "{}/{}/{}/{}", self.project, vcs, repo, self.name)?,
            _ => write!(f, "{}/{}", self.project, self.name)?,
        }
        if let Some(git_ref) = &self.git_ref {
            write!(f, "@{git_ref}")?;
        }
        Ok(())
    }
}

/// Reusable sequence of steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActionDefinition {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

/// Executor image description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkerModel {
    pub name: String,
    /// Executor family, e.g. `docker` or `vsphere`.
    pub model_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_arch: Option<String>,
}

/// A named set of jobs that can replace a single job of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobTemplate {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub stages: BTreeMap<String, StageDefinition>,
    #[serde(default)]
    pub jobs: BTreeMap<String, JobDefinition>,
}

/// Entities resolved while crafting a run, keyed by their qualified path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResolvedEntities {
    #[serde(default)]
    pub actions: BTreeMap<String, ActionDefinition>,
    #[serde(default)]
    pub worker_models: BTreeMap<String, WorkerModel>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_key_display() {
        let key = EntityKey {
            project: "PROJ".to_string(),
            vcs: Some("github".to_string()),
            repo: Some("org/app".to_string()),
            name: "build".to_string(),
            git_ref: Some("refs/heads/main".to_string()),
        };
        assert_eq!(key.to_string(), "PROJ/github/org/app/build@refs/heads/main");
        assert_eq!(EntityKey::library("checkout").to_string(), "library/checkout");
        assert!(EntityKey::library("checkout").is_library());
    }
}

//! Entity lookup for a single crafting pass.
//!
//! References are resolved against the run being crafted and memoized in a
//! [`ResolutionCache`] that lives only as long as the [`EntityFinder`] that
//! owns it.

use super::CraftError;
use gantry_core::entity::{ActionDefinition, EntityKey, JobTemplate, LIBRARY_PROJECT, WorkerModel};
use gantry_core::ports::{EntityStore, RepositoryClient};
use gantry_core::run::Run;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

const BRANCH_PREFIX: &str = "refs/heads/";
const TAG_PREFIX: &str = "refs/tags/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Action,
    WorkerModel,
    Template,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Action => "action",
            EntityKind::WorkerModel => "worker model",
            EntityKind::Template => "template",
        })
    }
}

/// A reference split into its optional parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityPath {
    pub project: Option<String>,
    pub vcs: Option<String>,
    pub repo: Option<String>,
    pub name: String,
    pub git_ref: Option<String>,
    pub library: bool,
}

impl EntityPath {
    /// Parse `name`, `library/name`, `org/repo/name`, `vcs/org/repo/name`
    /// or `project/vcs/org/repo/name`, each with an optional `@ref`.
    pub fn parse(reference: &str) -> Option<Self> {
        let (path, git_ref) = match reference.split_once('@') {
            Some((path, git_ref)) if !git_ref.is_empty() => (path, Some(git_ref.to_string())),
            Some((path, _)) => (path, None),
            None => (reference, None),
        };

        let parts: Vec<&str> = path.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }

        let owned = |s: &str| Some(s.to_string());
        let mut parsed = EntityPath {
            project: None,
            vcs: None,
            repo: None,
            name: String::new(),
            git_ref,
            library: false,
        };
        match parts.as_slice() {
            [name] => parsed.name = name.to_string(),
            [LIBRARY_PROJECT, name] => {
                parsed.library = true;
                parsed.name = name.to_string();
            }
            [org, repo, name] => {
                parsed.repo = Some(format!("{org}/{repo}"));
                parsed.name = name.to_string();
            }
            [vcs, org, repo, name] => {
                parsed.vcs = owned(vcs);
                parsed.repo = Some(format!("{org}/{repo}"));
                parsed.name = name.to_string();
            }
            [project, vcs, org, repo, name] => {
                parsed.project = owned(project);
                parsed.vcs = owned(vcs);
                parsed.repo = Some(format!("{org}/{repo}"));
                parsed.name = name.to_string();
            }
            _ => return None,
        }
        Some(parsed)
    }
}

#[derive(Debug, Clone)]
enum Entity {
    Action(ActionDefinition),
    WorkerModel(WorkerModel),
    Template(JobTemplate),
}

/// Lookups already made during one crafting pass.
#[derive(Debug, Default)]
pub struct ResolutionCache {
    default_branches: HashMap<(String, String, String), String>,
    entities: HashMap<(EntityKind, EntityKey), Option<Entity>>,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Resolves entity references relative to a run.
pub struct EntityFinder<'a> {
    run: &'a Run,
    entities: &'a dyn EntityStore,
    repositories: &'a dyn RepositoryClient,
    cache: ResolutionCache,
}

impl<'a> EntityFinder<'a> {
    pub fn new(
        run: &'a Run,
        entities: &'a dyn EntityStore,
        repositories: &'a dyn RepositoryClient,
    ) -> Self {
        Self {
            run,
            entities,
            repositories,
            cache: ResolutionCache::new(),
        }
    }

    fn is_own_repository(&self, project: &str, vcs: &str, repo: &str) -> bool {
        project == self.run.project_key && vcs == self.run.vcs_server && repo == self.run.repository
    }

    async fn default_branch(&mut self, project: &str, vcs: &str, repo: &str) -> Result<String, CraftError> {
        let key = (project.to_string(), vcs.to_string(), repo.to_string());
        if let Some(branch) = self.cache.default_branches.get(&key) {
            return Ok(branch.clone());
        }
        let branch = self.repositories.default_branch(project, vcs, repo).await?;
        self.cache.default_branches.insert(key, branch.clone());
        Ok(branch)
    }

    /// Fully-qualified key of `reference`.
    ///
    /// Parts missing from the reference come from `base`, the key of the
    /// entity the reference was written in, or from the run itself.
    pub async fn key_for(
        &mut self,
        kind: EntityKind,
        reference: &str,
        base: Option<&EntityKey>,
    ) -> Result<EntityKey, CraftError> {
        let path = EntityPath::parse(reference).ok_or_else(|| CraftError::InvalidReference {
            kind,
            reference: reference.to_string(),
        })?;

        if path.library {
            return Ok(EntityKey::library(path.name));
        }

        let base = base.and_then(|key| match (&key.vcs, &key.repo) {
            (Some(vcs), Some(repo)) => Some((
                key.project.as_str(),
                vcs.as_str(),
                repo.as_str(),
                key.git_ref.as_deref(),
            )),
            _ => None,
        });
        let run = self.run;
        let (base_project, base_vcs, base_repo, base_ref) = base.unwrap_or((
            run.project_key.as_str(),
            run.vcs_server.as_str(),
            run.repository.as_str(),
            Some(run.workflow_ref.as_str()),
        ));
        let same_repository = path.project.is_none() && path.vcs.is_none() && path.repo.is_none();
        let inherited_ref = base_ref.filter(|_| same_repository).map(str::to_string);

        let project = path.project.unwrap_or_else(|| base_project.to_string());
        let vcs = path.vcs.unwrap_or_else(|| base_vcs.to_string());
        let repo = path.repo.unwrap_or_else(|| base_repo.to_string());

        let git_ref = match (path.git_ref, inherited_ref) {
            (Some(r), _) if r.starts_with(BRANCH_PREFIX) || r.starts_with(TAG_PREFIX) => r,
            (Some(r), _) => format!("{BRANCH_PREFIX}{r}"),
            (None, Some(r)) => r,
            (None, None) if self.is_own_repository(&project, &vcs, &repo) => self.run.workflow_ref.clone(),
            (None, None) => self.default_branch(&project, &vcs, &repo).await?,
        };

        Ok(EntityKey {
            project,
            vcs: Some(vcs),
            repo: Some(repo),
            name: path.name,
            git_ref: Some(git_ref),
        })
    }

    async fn load(&mut self, kind: EntityKind, key: &EntityKey) -> Result<Option<Entity>, CraftError> {
        let cache_key = (kind, key.clone());
        if let Some(found) = self.cache.entities.get(&cache_key) {
            return Ok(found.clone());
        }

        debug!(kind = %kind, key = %key, "Loading entity");
        let found = match kind {
            EntityKind::Action => self.entities.load_action(key).await?.map(Entity::Action),
            EntityKind::WorkerModel => self
                .entities
                .load_worker_model(key)
                .await?
                .map(Entity::WorkerModel),
            EntityKind::Template => self.entities.load_template(key).await?.map(Entity::Template),
        };
        self.cache.entities.insert(cache_key, found.clone());
        Ok(found)
    }

    async fn find(
        &mut self,
        kind: EntityKind,
        reference: &str,
        base: Option<&EntityKey>,
    ) -> Result<(EntityKey, Entity), CraftError> {
        let key = self.key_for(kind, reference, base).await?;
        if let Some(entity) = self.load(kind, &key).await? {
            return Ok((key, entity));
        }

        // Present on the default branch but gone at the run's revision.
        let implicit_ref = EntityPath::parse(reference).is_some_and(|p| p.git_ref.is_none());
        if let (true, Some(vcs), Some(repo)) = (implicit_ref, &key.vcs, &key.repo) {
            if self.is_own_repository(&key.project, vcs, repo) {
                let branch = self.default_branch(&key.project, vcs, repo).await?;
                if key.git_ref.as_deref() != Some(branch.as_str()) {
                    let mut head = key.clone();
                    head.git_ref = Some(branch);
                    if self.load(kind, &head).await?.is_some() {
                        return Err(CraftError::Obsolete {
                            kind,
                            reference: reference.to_string(),
                            git_ref: self.run.workflow_ref.clone(),
                        });
                    }
                }
            }
        }

        Err(CraftError::NotFound {
            kind,
            reference: reference.to_string(),
        })
    }

    pub async fn find_action(
        &mut self,
        reference: &str,
        base: Option<&EntityKey>,
    ) -> Result<(EntityKey, ActionDefinition), CraftError> {
        match self.find(EntityKind::Action, reference, base).await? {
            (key, Entity::Action(action)) => Ok((key, action)),
            _ => Err(mismatch(EntityKind::Action, reference)),
        }
    }

    pub async fn find_worker_model(
        &mut self,
        reference: &str,
        base: Option<&EntityKey>,
    ) -> Result<(EntityKey, WorkerModel), CraftError> {
        match self.find(EntityKind::WorkerModel, reference, base).await? {
            (key, Entity::WorkerModel(model)) => Ok((key, model)),
            _ => Err(mismatch(EntityKind::WorkerModel, reference)),
        }
    }

    pub async fn find_template(
        &mut self,
        reference: &str,
        base: Option<&EntityKey>,
    ) -> Result<(EntityKey, JobTemplate), CraftError> {
        match self.find(EntityKind::Template, reference, base).await? {
            (key, Entity::Template(template)) => Ok((key, template)),
            _ => Err(mismatch(EntityKind::Template, reference)),
        }
    }
}

fn mismatch(kind: EntityKind, reference: &str) -> CraftError {
    CraftError::Backend(gantry_core::Error::Internal(format!(
        "entity store returned the wrong kind of entity for {kind} {reference}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference_forms() {
        let short = EntityPath::parse("build").unwrap();
        assert_eq!(short.name, "build");
        assert!(short.project.is_none() && short.repo.is_none());

        let lib = EntityPath::parse("library/checkout").unwrap();
        assert!(lib.library);

        let repo = EntityPath::parse("org/tools/build@v2").unwrap();
        assert_eq!(repo.repo.as_deref(), Some("org/tools"));
        assert_eq!(repo.git_ref.as_deref(), Some("v2"));

        let vcs = EntityPath::parse("gitlab/org/tools/build").unwrap();
        assert_eq!(vcs.vcs.as_deref(), Some("gitlab"));

        let full = EntityPath::parse("OTHER/gitlab/org/tools/build@refs/tags/v1").unwrap();
        assert_eq!(full.project.as_deref(), Some("OTHER"));
        assert_eq!(full.git_ref.as_deref(), Some("refs/tags/v1"));
    }

    #[test]
    fn test_parse_rejects_malformed_paths() {
        assert!(EntityPath::parse("").is_none());
        assert!(EntityPath::parse("a//b").is_none());
        assert!(EntityPath::parse("org/repo").is_none());
        assert!(EntityPath::parse("a/b/c/d/e/f").is_none());
    }
}

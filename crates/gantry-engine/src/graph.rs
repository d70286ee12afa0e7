//! Job and stage dependency graphs.

use gantry_core::run::JobRun;
use gantry_core::workflow::WorkflowDefinition;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("job {job}: unknown job {need} in needs")]
    UnknownNeed { job: String, need: String },
    #[error("job {0}: a job cannot need itself")]
    SelfNeed(String),
    #[error("job {job}: need {need} must be in the same stage {stage}")]
    CrossStageNeed {
        job: String,
        need: String,
        stage: String,
    },
    #[error("job {0}: missing stage")]
    MissingStage(String),
    #[error("job {job}: stage {stage} not found")]
    UnknownStage { job: String, stage: String },
    #[error("stage {stage}: unknown stage {need} in needs")]
    UnknownStageNeed { stage: String, need: String },
    #[error("cycle detected in job dependencies")]
    JobCycle,
    #[error("cycle detected in stage dependencies")]
    StageCycle,
}

/// Check jobs and stages of a workflow, returning every problem found.
pub fn lint(workflow: &WorkflowDefinition) -> Vec<GraphError> {
    let mut errors = Vec::new();

    for (name, job) in &workflow.jobs {
        match (&job.stage, workflow.uses_stages()) {
            (None, true) => errors.push(GraphError::MissingStage(name.clone())),
            (Some(stage), _) if !workflow.stages.contains_key(stage) => {
                errors.push(GraphError::UnknownStage {
                    job: name.clone(),
                    stage: stage.clone(),
                })
            }
            _ => {}
        }

        for need in &job.needs {
            if need == name {
                errors.push(GraphError::SelfNeed(name.clone()));
                continue;
            }
            let Some(needed) = workflow.jobs.get(need) else {
                errors.push(GraphError::UnknownNeed {
                    job: name.clone(),
                    need: need.clone(),
                });
                continue;
            };
            if let Some(stage) = &job.stage {
                if needed.stage.as_ref() != Some(stage) {
                    errors.push(GraphError::CrossStageNeed {
                        job: name.clone(),
                        need: need.clone(),
                        stage: stage.clone(),
                    });
                }
            }
        }
    }

    for (name, stage) in &workflow.stages {
        for need in &stage.needs {
            if !workflow.stages.contains_key(need) {
                errors.push(GraphError::UnknownStageNeed {
                    stage: name.clone(),
                    need: need.clone(),
                });
            }
        }
    }

    if errors.is_empty() {
        if let Err(e) = JobGraph::build(workflow) {
            errors.push(e);
        }
        if has_stage_cycle(workflow) {
            errors.push(GraphError::StageCycle);
        }
    }

    errors
}

fn has_stage_cycle(workflow: &WorkflowDefinition) -> bool {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let index: HashMap<&str, NodeIndex> = workflow
        .stages
        .keys()
        .map(|name| (name.as_str(), graph.add_node(name.as_str())))
        .collect();

    for (name, stage) in &workflow.stages {
        for need in &stage.needs {
            if let Some(&from) = index.get(need.as_str()) {
                graph.add_edge(from, index[name.as_str()], ());
            }
        }
    }

    toposort(&graph, None).is_err()
}

/// Directed graph of jobs, edges pointing from a need to its dependent.
#[derive(Debug)]
pub struct JobGraph {
    graph: DiGraph<String, ()>,
    name_to_index: HashMap<String, NodeIndex>,
}

impl JobGraph {
    pub fn build(workflow: &WorkflowDefinition) -> Result<Self, GraphError> {
        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        for name in workflow.jobs.keys() {
            let idx = graph.add_node(name.clone());
            name_to_index.insert(name.clone(), idx);
        }

        for (name, job) in &workflow.jobs {
            let job_idx = name_to_index[name];
            for need in &job.needs {
                if need == name {
                    return Err(GraphError::SelfNeed(name.clone()));
                }
                let need_idx = name_to_index.get(need).ok_or_else(|| GraphError::UnknownNeed {
                    job: name.clone(),
                    need: need.clone(),
                })?;
                graph.add_edge(*need_idx, job_idx, ());
            }
        }

        toposort(&graph, None).map_err(|_| GraphError::JobCycle)?;

        Ok(Self {
            graph,
            name_to_index,
        })
    }

    /// Every job `job` depends on, directly or transitively.
    pub fn ancestors(&self, job: &str) -> BTreeSet<String> {
        let Some(&start) = self.name_to_index.get(job) else {
            return BTreeSet::new();
        };

        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        let mut ancestors = BTreeSet::new();
        while let Some(idx) = dfs.next(reversed) {
            if idx != start {
                ancestors.insert(self.graph[idx].clone());
            }
        }
        ancestors
    }
}

/// Derived state of every stage of a run.
#[derive(Debug, Clone, Default)]
pub struct StageGate {
    ended: BTreeMap<String, bool>,
    runnable: BTreeMap<String, bool>,
}

impl StageGate {
    /// A stage has ended when each of its jobs has instances and all of
    /// them are terminal. A stage can run once every stage it needs has ended.
    pub fn compute(workflow: &WorkflowDefinition, job_runs: &[JobRun]) -> Self {
        let mut by_job: HashMap<&str, Vec<&JobRun>> = HashMap::new();
        for jr in job_runs {
            by_job.entry(jr.job_id.as_str()).or_default().push(jr);
        }

        let ended: BTreeMap<String, bool> = workflow
            .stages
            .keys()
            .map(|stage| {
                let done = workflow
                    .jobs
                    .iter()
                    .filter(|(_, job)| job.stage.as_deref() == Some(stage.as_str()))
                    .all(|(name, _)| {
                        by_job
                            .get(name.as_str())
                            .is_some_and(|runs| runs.iter().all(|jr| jr.is_terminal()))
                    });
                (stage.clone(), done)
            })
            .collect();

        let runnable = workflow
            .stages
            .iter()
            .map(|(name, stage)| {
                let ready = stage
                    .needs
                    .iter()
                    .all(|need| ended.get(need).copied().unwrap_or(false));
                (name.clone(), ready)
            })
            .collect();

        Self { ended, runnable }
    }

    pub fn is_ended(&self, stage: &str) -> bool {
        self.ended.get(stage).copied().unwrap_or(false)
    }

    pub fn can_run(&self, stage: &str) -> bool {
        self.runnable.get(stage).copied().unwrap_or(false)
    }
}

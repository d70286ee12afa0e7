//! Expansion of jobs built `from` a job template.

use super::CraftError;
use super::finder::EntityFinder;
use gantry_core::entity::{EntityKey, JobTemplate};
use gantry_core::workflow::{JobDefinition, StageDefinition, WorkflowDefinition};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use tracing::debug;

static PARAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*params\.([A-Za-z0-9_\-]+)\s*\}\}").expect("valid parameter regex")
});

/// Replace every templated job of `workflow` until none is left.
///
/// Templates may reference other templates; expansion stops with an error
/// after `max_depth` rounds. Returns the key of the template each expanded
/// job came from.
pub async fn expand_templates(
    workflow: &mut WorkflowDefinition,
    finder: &mut EntityFinder<'_>,
    max_depth: usize,
) -> Result<BTreeMap<String, EntityKey>, CraftError> {
    let mut origins = BTreeMap::new();
    for _ in 0..max_depth {
        let templated: Vec<String> = workflow
            .jobs
            .iter()
            .filter(|(_, job)| job.from.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        if templated.is_empty() {
            return Ok(origins);
        }

        for job_id in templated {
            let Some(job) = workflow.jobs.get(&job_id).cloned() else {
                continue;
            };
            let Some(reference) = job.from.clone() else {
                continue;
            };
            let (key, template) = finder.find_template(&reference, origins.get(&job_id)).await?;
            debug!(job = %job_id, template = %key, "Expanding job template");
            let expanded: Vec<String> = template.jobs.keys().cloned().collect();
            apply_template(workflow, &job_id, &job, &reference, template)?;
            origins.remove(&job_id);
            for name in expanded {
                origins.insert(name, key.clone());
            }
        }
    }

    match workflow.jobs.values().find_map(|job| job.from.clone()) {
        Some(template) => Err(CraftError::TemplateDepth { template, max_depth }),
        None => Ok(origins),
    }
}

/// Substitute `${{ params.NAME }}` tokens of the template.
fn bind_parameters(
    template: JobTemplate,
    job_id: &str,
    params: &BTreeMap<String, String>,
) -> Result<JobTemplate, CraftError> {
    for declared in &template.parameters {
        if !params.contains_key(declared) {
            return Err(CraftError::MissingParameter {
                job: job_id.to_string(),
                parameter: declared.clone(),
                template: template.name.clone(),
            });
        }
    }

    let mut value = serde_json::to_value(&template).map_err(gantry_core::Error::from)?;
    substitute(&mut value, params);
    Ok(serde_json::from_value(value).map_err(gantry_core::Error::from)?)
}

fn substitute(value: &mut Value, params: &BTreeMap<String, String>) {
    match value {
        Value::String(s) if s.contains("${{") => {
            *s = PARAM_RE
                .replace_all(s, |caps: &regex::Captures| {
                    params
                        .get(&caps[1])
                        .cloned()
                        .unwrap_or_else(|| caps[0].to_string())
                })
                .into_owned();
        }
        Value::Array(items) => items.iter_mut().for_each(|v| substitute(v, params)),
        Value::Object(map) => map.values_mut().for_each(|v| substitute(v, params)),
        _ => {}
    }
}

/// Replace `job_id` by the jobs of `template`.
///
/// Template jobs without needs take the needs (and stage) of the replaced
/// job. Jobs that needed the replaced job now need every final job of the
/// template, a final job being one that no other template job needs.
fn apply_template(
    workflow: &mut WorkflowDefinition,
    job_id: &str,
    job: &JobDefinition,
    reference: &str,
    template: JobTemplate,
) -> Result<(), CraftError> {
    let template = bind_parameters(template, job_id, &job.parameters)?;

    for name in template.jobs.keys() {
        if name != job_id && workflow.jobs.contains_key(name) {
            return Err(CraftError::DuplicateJob {
                job: job_id.to_string(),
                duplicate: name.clone(),
                template: reference.to_string(),
            });
        }
    }

    let needed: BTreeSet<&String> = template.jobs.values().flat_map(|j| j.needs.iter()).collect();
    let final_jobs: Vec<String> = template
        .jobs
        .keys()
        .filter(|name| !needed.contains(name))
        .cloned()
        .collect();

    for (name, stage) in &template.stages {
        workflow
            .stages
            .entry(name.clone())
            .or_insert_with(|| StageDefinition {
                needs: stage.needs.clone(),
            });
    }

    workflow.jobs.remove(job_id);

    for other in workflow.jobs.values_mut() {
        if !other.needs.iter().any(|n| n == job_id) {
            continue;
        }
        let mut needs: Vec<String> = other.needs.iter().filter(|n| *n != job_id).cloned().collect();
        for final_job in &final_jobs {
            if !needs.contains(final_job) {
                needs.push(final_job.clone());
            }
        }
        other.needs = needs;
    }

    for (name, mut template_job) in template.jobs {
        if template_job.stage.is_none() {
            template_job.stage = job.stage.clone();
        }
        if template_job.needs.is_empty() && template_job.stage == job.stage {
            template_job.needs = job.needs.clone();
        }
        workflow.jobs.insert(name, template_job);
    }

    Ok(())
}

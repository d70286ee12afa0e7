//! Matrix expansion for parallel job generation.

use gantry_core::workflow::{MatrixCoordinate, MatrixSpec};
use serde_json::Value;

/// Expander for matrix strategies.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Cartesian product of every dimension, in declaration order.
    ///
    /// The first declared dimension varies slowest. An empty spec yields a
    /// single empty coordinate; dimensions without values are ignored.
    pub fn expand(&self, spec: &MatrixSpec) -> Vec<MatrixCoordinate> {
        let mut result = vec![MatrixCoordinate::new()];

        for (key, values) in spec.iter() {
            if values.is_empty() {
                continue;
            }
            let mut next = Vec::with_capacity(result.len() * values.len());
            for combo in &result {
                for value in values {
                    let mut cell = combo.clone();
                    cell.insert(key.clone(), value.clone());
                    next.push(cell);
                }
            }
            result = next;
        }

        result
    }

    /// Human-readable label such as `build (os=linux, arch=amd64)`.
    pub fn display_name(&self, job_id: &str, coordinate: &MatrixCoordinate) -> String {
        if coordinate.is_empty() {
            return job_id.to_string();
        }

        let parts: Vec<String> = coordinate
            .iter()
            .map(|(k, v)| {
                let v_str = match v {
                    Value::String(s) => s.clone(),
                    _ => v.to_string(),
                };
                format!("{k}={v_str}")
            })
            .collect();

        format!("{} ({})", job_id, parts.join(", "))
    }
}

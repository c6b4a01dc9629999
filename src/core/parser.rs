//! QF-014: YAML parsing and validation.
//!
//! Parses pipeline.yaml and validates structural constraints:
//! - Version must be "1.0"
//! - Task names must be usable as template prefixes
//! - depends_on references must exist
//! - Commands need targets, load steps need marker targets
//! - Naming rules need a suffix

use super::error::GraphError;
use super::graph::TaskGraph;
use super::types::*;
use std::path::Path;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Parse a pipeline.yaml file from disk.
pub fn parse_pipeline_file(path: &Path) -> Result<PipelineDef, GraphError> {
    let content = std::fs::read_to_string(path).map_err(|e| GraphError::Read {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    parse_pipeline(&content)
}

/// Parse a pipeline.yaml from a string.
pub fn parse_pipeline(yaml: &str) -> Result<PipelineDef, GraphError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| GraphError::Parse(e.to_string()))
}

/// Validate a parsed pipeline. Returns a list of errors (empty = valid).
pub fn validate_pipeline(def: &PipelineDef) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut push = |message: String| errors.push(ValidationError { message });

    if def.version != "1.0" {
        push(format!("version must be \"1.0\", got \"{}\"", def.version));
    }

    if def.name.trim().is_empty() {
        push("name must not be empty".to_string());
    }

    if def.tasks.is_empty() {
        push("pipeline declares no tasks".to_string());
    }

    if def.policy.timeout_secs == Some(0) {
        push("policy.timeout_secs must be positive".to_string());
    }

    for (id, task) in &def.tasks {
        if id.is_empty() || id.contains('.') || id.chars().any(char::is_whitespace) {
            push(format!("task name '{}' must be non-empty without dots or whitespace", id));
        }

        for dep in &task.depends_on {
            if dep == id {
                push(format!("task '{}' depends on itself", id));
            } else if !def.tasks.contains_key(dep) {
                push(format!("task '{}' depends on unknown task '{}'", id, dep));
            }
        }

        if let Some(command) = &task.command {
            if command.trim().is_empty() {
                push(format!("task '{}' has an empty command", id));
            } else if task.targets.is_empty() {
                push(format!("task '{}' runs a command but declares no targets", id));
            }
        }

        if let Some(naming) = &task.naming {
            if naming.suffix.trim().is_empty() {
                push(format!("task '{}' naming rule has an empty suffix", id));
            }
        }

        if let Some(load) = &task.load {
            if task.targets.is_empty() {
                push(format!("task '{}' loads results but declares no marker targets", id));
            }
            if load.source.trim().is_empty() {
                push(format!("task '{}' load has an empty source", id));
            }
        }

        if task.mkdir.iter().any(|d| d.trim().is_empty()) {
            push(format!("task '{}' has an empty mkdir entry", id));
        }

        if task.timeout_secs == Some(0) {
            push(format!("task '{}' timeout_secs must be positive", id));
        }
    }

    errors
}

/// Parse, validate, and assemble the task graph.
pub fn load_pipeline(path: &Path) -> Result<(PipelineDef, TaskGraph), GraphError> {
    let def = parse_pipeline_file(path)?;
    let errors = validate_pipeline(&def);
    if !errors.is_empty() {
        return Err(GraphError::Invalid(
            errors.into_iter().map(|e| e.message).collect(),
        ));
    }
    let graph = TaskGraph::build(&def.tasks)?;
    Ok((def, graph))
}

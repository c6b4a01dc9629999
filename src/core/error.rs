//! QF-002: Error taxonomy.
//!
//! Configuration and graph errors are fatal to a whole run. Task errors are
//! recorded against one task and its branch; store errors surface as task
//! errors of the ingestion kind.

use std::path::{Path, PathBuf};
use thiserror::Error;

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Configuration discovery and parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no pipeline configuration found in: {}", join_paths(.searched))]
    NotFound { searched: Vec<PathBuf> },

    #[error("{}:{line}: {message}", .path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn parse(path: &Path, line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.to_path_buf(),
            line,
            message: message.into(),
        }
    }
}

/// Pipeline definition and graph assembly.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("dependency cycle detected involving: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("task '{task}' depends on unknown '{dependency}'")]
    UnknownPredecessor { task: String, dependency: String },

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("cannot read pipeline {}: {message}", .path.display())]
    Read { path: PathBuf, message: String },

    #[error("pipeline parse error: {0}")]
    Parse(String),

    #[error("{} validation error(s): {}", .0.len(), .0.join("; "))]
    Invalid(Vec<String>),
}

/// Result ingestion into the pipeline database.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table '{0}' already exists (use mode replace or append)")]
    TableExists(String),

    #[error("{}:{line}: {message}", .path.display())]
    Load {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure of a single task. Never aborts unrelated branches.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("unknown parameter '{key}'")]
    Interpolation { key: String },

    #[error("unclosed placeholder at position {position}")]
    MalformedTemplate { position: usize },

    #[error("stage {stage} exited with code {exit_code}: {stderr}")]
    ExternalTool {
        stage: usize,
        exit_code: i32,
        stderr: String,
    },

    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("interrupted by signal")]
    Cancelled,

    #[error("cannot start shell: {0}")]
    Spawn(String),

    #[error("command succeeded but targets are missing: {}", .0.join(", "))]
    MissingTargets(Vec<String>),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tool succeeded but loading results failed: {0}")]
    Ingestion(#[from] StoreError),
}

impl TaskError {
    /// Short classification used in reports and the run journal.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Interpolation { .. } | Self::MalformedTemplate { .. } => "parameter",
            Self::ExternalTool { .. } | Self::Spawn(_) | Self::MissingTargets(_) => "external-tool",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Io { .. } => "io",
            Self::Ingestion(_) => "ingestion",
        }
    }

    pub fn is_interpolation(&self) -> bool {
        matches!(self, Self::Interpolation { .. } | Self::MalformedTemplate { .. })
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Errors that abort a run before or instead of any task.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

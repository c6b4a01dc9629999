//! QF-001: Pipeline definition, task state, and run report types.
//!
//! The pipeline definition is the YAML schema for `pipeline.yaml`: an ordered map of
//! tasks with their dependencies, targets, naming rule, command, and load step.
//! Run-time types (task state, outcomes, journal events) live here as well.

use super::error::TaskError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ============================================================================
// Top-level pipeline.yaml
// ============================================================================

/// Root of a pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDef {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Human-readable pipeline name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Execution policy
    #[serde(default)]
    pub policy: Policy,

    /// Task declarations (declaration order breaks topological ties)
    pub tasks: IndexMap<String, TaskDef>,
}

// ============================================================================
// Tasks
// ============================================================================

/// A single task declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDef {
    /// Optional one-line description shown by `show`
    #[serde(default)]
    pub description: Option<String>,

    /// Tasks that must complete before this one
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Input files; targets older than any of these are stale
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Output files whose existence satisfies the task
    #[serde(default)]
    pub targets: Vec<String>,

    /// Derive `outstem`/`outfile` from genotype and phenotype file names
    #[serde(default)]
    pub naming: Option<NamingRule>,

    /// Shell statement, possibly split into stages by `checkpoint`
    #[serde(default)]
    pub command: Option<String>,

    /// Load a result file into the pipeline database
    #[serde(default)]
    pub load: Option<LoadSpec>,

    /// Directories created before the command runs
    #[serde(default)]
    pub mkdir: Vec<String>,

    /// Working directory for the command, relative to the pipeline directory
    #[serde(default)]
    pub workdir: Option<String>,

    /// Per-task timeout override in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl TaskDef {
    /// A task with neither an action nor targets only groups its predecessors.
    pub fn is_aggregate(&self) -> bool {
        self.command.is_none() && self.load.is_none() && self.targets.is_empty()
    }
}

/// Naming rule: `cohort-platform-descriptor.suffix` inputs to a derived stem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamingRule {
    /// Genotype file name (template)
    pub genotype: String,

    /// Phenotype file name (template)
    pub phenotype: String,

    /// Tool result suffix appended to the stem, e.g. `MxEQTL`
    pub suffix: String,

    /// Output stem override (template); an empty value means "derive"
    #[serde(default)]
    pub prefix: Option<String>,
}

/// Load step: ingest a tab-separated result file into a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSpec {
    /// Tab-separated file with a header row (template)
    pub source: String,

    /// Table name; derived from the first target when omitted
    #[serde(default)]
    pub table: Option<String>,

    /// Columns to index after loading
    #[serde(default)]
    pub index: Vec<String>,

    /// What to do when the table already exists
    #[serde(default)]
    pub mode: LoadMode,
}

/// Behaviour when the target table already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Refuse to touch an existing table
    #[default]
    Fail,
    /// Drop and recreate the table
    Replace,
    /// Insert into the existing table
    Append,
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fail => write!(f, "fail"),
            Self::Replace => write!(f, "replace"),
            Self::Append => write!(f, "append"),
        }
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Execution policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    /// Failure handling
    #[serde(default)]
    pub failure: FailurePolicy,

    /// Default per-task timeout in seconds (none = wait forever)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Failure handling strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep running branches that do not depend on the failed task
    #[default]
    ContinueIndependent,
    /// Start no further tasks after the first failure
    StopOnFirst,
}

// ============================================================================
// Task state
// ============================================================================

/// Per-task state within one executor pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Skipped,
    Done,
    Failed,
    Blocked,
}

impl TaskState {
    /// Successors may proceed past this state.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Skipped | Self::Done)
    }

    /// Successors must be blocked by this state.
    pub fn blocks_successors(&self) -> bool {
        matches!(self, Self::Failed | Self::Blocked)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Skipped => write!(f, "SKIPPED"),
            Self::Done => write!(f, "DONE"),
            Self::Failed => write!(f, "FAILED"),
            Self::Blocked => write!(f, "BLOCKED"),
        }
    }
}

// ============================================================================
// Run report
// ============================================================================

/// Terminal outcome of one task in a pass.
#[derive(Debug)]
pub struct TaskOutcome {
    pub task: String,
    pub state: TaskState,
    /// Why the task was skipped, run, or blocked
    pub reason: String,
    pub error: Option<TaskError>,
    pub duration: Duration,
}

impl TaskOutcome {
    pub fn new(task: &str, state: TaskState, reason: impl Into<String>) -> Self {
        Self {
            task: task.to_string(),
            state,
            reason: reason.into(),
            error: None,
            duration: Duration::ZERO,
        }
    }

    pub fn failed(task: &str, error: TaskError, duration: Duration) -> Self {
        Self {
            task: task.to_string(),
            state: TaskState::Failed,
            reason: error.kind().to_string(),
            error: Some(error),
            duration,
        }
    }
}

/// Result of one executor pass.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub target: String,
    /// Outcomes in execution order
    pub outcomes: Vec<TaskOutcome>,
    /// A termination signal stopped the pass early
    pub interrupted: bool,
    pub total_duration: Duration,
}

impl RunReport {
    pub fn count(&self, state: TaskState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    pub fn outcome(&self, task: &str) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|o| o.task == task)
    }

    pub fn state_of(&self, task: &str) -> Option<TaskState> {
        self.outcome(task).map(|o| o.state)
    }

    /// Every task ended SKIPPED or DONE and the pass ran to completion.
    pub fn success(&self) -> bool {
        !self.interrupted && self.outcomes.iter().all(|o| o.state.is_ok())
    }
}

// ============================================================================
// Run journal events
// ============================================================================

/// Event appended to the JSONL run journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    RunStarted {
        run_id: String,
        target: String,
        qtlflow_version: String,
    },
    TaskStarted {
        run_id: String,
        task: String,
        reason: String,
    },
    TaskSkipped {
        run_id: String,
        task: String,
        reason: String,
    },
    TaskDone {
        run_id: String,
        task: String,
        duration_seconds: f64,
    },
    TaskFailed {
        run_id: String,
        task: String,
        kind: String,
        error: String,
    },
    TaskBlocked {
        run_id: String,
        task: String,
        reason: String,
    },
    RunCompleted {
        run_id: String,
        done: usize,
        skipped: usize,
        failed: usize,
        blocked: usize,
        pending: usize,
        interrupted: bool,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: String,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Tests
// ============================================================================

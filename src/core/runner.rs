//! QF-007: External command runner.
//!
//! Interpolates a command template, splits it at `checkpoint` markers and runs
//! the stages in order inside one bash process, so `cd` and exported variables
//! carry over. A stage that exits non-zero ends the statement; later stages
//! never start.

use super::config::ParameterMap;
use super::error::TaskError;
use super::template;
use crate::transport::{CancelToken, ExecControl, Shell, TransportError};
use std::path::Path;
use std::time::{Duration, Instant};

const CHECKPOINT: &str = "checkpoint";

/// Written to stderr as each stage starts; stripped from captured output.
const STAGE_MARKER: &str = "__qf_stage__=";

/// `checkpoint` counts only as a whole command: bounded by `;`, a newline,
/// or the ends of the statement.
fn is_checkpoint_at(statement: &str, start: usize) -> bool {
    let end = start + CHECKPOINT.len();
    let before = statement[..start].trim_end_matches([' ', '\t']);
    let after = statement[end..].trim_start_matches([' ', '\t']);
    let opens = before.is_empty() || before.ends_with(';') || before.ends_with('\n');
    let closes = after.is_empty() || after.starts_with(';') || after.starts_with(['\n', '\r']);
    opens && closes
}

/// Split a resolved statement into stages at `checkpoint` markers.
/// Empty stages are dropped.
pub fn split_stages(statement: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut from = 0;
    for (start, _) in statement.match_indices(CHECKPOINT) {
        if start < from || !is_checkpoint_at(statement, start) {
            continue;
        }
        pieces.push(&statement[from..start]);
        from = start + CHECKPOINT.len();
    }
    pieces.push(&statement[from..]);

    pieces
        .into_iter()
        .map(|s| s.trim().trim_matches(';').trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// One bash script for all stages. Each stage announces itself on stderr and
/// is followed by an exit-status guard.
pub fn stage_script(stages: &[String]) -> String {
    let mut script = String::from("set -o pipefail\n");
    for (i, stage) in stages.iter().enumerate() {
        script.push_str(&format!("echo {STAGE_MARKER}{} >&2\n", i + 1));
        script.push_str(stage);
        script.push_str("\n__qf_rc=$?; if [ $__qf_rc -ne 0 ]; then exit $__qf_rc; fi\n");
    }
    script
}

/// Remove stage markers from `stderr`, returning the cleaned text and the
/// last stage that started.
fn strip_stage_markers(stderr: &str) -> (String, usize) {
    let mut stage = 0;
    let mut cleaned = String::with_capacity(stderr.len());
    for line in stderr.split_inclusive('\n') {
        match line.trim_end().strip_prefix(STAGE_MARKER) {
            Some(n) => stage = n.parse().unwrap_or(stage),
            None => cleaned.push_str(line),
        }
    }
    (cleaned, stage)
}

/// Outcome of one statement. A non-zero `exit_code` carries the failing
/// stage's number.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// 1-based index of the last stage that started
    pub stage: usize,
    /// Number of stages in the statement
    pub stages: usize,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`TaskError::ExternalTool`].
    pub fn check(self) -> Result<Self, TaskError> {
        if self.success() {
            Ok(self)
        } else {
            Err(TaskError::ExternalTool {
                stage: self.stage,
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs command templates through a [`Shell`].
pub struct ExternalRunner<'a> {
    shell: &'a dyn Shell,
    cancel: CancelToken,
}

impl<'a> ExternalRunner<'a> {
    pub fn new(shell: &'a dyn Shell) -> Self {
        Self {
            shell,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run in the current directory with no timeout.
    pub fn run(&self, command: &str, params: &ParameterMap) -> Result<RunResult, TaskError> {
        self.run_in(command, params, Path::new("."), None)
    }

    /// Resolve every placeholder first, then run all stages in `cwd`.
    /// The timeout covers the whole statement.
    pub fn run_in(
        &self,
        command: &str,
        params: &ParameterMap,
        cwd: &Path,
        timeout: Option<Duration>,
    ) -> Result<RunResult, TaskError> {
        let statement = template::interpolate(command, params)?;
        let stages = split_stages(&statement);
        if self.cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }

        let started = Instant::now();
        if stages.is_empty() {
            return Ok(RunResult {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                duration: started.elapsed(),
                stage: 0,
                stages: 0,
            });
        }

        let ctl = ExecControl {
            timeout,
            cancel: self.cancel.clone(),
        };
        tracing::debug!(stages = stages.len(), shell = %self.shell.describe(), "running statement");
        let out = self
            .shell
            .exec(&stage_script(&stages), cwd, &ctl)
            .map_err(|e| match e {
                TransportError::TimedOut(d) => TaskError::Timeout { secs: d.as_secs() },
                TransportError::Cancelled => TaskError::Cancelled,
                TransportError::Spawn(msg) | TransportError::Io(msg) => TaskError::Spawn(msg),
            })?;

        let (stderr, stage) = strip_stage_markers(&out.stderr);
        if !out.success() {
            tracing::debug!(stage, exit_code = out.exit_code, "stage failed");
        }
        Ok(RunResult {
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr,
            duration: started.elapsed(),
            stage,
            stages: stages.len(),
        })
    }
}

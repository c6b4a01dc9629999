//! QF-012: Executor — one forward pass over the task graph.
//!
//! For each task of `run <target>` in topological order:
//! prepare → target predicate → (skip | block | mkdir → command → load) → journal

use super::config::ParameterMap;
use super::error::{GraphError, TaskError};
use super::eventlog;
use super::graph::{TaskGraph, TaskNode};
use super::planner::{self, Exports, PreparedTask};
use super::runner::ExternalRunner;
use super::store::ResultStore;
use super::types::*;
use crate::transport::{CancelToken, Shell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Alias under which `annotations_database` is attached.
pub const ANNOTATIONS_ALIAS: &str = "annotations";

/// Options for one `run` invocation.
pub struct RunOptions<'a> {
    pub target: &'a str,
    /// Tasks whose target predicate is ignored
    pub force: &'a [String],
    /// Pipeline directory; task paths are relative to it
    pub workdir: &'a Path,
    /// JSONL journal; `None` disables journaling
    pub journal: Option<&'a Path>,
}

/// Drives a [`TaskGraph`] through an [`ExternalRunner`] and [`ResultStore`].
pub struct Executor<'a> {
    graph: &'a TaskGraph,
    params: &'a ParameterMap,
    policy: &'a Policy,
    shell: &'a dyn Shell,
    cancel: CancelToken,
}

/// Mutable state of a single pass. Dropped when the pass ends.
struct Pass<'a> {
    run_id: String,
    opts: &'a RunOptions<'a>,
    states: HashMap<String, TaskState>,
    exports: Exports,
    store: Option<ResultStore>,
}

impl Pass<'_> {
    fn journal(&self, event: ProvenanceEvent) {
        if let Some(path) = self.opts.journal {
            if let Err(e) = eventlog::append_event(path, event) {
                warn!(error = %e, "cannot write run journal");
            }
        }
    }

    fn state(&self, task: &str) -> TaskState {
        self.states.get(task).copied().unwrap_or(TaskState::Pending)
    }
}

impl<'a> Executor<'a> {
    pub fn new(
        graph: &'a TaskGraph,
        params: &'a ParameterMap,
        policy: &'a Policy,
        shell: &'a dyn Shell,
    ) -> Self {
        Self {
            graph,
            params,
            policy,
            shell,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run `opts.target` and its ancestors. Only graph errors abort the pass;
    /// task failures are recorded in the report.
    pub fn run(&self, opts: &RunOptions) -> Result<RunReport, GraphError> {
        let started = Instant::now();
        let schedule = self.graph.schedule_for(opts.target)?;
        let mut pass = Pass {
            run_id: eventlog::generate_run_id(),
            opts,
            states: HashMap::new(),
            exports: Exports::new(),
            store: None,
        };

        info!(run_id = %pass.run_id, target = opts.target, tasks = schedule.len(), shell = %self.shell.describe(), "run started");
        pass.journal(ProvenanceEvent::RunStarted {
            run_id: pass.run_id.clone(),
            target: opts.target.to_string(),
            qtlflow_version: env!("CARGO_PKG_VERSION").to_string(),
        });

        let mut outcomes = Vec::with_capacity(schedule.len());
        for node in &schedule {
            if self.cancel.is_cancelled() {
                warn!("interrupted; no further tasks will start");
                break;
            }

            let outcome = self.visit(node, &mut pass);
            pass.states.insert(node.name.clone(), outcome.state);
            self.record(&pass, &outcome);
            let failed = outcome.state == TaskState::Failed;
            outcomes.push(outcome);

            if failed && self.policy.failure == FailurePolicy::StopOnFirst {
                warn!(task = %node.name, "stopping after first failure");
                break;
            }
        }

        for node in schedule.iter().skip(outcomes.len()) {
            outcomes.push(TaskOutcome::new(&node.name, TaskState::Pending, "not started"));
        }

        let report = RunReport {
            run_id: pass.run_id.clone(),
            target: opts.target.to_string(),
            outcomes,
            interrupted: self.cancel.is_cancelled(),
            total_duration: started.elapsed(),
        };

        pass.journal(ProvenanceEvent::RunCompleted {
            run_id: report.run_id.clone(),
            done: report.count(TaskState::Done),
            skipped: report.count(TaskState::Skipped),
            failed: report.count(TaskState::Failed),
            blocked: report.count(TaskState::Blocked),
            pending: report.count(TaskState::Pending),
            interrupted: report.interrupted,
            total_seconds: report.total_duration.as_secs_f64(),
        });
        info!(
            run_id = %report.run_id,
            done = report.count(TaskState::Done),
            skipped = report.count(TaskState::Skipped),
            failed = report.count(TaskState::Failed),
            blocked = report.count(TaskState::Blocked),
            "run finished"
        );

        Ok(report)
    }

    /// Decide and, if needed, execute one task.
    fn visit(&self, node: &TaskNode, pass: &mut Pass) -> TaskOutcome {
        let preds = node.predecessors();
        let blocked_by = preds.iter().find(|p| pass.state(p).blocks_successors());
        let ran = preds.iter().find(|p| pass.state(p) == TaskState::Done);

        if node.def.is_aggregate() {
            return match (blocked_by, ran) {
                (Some(p), _) => TaskOutcome::new(&node.name, TaskState::Blocked, format!("predecessor {p} did not complete")),
                (None, Some(p)) => TaskOutcome::new(&node.name, TaskState::Done, format!("predecessor {p} ran in this pass")),
                (None, None) => TaskOutcome::new(&node.name, TaskState::Skipped, "all predecessors up to date"),
            };
        }

        let prepared = match planner::prepare(&node.name, &node.def, self.params, &pass.exports) {
            Ok(p) => p,
            Err(e) => {
                if let Some(p) = blocked_by {
                    return TaskOutcome::new(&node.name, TaskState::Blocked, format!("predecessor {p} did not complete"));
                }
                return TaskOutcome::failed(&node.name, e, Duration::ZERO);
            }
        };
        pass.exports.extend(prepared.exports());

        let forced = pass.opts.force.iter().any(|f| f == &node.name);
        let freshness = planner::evaluate(pass.opts.workdir, &prepared, forced, ran.map(String::as_str));
        if freshness.is_satisfied() {
            return TaskOutcome::new(&node.name, TaskState::Skipped, freshness.to_string());
        }
        if let Some(p) = blocked_by {
            return TaskOutcome::new(&node.name, TaskState::Blocked, format!("predecessor {p} did not complete"));
        }

        pass.states.insert(node.name.clone(), TaskState::Running);
        pass.journal(ProvenanceEvent::TaskStarted {
            run_id: pass.run_id.clone(),
            task: node.name.clone(),
            reason: freshness.to_string(),
        });
        info!(task = %node.name, reason = %freshness, "running");

        let started = Instant::now();
        match self.execute(node, &prepared, pass) {
            Ok(()) => {
                let mut outcome = TaskOutcome::new(&node.name, TaskState::Done, freshness.to_string());
                outcome.duration = started.elapsed();
                outcome
            }
            Err(e) => TaskOutcome::failed(&node.name, e, started.elapsed()),
        }
    }

    /// mkdir → command → load (or target check).
    fn execute(&self, node: &TaskNode, task: &PreparedTask, pass: &mut Pass) -> Result<(), TaskError> {
        let workdir = pass.opts.workdir;

        for dir in &task.mkdir {
            let path = workdir.join(dir);
            std::fs::create_dir_all(&path)
                .map_err(|e| TaskError::io(format!("cannot create {}", path.display()), e))?;
        }

        if let Some(command) = &node.def.command {
            let cwd = match &task.workdir {
                Some(w) => workdir.join(w),
                None => workdir.to_path_buf(),
            };
            let timeout = node
                .def
                .timeout_secs
                .or(self.policy.timeout_secs)
                .map(Duration::from_secs);
            let result = ExternalRunner::new(self.shell)
                .with_cancel(self.cancel.clone())
                .run_in(command, &task.params, &cwd, timeout)?
                .check()?;
            debug!(task = %node.name, stages = result.stages, secs = result.duration.as_secs_f64(), "command finished");
        }

        match &task.load {
            Some(load) => {
                let store = self.store(pass)?;
                let summary = store.load(&workdir.join(&load.source), &load.table, &load.index, load.mode)?;
                info!(task = %node.name, table = %summary.table, rows = summary.rows, "results loaded");
                for target in &task.targets {
                    let path = workdir.join(target);
                    std::fs::write(&path, format!("{}\t{}\n", summary.table, summary.rows))
                        .map_err(|e| TaskError::io(format!("cannot write {}", path.display()), e))?;
                }
            }
            None => {
                let missing: Vec<String> = task
                    .targets
                    .iter()
                    .filter(|t| !workdir.join(t).exists())
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    return Err(TaskError::MissingTargets(missing));
                }
            }
        }

        Ok(())
    }

    /// Open the pipeline database on first use.
    fn store<'p>(&self, pass: &'p mut Pass) -> Result<&'p mut ResultStore, TaskError> {
        let store = match pass.store.take() {
            Some(store) => store,
            None => {
                let workdir = pass.opts.workdir;
                let db = PathBuf::from(self.params.require("database_name")?.render());
                let store = ResultStore::open(&workdir.join(db))?;
                if let Some(annotations) = self.params.get_str("annotations_database").filter(|a| !a.is_empty()) {
                    store.attach(&workdir.join(annotations), ANNOTATIONS_ALIAS)?;
                }
                store
            }
        };
        Ok(pass.store.insert(store))
    }

    /// Log and journal a terminal outcome.
    fn record(&self, pass: &Pass, outcome: &TaskOutcome) {
        let run_id = pass.run_id.clone();
        let task = outcome.task.clone();
        match outcome.state {
            TaskState::Done => {
                info!(task = %task, secs = outcome.duration.as_secs_f64(), "done");
                pass.journal(ProvenanceEvent::TaskDone {
                    run_id,
                    task,
                    duration_seconds: outcome.duration.as_secs_f64(),
                });
            }
            TaskState::Skipped => {
                info!(task = %task, reason = %outcome.reason, "skipped");
                pass.journal(ProvenanceEvent::TaskSkipped {
                    run_id,
                    task,
                    reason: outcome.reason.clone(),
                });
            }
            TaskState::Blocked => {
                warn!(task = %task, reason = %outcome.reason, "blocked");
                pass.journal(ProvenanceEvent::TaskBlocked {
                    run_id,
                    task,
                    reason: outcome.reason.clone(),
                });
            }
            TaskState::Failed => {
                let (kind, error) = match &outcome.error {
                    Some(e) => (e.kind().to_string(), e.to_string()),
                    None => ("unknown".to_string(), outcome.reason.clone()),
                };
                warn!(task = %task, kind = %kind, error = %error, "failed");
                pass.journal(ProvenanceEvent::TaskFailed {
                    run_id,
                    task,
                    kind,
                    error,
                });
            }
            TaskState::Pending | TaskState::Running => {}
        }
    }
}

//! QF-008: Task preparation, target predicate, and `show` plans.
//!
//! Preparation resolves a task's templates against the parameter map plus
//! task-local variables. The target predicate compares target and input
//! modification times; no scheduler state is read from disk.

use super::config::{ParamValue, ParameterMap};
use super::error::{GraphError, TaskError};
use super::graph::TaskGraph;
use super::naming;
use super::store;
use super::template::{interpolate, interpolate_all};
use super::types::{LoadMode, TaskDef};
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsStr;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;
use std::time::SystemTime;

/// Variables a task exports to tasks visited after it (`<task>.outfile`, ...).
pub type Exports = BTreeMap<String, ParamValue>;

/// Load step with every template resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedLoad {
    pub source: String,
    pub table: String,
    pub index: Vec<String>,
    pub mode: LoadMode,
}

/// A task with every path template resolved, ready to evaluate or run.
#[derive(Debug, Clone)]
pub struct PreparedTask {
    pub name: String,
    pub inputs: Vec<String>,
    pub targets: Vec<String>,
    pub outstem: Option<String>,
    pub outfile: Option<String>,
    pub mkdir: Vec<String>,
    pub workdir: Option<String>,
    pub load: Option<PreparedLoad>,
    /// Global parameters with this task's locals layered on top
    pub params: ParameterMap,
}

impl PreparedTask {
    /// Values later tasks can reference as `{{<task>.<key>}}`.
    pub fn exports(&self) -> Vec<(String, ParamValue)> {
        let mut out = Vec::new();
        if let Some(stem) = &self.outstem {
            out.push((format!("{}.outstem", self.name), ParamValue::from(stem.as_str())));
        }
        if let Some(file) = &self.outfile {
            out.push((format!("{}.outfile", self.name), ParamValue::from(file.as_str())));
        }
        out.push((format!("{}.outfiles", self.name), ParamValue::from(self.targets.join(" "))));
        out
    }
}

/// Strip everything from the first '.' of the file name, keeping directories.
fn stem_of(path: &str) -> String {
    let (dir, file) = match path.rfind('/') {
        Some(i) => (&path[..=i], &path[i + 1..]),
        None => ("", path),
    };
    let body = file.split_once('.').map(|(b, _)| b).unwrap_or(file);
    format!("{dir}{body}")
}

fn on_path(program: &str, path: Option<&OsStr>) -> bool {
    path.is_some_and(|p| std::env::split_paths(p).any(|dir| dir.join(program).is_file()))
}

/// `pythonw` when it is on `PATH`, otherwise `python`.
fn detect_py_exec(path: Option<&OsStr>) -> &'static str {
    if on_path("pythonw", path) {
        "pythonw"
    } else {
        "python"
    }
}

/// Interpreter for auxiliary scripts, exposed to every task as `{{py_exec}}`.
/// A non-empty configured `py_exec` wins; otherwise `PATH` is searched once.
pub fn py_exec(base: &ParameterMap) -> String {
    static DETECTED: OnceLock<&'static str> = OnceLock::new();
    match base.get_str("py_exec").filter(|p| !p.is_empty()) {
        Some(configured) => configured.to_string(),
        None => DETECTED
            .get_or_init(|| detect_py_exec(std::env::var_os("PATH").as_deref()))
            .to_string(),
    }
}

/// Resolve a task's templates. `exports` holds values from tasks visited
/// earlier in the pass.
pub fn prepare(
    name: &str,
    def: &TaskDef,
    base: &ParameterMap,
    exports: &Exports,
) -> Result<PreparedTask, TaskError> {
    let mut locals: Vec<(String, ParamValue)> = exports
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    locals.push(("py_exec".into(), ParamValue::from(py_exec(base))));
    let mut scope = base.layered(locals.clone());

    let mut outstem = None;
    let mut outfile = None;
    if let Some(rule) = &def.naming {
        let genotype = interpolate(&rule.genotype, &scope)?;
        let phenotype = interpolate(&rule.phenotype, &scope)?;
        let prefix = rule
            .prefix
            .as_deref()
            .map(|p| interpolate(p, &scope))
            .transpose()?;
        let stem = naming::derive_stem(&genotype, &phenotype, prefix.as_deref());
        let file = naming::output_name(&stem, &rule.suffix, &[]);
        locals.push(("outstem".into(), ParamValue::from(stem.as_str())));
        locals.push(("outfile".into(), ParamValue::from(file.as_str())));
        scope = base.layered(locals.clone());
        outstem = Some(stem);
        outfile = Some(file);
    }

    let inputs = interpolate_all(&def.inputs, &scope)?;
    if let Some(first) = inputs.first() {
        locals.push(("infile".into(), ParamValue::from(first.as_str())));
    }
    locals.push(("infiles".into(), ParamValue::from(inputs.join(" "))));
    scope = base.layered(locals.clone());

    let targets = interpolate_all(&def.targets, &scope)?;
    if def.naming.is_none() {
        if let Some(first) = targets.first() {
            outstem = Some(stem_of(first));
            outfile = Some(first.clone());
            locals.push(("outstem".into(), ParamValue::from(stem_of(first))));
            locals.push(("outfile".into(), ParamValue::from(first.as_str())));
        }
    }
    locals.push(("outfiles".into(), ParamValue::from(targets.join(" "))));
    let params = base.layered(locals);

    let mkdir = interpolate_all(&def.mkdir, &params)?;
    let workdir = def
        .workdir
        .as_deref()
        .map(|w| interpolate(w, &params))
        .transpose()?;

    let load = match &def.load {
        Some(spec) => {
            let table = match &spec.table {
                Some(t) => interpolate(t, &params)?,
                None => targets
                    .first()
                    .map(|t| store::table_name_for(t))
                    .unwrap_or_else(|| name.to_string()),
            };
            Some(PreparedLoad {
                source: interpolate(&spec.source, &params)?,
                table,
                index: interpolate_all(&spec.index, &params)?,
                mode: spec.mode,
            })
        }
        None => None,
    };

    Ok(PreparedTask {
        name: name.to_string(),
        inputs,
        targets,
        outstem,
        outfile,
        mkdir,
        workdir,
        load,
        params,
    })
}

/// Result of evaluating a task's target predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    UpToDate,
    Missing(String),
    Stale { target: String, input: String },
    InputMissing(String),
    UpstreamRan(String),
    NoTargets,
    Forced,
}

impl Freshness {
    /// The task can be skipped.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::UpToDate)
    }
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpToDate => write!(f, "targets up to date"),
            Self::Missing(t) => write!(f, "target missing: {t}"),
            Self::Stale { target, input } => write!(f, "target {target} older than input {input}"),
            Self::InputMissing(i) => write!(f, "input missing: {i}"),
            Self::UpstreamRan(p) => write!(f, "predecessor {p} ran in this pass"),
            Self::NoTargets => write!(f, "no targets declared"),
            Self::Forced => write!(f, "forced"),
        }
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Existence and modification-time check, relative to `workdir`.
pub fn evaluate_targets(workdir: &Path, task: &PreparedTask) -> Freshness {
    if task.targets.is_empty() {
        return Freshness::NoTargets;
    }

    let mut oldest: Option<(SystemTime, &str)> = None;
    for target in &task.targets {
        let Some(t) = mtime(&workdir.join(target)) else {
            return Freshness::Missing(target.clone());
        };
        if oldest.is_none_or(|(o, _)| t < o) {
            oldest = Some((t, target));
        }
    }

    let mut newest: Option<(SystemTime, &str)> = None;
    for input in &task.inputs {
        let Some(t) = mtime(&workdir.join(input)) else {
            return Freshness::InputMissing(input.clone());
        };
        if newest.is_none_or(|(n, _)| t > n) {
            newest = Some((t, input));
        }
    }

    match (oldest, newest) {
        (Some((target_time, target)), Some((input_time, input))) if target_time < input_time => {
            Freshness::Stale {
                target: target.to_string(),
                input: input.to_string(),
            }
        }
        _ => Freshness::UpToDate,
    }
}

/// Full predicate: forcing and upstream work override the filesystem check.
pub fn evaluate(
    workdir: &Path,
    task: &PreparedTask,
    forced: bool,
    upstream_ran: Option<&str>,
) -> Freshness {
    if forced {
        return Freshness::Forced;
    }
    if let Some(pred) = upstream_ran {
        return Freshness::UpstreamRan(pred.to_string());
    }
    evaluate_targets(workdir, task)
}

/// What `run` would do with one task.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanAction {
    Run(Freshness),
    Skip,
    Blocked(String),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct PlannedTask {
    pub task: String,
    pub description: Option<String>,
    pub action: PlanAction,
}

/// Dry-run plan for a target task.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub target: String,
    pub tasks: Vec<PlannedTask>,
    pub to_run: usize,
    pub to_skip: usize,
}

/// Predict the outcome of `run <target>` without starting anything.
/// A task that would run makes its successors run too.
pub fn plan(
    graph: &TaskGraph,
    params: &ParameterMap,
    workdir: &Path,
    target: &str,
    force: &[String],
) -> Result<ExecutionPlan, GraphError> {
    let schedule = graph.schedule_for(target)?;
    let mut exports = Exports::new();
    let mut would_run: HashSet<&str> = HashSet::new();
    let mut broken: HashSet<&str> = HashSet::new();
    let mut tasks = Vec::with_capacity(schedule.len());

    for node in schedule {
        let preds = node.predecessors();
        let broken_pred = preds.iter().find(|p| broken.contains(p.as_str()));
        let ran_pred = preds.iter().find(|p| would_run.contains(p.as_str()));

        let action = if node.def.is_aggregate() {
            match (broken_pred, ran_pred) {
                (Some(p), _) => PlanAction::Blocked(format!("predecessor {p} cannot run")),
                (None, Some(_)) => PlanAction::Run(Freshness::NoTargets),
                (None, None) => PlanAction::Skip,
            }
        } else {
            match prepare(&node.name, &node.def, params, &exports) {
                Err(e) => PlanAction::Error(e.to_string()),
                Ok(prepared) => {
                    exports.extend(prepared.exports());
                    let forced = force.iter().any(|f| f == &node.name);
                    let freshness = evaluate(workdir, &prepared, forced, ran_pred.map(String::as_str));
                    if freshness.is_satisfied() {
                        PlanAction::Skip
                    } else if let Some(p) = broken_pred {
                        PlanAction::Blocked(format!("predecessor {p} cannot run"))
                    } else {
                        PlanAction::Run(freshness)
                    }
                }
            }
        };

        match &action {
            PlanAction::Run(_) => {
                would_run.insert(node.name.as_str());
            }
            PlanAction::Blocked(_) | PlanAction::Error(_) => {
                broken.insert(node.name.as_str());
            }
            PlanAction::Skip => {}
        }

        tasks.push(PlannedTask {
            task: node.name.clone(),
            description: node.def.description.clone(),
            action,
        });
    }

    let to_run = tasks.iter().filter(|t| matches!(t.action, PlanAction::Run(_))).count();
    let to_skip = tasks.iter().filter(|t| t.action == PlanAction::Skip).count();

    Ok(ExecutionPlan {
        target: target.to_string(),
        tasks,
        to_run,
        to_skip,
    })
}

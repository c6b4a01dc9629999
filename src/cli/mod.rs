//! QF-015: CLI subcommands — init, validate, show, run, printconfig, make_report.

use crate::core::config::{self, ParamValue, ParameterMap};
use crate::core::error::{PipelineError, TaskError};
use crate::core::executor::{Executor, RunOptions};
use crate::core::planner::{self, ExecutionPlan, PlanAction};
use crate::core::runner::ExternalRunner;
use crate::core::types::{PipelineDef, RunReport, TaskState};
use crate::core::{eventlog, graph::TaskGraph, parser};
use crate::transport::{self, CancelToken};
use clap::Subcommand;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scaffold pipeline.yaml and pipeline.ini
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate pipeline.yaml and its task graph
    Validate {
        /// Path to pipeline.yaml
        #[arg(short, long, default_value = "pipeline.yaml")]
        file: PathBuf,
    },

    /// Show what `run` would do, without starting anything
    Show {
        /// Task to plan for
        #[arg(default_value = "full")]
        target: String,

        /// Path to pipeline.yaml
        #[arg(short, long, default_value = "pipeline.yaml")]
        file: PathBuf,

        /// Configuration search directory (repeatable; default: .. then .)
        #[arg(long = "config-dir")]
        config_dir: Vec<PathBuf>,

        /// Ignore the target predicate for this task (repeatable)
        #[arg(long)]
        force: Vec<String>,
    },

    /// Run a task and everything it depends on
    Run {
        /// Task to run (`full` for the whole pipeline)
        target: String,

        /// Path to pipeline.yaml
        #[arg(short, long, default_value = "pipeline.yaml")]
        file: PathBuf,

        /// Configuration search directory (repeatable; default: .. then .)
        #[arg(long = "config-dir")]
        config_dir: Vec<PathBuf>,

        /// Ignore the target predicate for this task (repeatable)
        #[arg(long)]
        force: Vec<String>,

        /// Run journal, relative to the pipeline directory
        #[arg(long, default_value = eventlog::JOURNAL_FILE)]
        journal: PathBuf,

        /// Do not write the run journal
        #[arg(long)]
        no_journal: bool,
    },

    /// Print the merged configuration
    Printconfig {
        /// Configuration search directory (repeatable; default: .. then .)
        #[arg(long = "config-dir")]
        config_dir: Vec<PathBuf>,
    },

    /// Build html and pdf reports in the report directory
    #[command(name = "make_report", alias = "make-report")]
    MakeReport {
        /// Configuration search directory (repeatable; default: .. then .)
        #[arg(long = "config-dir")]
        config_dir: Vec<PathBuf>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Dispatch a CLI command. `cancel` is set by the interrupt handler.
pub fn dispatch(cmd: Commands, cancel: &CancelToken) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Show {
            target,
            file,
            config_dir,
            force,
        } => cmd_show(&file, &target, &config_dir, &force),
        Commands::Run {
            target,
            file,
            config_dir,
            force,
            journal,
            no_journal,
        } => {
            let journal = if no_journal { None } else { Some(journal) };
            cmd_run(&file, &target, &config_dir, &force, journal.as_deref(), cancel)
        }
        Commands::Printconfig { config_dir } => cmd_printconfig(&config_dir),
        Commands::MakeReport { config_dir } => cmd_make_report(&config_dir, cancel),
        Commands::Completions { .. } => Err("completions are generated by the binary".to_string()),
    }
}

const PIPELINE_TEMPLATE: &str = r#"version: "1.0"
name: qtl
description: "QTL analysis pipeline"

policy:
  failure: continue_independent

tasks:
  run_mxqtl:
    description: "Run MatrixEQTL on a genotype/phenotype pair"
    mkdir: [MatrixEQTL]
    naming:
      genotype: "{{mxqtl_genotype}}"
      phenotype: "{{mxqtl_phenotype}}"
      suffix: MxEQTL
      prefix: "{{mxqtl_outfile_prefix}}"
    inputs: ["{{mxqtl_genotype}}", "{{mxqtl_phenotype}}"]
    targets: ["MatrixEQTL/{{outfile}}.cis"]
    command: "Rscript {{mxqtl_script}} --gex {{mxqtl_phenotype}} --geno {{mxqtl_genotype}} -O MatrixEQTL/{{outfile}}"

  load_mxqtl:
    description: "Load cis results into the pipeline database"
    depends_on: [run_mxqtl]
    inputs: ["MatrixEQTL/{{run_mxqtl.outfile}}.cis"]
    targets: ["{{run_mxqtl.outfile}}_cis.load"]
    load:
      source: "MatrixEQTL/{{run_mxqtl.outfile}}.cis"
      index: [SNP]
      mode: replace

  count_words:
    description: "Count words in the pipeline configuration"
    inputs: [pipeline.ini]
    targets: [pipeline.counts]
    command: |
      awk 'BEGIN { printf("word\tfreq\n"); }
      {for (i = 1; i <= NF; i++) freq[$i]++}
      END { for (word in freq) printf "%s\t%d\n", word, freq[word] }' < {{infile}} > {{outfile}}

  load_word_counts:
    description: "Load word counts into the pipeline database"
    depends_on: [count_words]
    inputs: ["{{count_words.outfile}}"]
    targets: ["{{count_words.outstem}}_counts.load"]
    load:
      source: "{{count_words.outfile}}"
      index: [word]
      mode: replace

  conda_info:
    description: "Record the conda environment"
    targets: [conda_packages.txt, environment.yml]
    command: |
      conda info -a ;
      conda list -e > conda_packages.txt ;
      conda list --show-channel-urls ;
      conda env export > environment.yml

  full:
    depends_on: [load_word_counts, conda_info]
"#;

const CONFIG_TEMPLATE: &str = r#"# Pipeline configuration. Keys in [general] are used as-is;
# keys in other sections are prefixed with the section name.

[general]
database_name = csvdb
annotations_database =
report_dir = report
report_name = pipeline_report

[mxqtl]
genotype = SNP.txt
phenotype = GE.txt
# empty: derive the output name from the input names
outfile_prefix =
script = run_MxEQTL.R
"#;

fn cmd_init(path: &Path) -> Result<(), String> {
    let pipeline_path = path.join("pipeline.yaml");
    let config_path = path.join("pipeline.ini");
    for p in [&pipeline_path, &config_path] {
        if p.exists() {
            return Err(format!("{} already exists", p.display()));
        }
    }

    std::fs::create_dir_all(path).map_err(|e| format!("cannot create {}: {}", path.display(), e))?;
    std::fs::write(&pipeline_path, PIPELINE_TEMPLATE)
        .map_err(|e| format!("cannot write {}: {}", pipeline_path.display(), e))?;
    std::fs::write(&config_path, CONFIG_TEMPLATE)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;

    println!("Initialized qtlflow pipeline at {}", path.display());
    println!("  Created: {}", pipeline_path.display());
    println!("  Created: {}", config_path.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let def = parser::parse_pipeline_file(file).map_err(|e| e.to_string())?;
    let errors = parser::validate_pipeline(&def);
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        return Err(format!("{} validation error(s)", errors.len()));
    }

    let graph = TaskGraph::build(&def.tasks).map_err(|e| e.to_string())?;
    println!("OK: {} ({} tasks)", def.name, graph.len());
    println!("  Order: {}", graph.order().join(" → "));
    Ok(())
}

/// Directory task paths are relative to.
fn pipeline_dir(file: &Path) -> PathBuf {
    match file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn search_paths(config_dir: &[PathBuf]) -> Vec<PathBuf> {
    if config_dir.is_empty() {
        config::default_search_paths()
    } else {
        config_dir.to_vec()
    }
}

/// Parse, validate, build the graph, and resolve configuration.
/// Any error here is fatal before a task starts.
fn load_all(
    file: &Path,
    config_dir: &[PathBuf],
) -> Result<(PipelineDef, TaskGraph, ParameterMap), PipelineError> {
    let (def, graph) = parser::load_pipeline(file)?;
    let params = config::resolve(&search_paths(config_dir))?;
    Ok((def, graph, params))
}

fn cmd_show(file: &Path, target: &str, config_dir: &[PathBuf], force: &[String]) -> Result<(), String> {
    let (def, graph, params) = load_all(file, config_dir).map_err(|e| e.to_string())?;
    let plan = planner::plan(&graph, &params, &pipeline_dir(file), target, force)
        .map_err(|e| e.to_string())?;
    print_plan(&def, &plan);
    Ok(())
}

/// Display a plan to stdout.
fn print_plan(def: &PipelineDef, plan: &ExecutionPlan) {
    println!("Planning: {} → {} ({} tasks)", def.name, plan.target, plan.tasks.len());
    println!();

    for task in &plan.tasks {
        let (symbol, detail) = match &task.action {
            PlanAction::Run(reason) => ("+", reason.to_string()),
            PlanAction::Skip => (" ", "up to date".to_string()),
            PlanAction::Blocked(reason) => ("!", reason.clone()),
            PlanAction::Error(e) => ("x", e.clone()),
        };
        match &task.description {
            Some(d) => println!("  {} {}: {} ({})", symbol, task.task, detail, d),
            None => println!("  {} {}: {}", symbol, task.task, detail),
        }
    }

    println!();
    println!("Plan: {} to run, {} up to date.", plan.to_run, plan.to_skip);
}

fn cmd_run(
    file: &Path,
    target: &str,
    config_dir: &[PathBuf],
    force: &[String],
    journal: Option<&Path>,
    cancel: &CancelToken,
) -> Result<(), String> {
    let (def, graph, params) = load_all(file, config_dir).map_err(|e| e.to_string())?;
    let workdir = pipeline_dir(file);
    let journal = journal.map(|j| workdir.join(j));
    let shell = transport::from_params(&params);

    let opts = RunOptions {
        target,
        force,
        workdir: &workdir,
        journal: journal.as_deref(),
    };
    let report = Executor::new(&graph, &params, &def.policy, shell.as_ref())
        .with_cancel(cancel.clone())
        .run(&opts)
        .map_err(|e| e.to_string())?;

    print_report(&report);

    if report.success() {
        Ok(())
    } else if report.interrupted {
        Err("run interrupted".to_string())
    } else {
        Err(format!(
            "{} task(s) failed, {} blocked",
            report.count(TaskState::Failed),
            report.count(TaskState::Blocked)
        ))
    }
}

/// Display the terminal state of every task.
fn print_report(report: &RunReport) {
    println!("Run {} → {}", report.run_id, report.target);
    for o in &report.outcomes {
        let state = o.state.to_string();
        let detail = match &o.error {
            Some(e) => format!("[{}] {}", e.kind(), e),
            None => o.reason.clone(),
        };
        if o.state == TaskState::Done && !o.duration.is_zero() {
            println!("  {:<8} {} ({:.1}s) {}", state, o.task, o.duration.as_secs_f64(), detail);
        } else {
            println!("  {:<8} {} {}", state, o.task, detail);
        }
    }

    println!();
    let summary = format!(
        "{} done, {} skipped, {} failed, {} blocked, {} pending ({:.1}s)",
        report.count(TaskState::Done),
        report.count(TaskState::Skipped),
        report.count(TaskState::Failed),
        report.count(TaskState::Blocked),
        report.count(TaskState::Pending),
        report.total_duration.as_secs_f64()
    );
    let ingestion = report
        .outcomes
        .iter()
        .filter(|o| matches!(o.error, Some(TaskError::Ingestion(_))))
        .count();
    if ingestion > 0 {
        println!("  {} ingestion failure(s): the tool succeeded but its results were not loaded", ingestion);
    }
    if report.interrupted {
        println!("Run interrupted: {}", summary);
    } else if report.success() {
        println!("Run complete: {}", summary);
    } else {
        println!("Run completed with errors: {}", summary);
    }
}

fn cmd_printconfig(config_dir: &[PathBuf]) -> Result<(), String> {
    let params = config::resolve(&search_paths(config_dir)).map_err(|e| e.to_string())?;
    for source in params.sources() {
        println!("# {}", source.display());
    }
    for (key, value) in params.iter() {
        println!("{} = {}", key, value);
    }
    Ok(())
}

/// Two checkpointed stages run inside the report directory.
const REPORT_STATEMENT: &str = "make html ; ln -sf _build/html/index.html . ; checkpoint ; \
                                make latexpdf ; ln -sf _build/latex/{{report_name}}.pdf .";

fn cmd_make_report(config_dir: &[PathBuf], cancel: &CancelToken) -> Result<(), String> {
    let params = config::resolve(&search_paths(config_dir)).map_err(|e| e.to_string())?;
    let report_dir = PathBuf::from(params.get_str("report_dir").unwrap_or("report"));
    if !report_dir.is_dir() {
        return Err(format!(
            "report directory {} does not exist; create it with sphinx-quickstart (conf.py and Makefile) first",
            report_dir.display()
        ));
    }

    let report_name = params.get_str("report_name").unwrap_or("report").to_string();
    let params = params.layered([("report_name".to_string(), ParamValue::from(report_name))]);
    let shell = transport::from_params(&params);

    println!("Building html and pdf reports in {}", report_dir.display());
    let result = ExternalRunner::new(shell.as_ref())
        .with_cancel(cancel.clone())
        .run_in(REPORT_STATEMENT, &params, &report_dir, None)
        .and_then(|r| r.check())
        .map_err(|e| e.to_string())?;
    println!(
        "Reports built ({} stages, {:.1}s)",
        result.stages,
        result.duration.as_secs_f64()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qf015_init_creates_files() {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path()).unwrap();
        assert!(dir.path().join("pipeline.yaml").exists());
        assert!(dir.path().join("pipeline.ini").exists());
        let err = cmd_init(dir.path()).unwrap_err();
        assert!(err.contains("already exists"));
    }

    #[test]
    fn test_qf015_scaffold_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path()).unwrap();
        cmd_validate(&dir.path().join("pipeline.yaml")).unwrap();

        let (def, graph) = parser::load_pipeline(&dir.path().join("pipeline.yaml")).unwrap();
        assert_eq!(def.name, "qtl");
        let full: Vec<_> = graph
            .schedule_for("full")
            .unwrap()
            .iter()
            .map(|n| n.name.clone())
            .collect();
        assert_eq!(full, vec!["count_words", "load_word_counts", "conda_info", "full"]);
    }

    #[test]
    fn test_qf015_scaffold_config_resolves() {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path()).unwrap();
        let params = config::resolve(&[dir.path().to_path_buf()]).unwrap();
        assert_eq!(params.get_str("database_name"), Some("csvdb"));
        assert_eq!(params.get_str("mxqtl_genotype"), Some("SNP.txt"));
        assert_eq!(params.get_str("mxqtl_outfile_prefix"), Some(""));
    }

    #[test]
    fn test_qf015_scaffold_rerun_starts_nothing() {
        use crate::core::runner::tests::SpyShell;
        use std::time::{Duration, SystemTime};

        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path()).unwrap();
        let newer = SystemTime::now() + Duration::from_secs(10);
        for (name, offset) in [
            ("pipeline.counts", 0),
            ("pipeline_counts.load", 10),
            ("conda_packages.txt", 0),
            ("environment.yml", 0),
        ] {
            let path = dir.path().join(name);
            std::fs::write(&path, "x\n").unwrap();
            let file = std::fs::File::options().write(true).open(&path).unwrap();
            file.set_modified(newer + Duration::from_secs(offset)).unwrap();
        }

        let (def, graph, params) =
            load_all(&dir.path().join("pipeline.yaml"), &[dir.path().to_path_buf()]).unwrap();
        let spy = SpyShell::default();
        let opts = RunOptions {
            target: "full",
            force: &[],
            workdir: dir.path(),
            journal: None,
        };
        let report = Executor::new(&graph, &params, &def.policy, &spy).run(&opts).unwrap();

        assert!(report.success(), "{:?}", report.outcomes);
        assert_eq!(spy.calls(), 0);
        assert_eq!(report.count(TaskState::Skipped), 4);
        assert_eq!(report.state_of("conda_info"), Some(TaskState::Skipped));
        assert_eq!(report.state_of("full"), Some(TaskState::Skipped));
    }

    #[test]
    fn test_qf015_scaffold_plan_names_outputs() {
        let dir = tempfile::tempdir().unwrap();
        cmd_init(dir.path()).unwrap();
        let (_, graph, params) =
            load_all(&dir.path().join("pipeline.yaml"), &[dir.path().to_path_buf()]).unwrap();
        let plan = planner::plan(&graph, &params, dir.path(), "load_mxqtl", &[]).unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert!(matches!(
            plan.tasks[0].action,
            PlanAction::Run(planner::Freshness::Missing(ref t)) if t.starts_with("MatrixEQTL/") && t.ends_with(".cis")
        ));
        assert!(matches!(
            plan.tasks[1].action,
            PlanAction::Run(planner::Freshness::UpstreamRan(ref p)) if p == "run_mxqtl"
        ));
    }

    #[test]
    fn test_qf015_validate_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pipeline.yaml");
        std::fs::write(&file, "version: \"1.0\"\nname: x\ntasks:\n  a:\n    depends_on: [nope]\n").unwrap();
        let err = cmd_validate(&file).unwrap_err();
        assert!(err.contains("1 validation error"));
    }

    #[test]
    fn test_qf015_run_and_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pipeline.yaml");
        std::fs::write(
            &file,
            r#"
version: "1.0"
name: mini
tasks:
  greet:
    targets: ["{{greeting_file}}"]
    command: "echo {{greeting}} > {{outfile}}"
  full:
    depends_on: [greet]
"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("pipeline.ini"),
            "[general]\ngreeting = hello\ngreeting_file = hello.txt\n",
        )
        .unwrap();
        let config_dir = vec![dir.path().to_path_buf()];
        let cancel = CancelToken::new();

        cmd_run(&file, "full", &config_dir, &[], Some(Path::new("events.jsonl")), &cancel).unwrap();
        let out = std::fs::read_to_string(dir.path().join("hello.txt")).unwrap();
        assert_eq!(out.trim(), "hello");
        assert!(dir.path().join("events.jsonl").exists());

        cmd_run(&file, "full", &config_dir, &[], None, &cancel).unwrap();
        let journal = std::fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        assert_eq!(journal.lines().filter(|l| l.contains("run_started")).count(), 1);
    }

    #[test]
    fn test_qf015_run_failure_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pipeline.yaml");
        std::fs::write(
            &file,
            "version: \"1.0\"\nname: f\ntasks:\n  bad:\n    targets: [bad.txt]\n    command: \"exit 3\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("pipeline.ini"), "[general]\nx = 1\n").unwrap();
        let err = cmd_run(
            &file,
            "bad",
            &[dir.path().to_path_buf()],
            &[],
            None,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(err.contains("1 task(s) failed"));
    }

    #[test]
    fn test_qf015_run_without_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pipeline.yaml");
        std::fs::write(&file, "version: \"1.0\"\nname: f\ntasks:\n  a: {}\n").unwrap();
        let err = cmd_run(
            &file,
            "a",
            &[dir.path().join("empty")],
            &[],
            None,
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(err.contains("no pipeline configuration found"));
    }

    #[test]
    fn test_qf015_make_report_requires_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no_such_report_dir");
        std::fs::write(
            dir.path().join("pipeline.ini"),
            format!("[general]\nreport_dir = {}\n", missing.display()),
        )
        .unwrap();
        let err = cmd_make_report(&[dir.path().to_path_buf()], &CancelToken::new()).unwrap_err();
        assert!(err.contains("does not exist"));
    }

    #[test]
    fn test_qf015_pipeline_dir() {
        assert_eq!(pipeline_dir(Path::new("pipeline.yaml")), PathBuf::from("."));
        assert_eq!(pipeline_dir(Path::new("work/pipeline.yaml")), PathBuf::from("work"));
    }

    #[test]
    fn test_qf015_report_statement_has_two_stages() {
        let stages = crate::core::runner::split_stages(REPORT_STATEMENT);
        assert_eq!(stages.len(), 2);
        assert!(stages[0].starts_with("make html"));
        assert!(stages[1].contains("{{report_name}}.pdf"));
    }
}

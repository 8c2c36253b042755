use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;

use weave::config::Config;
use weave::core::TaskPath;
use weave::manifest::Manifest;
use weave::orchestration::{CompositeOutcome, CompositeSettings, TaskState};
use weave::util::{blocking, blocking_with_timeout};
use weave::{wlog, wlog_error, Error, Result};

/// Weave - run tasks across the builds of a composite build
#[derive(Parser, Debug)]
#[command(name = "weave")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    WEAVE_DEBUG=1   Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.weave/weave.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file to use instead of ~/.weave/weave.toml
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run tasks and everything they depend on
    Run {
        /// Manifest describing the builds and their tasks
        manifest: PathBuf,

        /// Qualified task paths, e.g. app:test
        #[arg(required = true)]
        tasks: Vec<String>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,

        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show each build's tasks in dependency order
    Graph {
        /// Manifest describing the builds and their tasks
        manifest: PathBuf,
    },
}

#[derive(Debug, Serialize)]
struct TaskReport {
    path: TaskPath,
    state: TaskState,
}

#[derive(Debug, Serialize)]
struct RunReport {
    success: bool,
    tasks: Vec<TaskReport>,
    outcome: CompositeOutcome,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    weave::log::init_with_debug(cli.debug);
    if cli.debug {
        wlog!("weave starting (debug mode enabled)");
    }

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Run {
            manifest,
            tasks,
            json,
            timeout,
        } => {
            let success = run_tasks(&config, manifest, tasks, json, timeout)?;
            if !success {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Graph { manifest } => show_graph(&config, manifest),
    }
}

/// Run the requested tasks and print their final states.
///
/// Returns whether every build succeeded.
fn run_tasks(
    config: &Config,
    manifest: PathBuf,
    tasks: Vec<String>,
    json: bool,
    timeout: Option<u64>,
) -> Result<bool> {
    let manifest = Manifest::load(&manifest)?;
    let composite = Arc::new(manifest.to_composite(CompositeSettings::from(config))?);
    let requested = parse_task_paths(&tasks)?;
    let timeout = timeout.or(config.timeout_secs).map(Duration::from_secs);
    wlog!("Run command: tasks={:?}, timeout={:?}", tasks, timeout);

    let rt = tokio::runtime::Runtime::new()?;
    let runner = Arc::clone(&composite);
    let result = rt.block_on(async move {
        match timeout {
            Some(limit) => blocking_with_timeout(limit, move || runner.run(&requested)).await,
            None => blocking(move || runner.run(&requested)).await,
        }
    });

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            wlog_error!("run failed: {}", err);
            if matches!(err, Error::Timeout(_)) {
                composite.stop();
            }
            rt.shutdown_timeout(Duration::from_secs(5));
            return Err(err);
        }
    };

    let report = RunReport {
        success: outcome.is_success(),
        tasks: composite
            .task_states()
            .into_iter()
            .map(|(path, state)| TaskReport { path, state })
            .collect(),
        outcome,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(report.success)
}

fn parse_task_paths(tasks: &[String]) -> Result<Vec<TaskPath>> {
    tasks
        .iter()
        .map(|task| {
            let path = TaskPath::new(task);
            match path.build_name() {
                Some(build) if !build.is_empty() && !path.local_name().is_empty() => Ok(path),
                _ => Err(Error::Validation(format!(
                    "task '{}' must be qualified as <build>:<task>",
                    task
                ))),
            }
        })
        .collect()
}

fn print_report(report: &RunReport) {
    for task in &report.tasks {
        println!("  {} {}", format_state(task.state), task.path);
    }
    println!();
    for (build, failure) in report.outcome.failures() {
        println!("  [{}] {}", build, failure);
    }
    if report.success {
        println!("BUILD SUCCESSFUL");
    } else {
        println!("BUILD FAILED");
    }
}

fn format_state(state: TaskState) -> &'static str {
    match state {
        TaskState::Success => "✓",
        TaskState::Failed => "✗",
        TaskState::Waiting => "·",
    }
}

fn show_graph(config: &Config, manifest: PathBuf) -> Result<()> {
    let manifest = Manifest::load(&manifest)?;
    let composite = manifest.to_composite(CompositeSettings::from(config))?;
    for name in composite.build_names() {
        let build = composite.build(&name)?;
        println!("{}", name);
        for path in build.engine().topological_order()? {
            let dependencies = build.engine().dependencies_of(&path).unwrap_or_default();
            if dependencies.is_empty() {
                println!("  {}", path);
            } else {
                let dependencies: Vec<_> = dependencies.iter().map(|d| d.to_string()).collect();
                println!("  {} <- {}", path, dependencies.join(", "));
            }
        }
    }
    Ok(())
}

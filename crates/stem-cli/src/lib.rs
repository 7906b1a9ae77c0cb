//! stem-cli
//!
//! `stem` コマンドの実装。demo workspace に対して task を実行する。
//!
//! ```text
//! stem structure
//! stem [--runner threads] [--workers 4] [--routing shared] run combo --meta '{"x": 5}'
//! stem worker            # process runner の子プロセス (hidden)
//! ```
//!
//! `run` prints the task's value as JSON on stdout. A task that produced no
//! value prints a JSON report tagged by `status` instead and exits non-zero.

pub mod demo;

use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Value, json};
use stem_core::{
    Meta, MetaRouting, RunnerConfig, RunnerKind, StemError, TaskError, TaskMaster, TaskResult, Workspace,
};

#[derive(Parser)]
#[command(name = "stem")]
#[command(about = "Declarative task orchestration")]
#[command(version)]
pub struct Cli {
    /// Execution strategy
    #[arg(long, value_enum, default_value_t = RunnerArg::Sequential, global = true)]
    pub runner: RunnerArg,

    /// Worker bound for the threads and processes runners
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// How meta is forwarded to dependencies
    #[arg(long, value_enum, default_value_t = RoutingArg::Overlay, global = true)]
    pub routing: RoutingArg,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the workspace layout as JSON
    Structure,

    /// Execute a task and print its value
    Run {
        /// Dotted task path (e.g. combo, text.greet)
        task: String,

        /// Meta as a JSON object literal, or a path to a JSON file
        #[arg(long)]
        meta: Option<String>,
    },

    /// Answer one process-runner request on stdin/stdout
    #[command(hide = true)]
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RunnerArg {
    Sequential,
    Threads,
    Processes,
    Cooperative,
}

impl From<RunnerArg> for RunnerKind {
    fn from(arg: RunnerArg) -> Self {
        match arg {
            RunnerArg::Sequential => RunnerKind::Sequential,
            RunnerArg::Threads => RunnerKind::Threads,
            RunnerArg::Processes => RunnerKind::Processes,
            RunnerArg::Cooperative => RunnerKind::Cooperative,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RoutingArg {
    Overlay,
    Shared,
}

impl From<RoutingArg> for MetaRouting {
    fn from(arg: RoutingArg) -> Self {
        match arg {
            RoutingArg::Overlay => MetaRouting::Overlay,
            RoutingArg::Shared => MetaRouting::Shared,
        }
    }
}

impl Cli {
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            kind: self.runner.into(),
            max_workers: self.workers,
            routing: self.routing.into(),
            worker: None,
        }
    }
}

/// Parses `--meta`: an inline JSON literal or a file holding one.
pub fn load_meta(arg: Option<&str>) -> anyhow::Result<Meta> {
    let Some(arg) = arg else {
        return Ok(Meta::new());
    };

    let trimmed = arg.trim_start();
    let source = if trimmed.starts_with('{') || !Path::new(arg).is_file() {
        arg.to_string()
    } else {
        std::fs::read_to_string(arg).with_context(|| format!("failed to read meta file '{arg}'"))?
    };

    let value: Value = serde_json::from_str(&source).with_context(|| format!("meta is not valid JSON: {arg}"))?;
    Ok(Meta::from(value))
}

/// JSON report for a result without a value.
pub fn error_report(result: &TaskResult, error: &TaskError) -> Value {
    let mut report = match error {
        TaskError::Dependencies(errors) => json!({ "errors": errors }),
        TaskError::Meta(errors) => json!({ "errors": errors }),
        TaskError::Invocation(err) => json!({
            "task": err.task(),
            "message": format!("{:#}", err.cause()),
        }),
    };
    report["status"] = json!(error.status().as_str());
    report["id"] = json!(result.id().to_string());
    report
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value)?;
    writeln!(stdout)?;
    Ok(())
}

fn run_task(cli: &Cli, task: &str, meta: Option<&str>, workspace: &Workspace) -> anyhow::Result<ExitCode> {
    let meta = load_meta(meta)?;
    let master = TaskMaster::from_config(&cli.runner_config())?;

    let result = match master.execute_path(&meta, task, workspace) {
        Ok(result) => result,
        Err(StemError::TaskNotFound(task, workspace)) => {
            print_json(&json!({ "status": "NOT_FOUND", "task": task, "workspace": workspace }))?;
            return Ok(ExitCode::from(2));
        }
        Err(err) => return Err(err.into()),
    };

    match result.value() {
        Ok(value) => {
            print_json(&value)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            tracing::debug!(id = %result.id(), status = %err.status(), "task produced no value");
            print_json(&error_report(&result, &err))?;
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Dispatches a parsed command line against `workspace`.
pub fn run(cli: Cli, workspace: &Workspace) -> anyhow::Result<ExitCode> {
    match &cli.command {
        Commands::Structure => {
            print_json(&serde_json::to_value(workspace.structure())?)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { task, meta } => run_task(&cli, task, meta.as_deref(), workspace),
        Commands::Worker => {
            stem_core::worker::serve(workspace, &mut io::stdin().lock(), &mut io::stdout().lock())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_build_the_runner_config() {
        let cli = Cli::parse_from(["stem", "--runner", "threads", "--workers", "2", "--routing", "shared", "structure"]);
        let config = cli.runner_config();
        assert_eq!(config.kind, RunnerKind::Threads);
        assert_eq!(config.max_workers, Some(2));
        assert_eq!(config.routing, MetaRouting::Shared);
    }

    #[test]
    fn global_flags_are_accepted_after_the_subcommand() {
        let cli = Cli::parse_from(["stem", "run", "combo", "--runner", "cooperative"]);
        assert_eq!(cli.runner, RunnerArg::Cooperative);
        assert!(matches!(cli.command, Commands::Run { ref task, meta: None } if task == "combo"));
    }

    #[test]
    fn meta_defaults_to_an_empty_object() {
        assert_eq!(load_meta(None).unwrap(), Meta::new());
    }

    #[test]
    fn inline_meta_is_parsed() {
        let meta = load_meta(Some(r#"{"x": 5}"#)).unwrap();
        assert_eq!(meta.get("x"), Some(&json!(5)));
    }

    #[test]
    fn invalid_meta_is_an_error() {
        assert!(load_meta(Some("{not json")).is_err());
    }
}

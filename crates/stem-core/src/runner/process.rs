//! Dependencies in worker child processes.
//!
//! Each dependency resolved by workspace path is sent to a fresh child process
//! spawned from a [`WorkerCommand`]; the child resolves the same path in its
//! own copy of the workspace and answers with a single envelope (see
//! [`crate::worker`]). A dependency passed by direct reference has no path a
//! child could look up, so it runs in-process.
//!
//! A sequence crosses the boundary as a JSON array tagged `"kind": "seq"` and
//! is handed to the parent as a sequence again.

use std::num::NonZeroUsize;
use std::path::PathBuf;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{TaskRunner, assert_runnable, dependency_metas, invoke};
use crate::error::{InvocationError, StemError};
use crate::meta::{Meta, MetaRouting};
use crate::task::{Data, Inputs};
use crate::tree::TaskNode;
use crate::worker::{self, WorkerRequest};
use crate::workspace::TaskPath;

/// Program (plus arguments) that speaks the worker protocol on stdin/stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The running executable, invoked as `<exe> worker`.
    pub fn current_exe() -> Result<Self, StemError> {
        Ok(Self::new(std::env::current_exe()?).arg("worker"))
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Runs path-resolved dependencies in at most `max_workers` concurrent child
/// processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    command: WorkerCommand,
    max_workers: usize,
    routing: MetaRouting,
}

impl ProcessRunner {
    pub fn new(command: WorkerCommand, routing: MetaRouting) -> Self {
        Self {
            command,
            max_workers: default_workers(),
            routing,
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    fn run_local(&self, meta: &Meta, node: &TaskNode) -> Result<Data, InvocationError> {
        let outputs = dependency_metas(meta, node, self.routing)
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|(dep, dep_meta)| -> Result<(String, Data), InvocationError> {
                let data = match dep.path() {
                    Some(path) => self.run_remote(&dep_meta, dep, path)?,
                    None => self.run_local(&dep_meta, dep)?,
                };
                Ok((dep.name(), data))
            })
            .collect::<Result<Vec<_>, _>>()?;

        invoke(node, meta, outputs.into_iter().collect::<Inputs>())
    }

    fn run_remote(&self, meta: &Meta, node: &TaskNode, path: &TaskPath) -> Result<Data, InvocationError> {
        let request = WorkerRequest {
            task: path.to_string(),
            meta: meta.clone(),
            routing: self.routing,
        };
        tracing::debug!(task = %path, program = %self.command.program.display(), "dispatching to worker");

        let response = worker::call(&self.command, &request).map_err(|err| InvocationError::new(node.name(), err))?;
        response
            .into_data()
            .map_err(|err| InvocationError::new(node.name(), err))
    }
}

impl TaskRunner for ProcessRunner {
    fn run(&self, meta: &Meta, node: &TaskNode) -> Result<Data, InvocationError> {
        assert_runnable(node);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.max_workers)
            .thread_name(|i| format!("stem-dispatch-{i}"))
            .build()
            .map_err(|err| InvocationError::new(node.name(), err))?;
        tracing::debug!(workers = self.max_workers, task = %node.name(), "process pool started");

        pool.install(|| self.run_local(meta, node))
    }

    fn routing(&self) -> MetaRouting {
        self.routing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::arithmetic;
    use crate::task::{Dependency, IntoTaskRef, data, task};
    use crate::workspace::Workspace;
    use serde_json::json;

    fn unreachable_worker() -> WorkerCommand {
        WorkerCommand::new("/nonexistent/stem-worker").arg("worker")
    }

    #[test]
    fn direct_references_never_leave_the_process() {
        let leaf = data("leaf", |_meta: &Meta| Ok(20_i64)).into_task_ref();
        let root = task("root", [Dependency::Task(leaf)], |_meta: &Meta, inputs: Inputs| {
            Ok(inputs.value("leaf")?.as_i64().unwrap_or_default() + 1)
        });
        let ws = Workspace::builder("ws").build().unwrap();
        let node = TaskNode::resolve(root.into_task_ref(), &ws);

        let runner = ProcessRunner::new(unreachable_worker(), MetaRouting::Overlay);
        let out = runner.run(&Meta::new(), &node).unwrap();
        assert_eq!(out.into_value(), json!(21));
    }

    #[test]
    fn leaf_root_runs_in_process() {
        let ws = arithmetic();
        let node = TaskNode::resolve_path("double", &ws).unwrap();

        let runner = ProcessRunner::new(unreachable_worker(), MetaRouting::Overlay);
        let out = runner.run(&Meta::from(json!({ "x": 4 })), &node).unwrap();
        assert_eq!(out.into_value(), json!(8));
    }

    #[test]
    fn unavailable_worker_is_an_invocation_error_for_the_dependency() {
        let ws = arithmetic();
        let node = TaskNode::resolve_path("combo", &ws).unwrap();

        let runner = ProcessRunner::new(unreachable_worker(), MetaRouting::Overlay).with_max_workers(2);
        let err = runner.run(&Meta::from(json!({ "x": 4 })), &node).unwrap_err();
        assert!(["double", "total"].contains(&err.task()));
    }

    #[test]
    fn default_pool_size_follows_available_cores() {
        let runner = ProcessRunner::new(unreachable_worker(), MetaRouting::Shared);
        assert!(runner.max_workers() >= 1);
        assert_eq!(runner.with_max_workers(0).max_workers(), 1);
    }

    #[test]
    fn worker_command_deserializes_with_default_args() {
        let command: WorkerCommand = serde_json::from_value(json!({ "program": "/usr/bin/stem" })).unwrap();
        assert_eq!(command, WorkerCommand::new("/usr/bin/stem"));
    }
}

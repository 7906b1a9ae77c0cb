//! Task runners - 実行戦略
//!
//! A runner executes a resolved [`TaskNode`]: every dependency first (with its
//! own strategy), then the node's own transform, exactly once, with the
//! dependency outputs keyed by task name.
//!
//! # Strategies
//! - [`SequentialRunner`]: one dependency at a time on the caller's thread
//! - [`ThreadRunner`]: siblings on a bounded rayon pool
//! - [`ProcessRunner`]: path-resolved dependencies in worker child processes
//! - [`CooperativeRunner`]: siblings awaited concurrently on one thread
//!
//! Pools and runtimes are created inside `run` and dropped before it returns.

pub mod cooperative;
pub mod process;
pub mod sequential;
pub mod threaded;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{InvocationError, StemError};
use crate::meta::{Meta, MetaRouting};
use crate::task::{Data, Inputs};
use crate::tree::TaskNode;

pub use self::cooperative::CooperativeRunner;
pub use self::process::{ProcessRunner, WorkerCommand};
pub use self::sequential::SequentialRunner;
pub use self::threaded::ThreadRunner;

/// Executes a resolved task node.
///
/// # Panics
/// Every implementation panics when handed a node with dependency errors.
/// Such a node must be caught before execution.
pub trait TaskRunner: Send + Sync {
    fn run(&self, meta: &Meta, node: &TaskNode) -> Result<Data, InvocationError>;

    /// How meta is forwarded to dependencies.
    fn routing(&self) -> MetaRouting {
        MetaRouting::default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    #[default]
    Sequential,
    Threads,
    Processes,
    Cooperative,
}

/// RunnerConfig は runner の構築設定
///
/// # Defaults
/// - kind: sequential
/// - max_workers: strategy default (5 threads / one process per core)
/// - routing: overlay
/// - worker: the current executable with a `worker` argument
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub kind: RunnerKind,
    pub max_workers: Option<usize>,
    pub routing: MetaRouting,
    pub worker: Option<WorkerCommand>,
}

impl RunnerConfig {
    pub fn build(&self) -> Result<Arc<dyn TaskRunner>, StemError> {
        let runner: Arc<dyn TaskRunner> = match self.kind {
            RunnerKind::Sequential => Arc::new(SequentialRunner::new(self.routing)),
            RunnerKind::Threads => Arc::new(
                ThreadRunner::new(self.routing)
                    .with_max_workers(self.max_workers.unwrap_or(threaded::MAX_WORKERS)),
            ),
            RunnerKind::Processes => {
                let command = match &self.worker {
                    Some(command) => command.clone(),
                    None => WorkerCommand::current_exe()?,
                };
                let mut runner = ProcessRunner::new(command, self.routing);
                if let Some(max) = self.max_workers {
                    runner = runner.with_max_workers(max);
                }
                Arc::new(runner)
            }
            RunnerKind::Cooperative => Arc::new(CooperativeRunner::new(self.routing)),
        };
        Ok(runner)
    }
}

pub(crate) fn assert_runnable(node: &TaskNode) {
    assert!(
        !node.has_dependence_errors(),
        "task '{}' has unresolved dependencies and cannot be run",
        node.name()
    );
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        String::from("task panicked with unknown payload")
    }
}

/// Meta for each dependency of `node`, in declaration order.
pub(crate) fn dependency_metas<'a>(
    meta: &'a Meta,
    node: &'a TaskNode,
    routing: MetaRouting,
) -> impl Iterator<Item = (&'a Arc<TaskNode>, Meta)> + 'a {
    node.dependencies()
        .iter()
        .map(move |dep| (dep, meta.for_dependency(&dep.name(), routing)))
}

/// Runs the node's own transform with settings merged in. Errors and panics
/// both become an [`InvocationError`] naming the task.
pub(crate) fn invoke(node: &TaskNode, meta: &Meta, inputs: Inputs) -> Result<Data, InvocationError> {
    let name = node.name();
    let meta = node.effective_meta(meta);

    let span = tracing::debug_span!("task", task = %name, inputs = inputs.len());
    let _enter = span.enter();

    match panic::catch_unwind(AssertUnwindSafe(|| node.task().transform(&meta, inputs))) {
        Ok(Ok(data)) => {
            tracing::debug!("task completed");
            Ok(data)
        }
        Ok(Err(err)) => {
            tracing::debug!(error = %err, "task failed");
            Err(InvocationError::new(name, err))
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::debug!(%message, "task panicked");
            Err(InvocationError::new(name, anyhow!(message)))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Graphs shared by the runner tests.

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::Value;

    use crate::meta::{Meta, MetaType, Specification};
    use crate::task::{Inputs, IntoTaskRef, MapTask, ReduceTask, TaskRef, data, task};
    use crate::tree::TaskNode;
    use crate::workspace::Workspace;

    pub fn int(inputs: &Inputs, name: &str) -> anyhow::Result<i64> {
        inputs
            .value(name)?
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("'{name}' is not an integer"))
    }

    /// double(x) = 2x; total = sum of squares of 1..=n; combo = double + total
    pub fn arithmetic() -> Workspace {
        let double = data("double", |meta: &Meta| {
            let x = meta.get("x").and_then(Value::as_i64).unwrap_or_default();
            Ok(x * 2)
        })
        .with_specification(Specification::new().field("x", MetaType::Integer));

        let numbers = data("numbers", |meta: &Meta| {
            let n = meta.get("n").and_then(Value::as_i64).unwrap_or(3);
            Ok(crate::task::Sequence::new((1..=n).map(Value::from)))
        });
        let squares = MapTask::new(
            |v: Value| Value::from(v.as_i64().unwrap_or_default().pow(2)),
            "numbers",
        );
        let total = ReduceTask::new(
            |a: Value, b: Value| Value::from(a.as_i64().unwrap_or_default() + b.as_i64().unwrap_or_default()),
            "map_numbers",
        );
        let combo = task("combo", ["double", "total"], |_meta: &Meta, inputs: Inputs| {
            Ok(int(&inputs, "double")? + int(&inputs, "total")?)
        });

        Workspace::builder("arith")
            .add(double)
            .add(numbers)
            .add(squares)
            .task("total", total)
            .add(combo)
            .build()
            .expect("static workspace")
    }

    pub fn node(ws: &Workspace, path: &str) -> Arc<TaskNode> {
        TaskNode::resolve_path(path, ws).expect("task exists")
    }

    /// A task counting its own invocations.
    pub fn counting(name: &str, counter: Arc<AtomicUsize>) -> TaskRef {
        data(name.to_string(), move |_meta: &Meta| {
            Ok(counter.fetch_add(1, Ordering::SeqCst) as i64)
        })
        .into_task_ref()
    }

    pub fn failing(name: &str) -> TaskRef {
        data(name.to_string(), |_meta: &Meta| -> anyhow::Result<i64> {
            anyhow::bail!("boom")
        })
        .into_task_ref()
    }

    pub fn panicking(name: &str) -> TaskRef {
        data(name.to_string(), |_meta: &Meta| -> anyhow::Result<i64> {
            panic!("kaboom")
        })
        .into_task_ref()
    }
}

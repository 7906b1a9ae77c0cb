//! TaskMaster - 1 リクエストのオーケストレーション
//!
//! `execute` resolves the node, checks dependency errors, verifies meta and
//! only then hands back a [`TaskResult`] whose value is computed on first
//! access. Resolution and verification failures never reach a runner.
//!
//! # Status
//! - `DEPENDENCIES_ERROR`: the tree has unresolved names or cycles
//! - `META_ERROR`: meta does not satisfy a specification in the tree
//! - `CONTAINS_DATA`: ready (or already realized successfully)
//! - `INVOCATION_ERROR`: realization failed; replayed on every access

use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{InvocationError, SpecificationError, StemError};
use crate::ids::ExecutionId;
use crate::meta::{Meta, MetaRouting, MetaVerification};
use crate::runner::{RunnerConfig, SequentialRunner, TaskRunner};
use crate::task::{Data, IntoTaskRef};
use crate::tree::{DependencyError, TaskNode, TaskTree};
use crate::workspace::{TaskPath, Workspace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    DependenciesError,
    MetaError,
    InvocationError,
    ContainsData,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::DependenciesError => "DEPENDENCIES_ERROR",
            TaskStatus::MetaError => "META_ERROR",
            TaskStatus::InvocationError => "INVOCATION_ERROR",
            TaskStatus::ContainsData => "CONTAINS_DATA",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verification outcome for a task and, recursively, its dependencies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskMetaError {
    pub task: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta_error: Option<MetaVerification>,

    /// Only dependencies that have errors themselves.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies_error: Vec<TaskMetaError>,
}

impl TaskMetaError {
    pub fn has_error(&self) -> bool {
        self.meta_error.as_ref().is_some_and(|v| !v.checked_success())
            || self.dependencies_error.iter().any(TaskMetaError::has_error)
    }

    /// Verifies `node` and everything below it. Each dependency is checked
    /// against the meta it will actually receive.
    pub fn verify(meta: &Meta, node: &TaskNode, routing: MetaRouting) -> Result<Self, SpecificationError> {
        let meta_error = match node.task().specification() {
            Some(spec) => {
                let verification = MetaVerification::verify(&node.effective_meta(meta), spec)?;
                (!verification.checked_success()).then_some(verification)
            }
            None => None,
        };

        let mut dependencies_error = Vec::new();
        for dep in node.dependencies() {
            let sub = Self::verify(&meta.for_dependency(&dep.name(), routing), dep, routing)?;
            if sub.has_error() {
                dependencies_error.push(sub);
            }
        }

        Ok(Self {
            task: node.name(),
            meta_error,
            dependencies_error,
        })
    }
}

/// Why a [`TaskResult`] holds no data.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("unresolved dependencies: {}", join(.0))]
    Dependencies(Vec<DependencyError>),

    #[error("meta does not satisfy the specification of '{}'", .0.task)]
    Meta(TaskMetaError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),
}

fn join(errors: &[DependencyError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl TaskError {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskError::Dependencies(_) => TaskStatus::DependenciesError,
            TaskError::Meta(_) => TaskStatus::MetaError,
            TaskError::Invocation(_) => TaskStatus::InvocationError,
        }
    }
}

type Realize = Box<dyn Fn() -> Result<Data, InvocationError> + Send + Sync>;

enum Outcome {
    Rejected(TaskError),
    Deferred(Realize),
}

/// Outcome of one [`TaskMaster::execute`] call.
///
/// The value is computed on the first [`TaskResult::data`] call and memoized:
/// later calls replay the same value or the same failure without running
/// anything. A memoized [`Data::Seq`] is the same single-pass sequence on
/// every access.
pub struct TaskResult {
    id: ExecutionId,
    node: Arc<TaskNode>,
    outcome: Outcome,
    cache: OnceLock<Result<Data, InvocationError>>,
}

impl TaskResult {
    pub fn id(&self) -> ExecutionId {
        self.id
    }

    pub fn node(&self) -> &Arc<TaskNode> {
        &self.node
    }

    pub fn status(&self) -> TaskStatus {
        match &self.outcome {
            Outcome::Rejected(err) => err.status(),
            Outcome::Deferred(_) => match self.cache.get() {
                Some(Err(_)) => TaskStatus::InvocationError,
                _ => TaskStatus::ContainsData,
            },
        }
    }

    /// The structured error, if the result is known to hold none. An
    /// unrealized result reports no error yet.
    pub fn error(&self) -> Option<TaskError> {
        match &self.outcome {
            Outcome::Rejected(err) => Some(err.clone()),
            Outcome::Deferred(_) => match self.cache.get() {
                Some(Err(err)) => Some(TaskError::Invocation(err.clone())),
                _ => None,
            },
        }
    }

    pub fn is_realized(&self) -> bool {
        self.cache.get().is_some()
    }

    /// Realizes the value on first access.
    pub fn data(&self) -> Result<Data, TaskError> {
        match &self.outcome {
            Outcome::Rejected(err) => Err(err.clone()),
            Outcome::Deferred(realize) => self
                .cache
                .get_or_init(|| realize())
                .clone()
                .map_err(TaskError::Invocation),
        }
    }

    /// [`TaskResult::data`] materialized into a JSON value.
    pub fn value(&self) -> Result<serde_json::Value, TaskError> {
        self.data().map(Data::into_value)
    }
}

impl fmt::Debug for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskResult")
            .field("id", &self.id)
            .field("task", &self.node.name())
            .field("status", &self.status())
            .field("realized", &self.is_realized())
            .finish()
    }
}

/// Orchestrates single requests against a runner.
///
/// # 使用例
/// ```ignore
/// let master = TaskMaster::new().with_runner(ThreadRunner::default());
/// let result = master.execute(&Meta::from(json!({ "x": 5 })), double, &workspace)?;
/// assert_eq!(result.status(), TaskStatus::ContainsData);
/// assert_eq!(result.value()?, json!(10));
/// ```
#[derive(Clone)]
pub struct TaskMaster {
    runner: Arc<dyn TaskRunner>,
    tree: Option<Arc<TaskTree>>,
}

impl Default for TaskMaster {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskMaster {
    /// Sequential runner, no resolution cache.
    pub fn new() -> Self {
        Self {
            runner: Arc::new(SequentialRunner::default()),
            tree: None,
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Result<Self, StemError> {
        Ok(Self::new().with_shared_runner(config.build()?))
    }

    pub fn with_runner(self, runner: impl TaskRunner + 'static) -> Self {
        self.with_shared_runner(Arc::new(runner))
    }

    pub fn with_shared_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Reuse resolved nodes from `tree` whenever it is bound to the workspace
    /// being executed against.
    pub fn with_tree(mut self, tree: Arc<TaskTree>) -> Self {
        self.tree = Some(tree);
        self
    }

    pub fn runner(&self) -> &Arc<dyn TaskRunner> {
        &self.runner
    }

    pub fn execute(
        &self,
        meta: &Meta,
        task: impl IntoTaskRef,
        workspace: &Workspace,
    ) -> Result<TaskResult, SpecificationError> {
        let task = task.into_task_ref();
        let node = match &self.tree {
            Some(tree) if std::ptr::eq(tree.workspace().as_ref(), workspace) => tree.resolve_node(&task),
            _ => TaskNode::resolve(task, workspace),
        };
        self.execute_node(meta, node)
    }

    /// Looks the task up by path first.
    pub fn execute_path(&self, meta: &Meta, path: &str, workspace: &Workspace) -> Result<TaskResult, StemError> {
        let (_, task) = workspace
            .locate(&TaskPath::parse(path))
            .ok_or_else(|| StemError::TaskNotFound(path.to_string(), workspace.name().to_string()))?;
        Ok(self.execute(meta, task, workspace)?)
    }

    /// Checks an already resolved node and defers its execution.
    pub fn execute_node(&self, meta: &Meta, node: Arc<TaskNode>) -> Result<TaskResult, SpecificationError> {
        let id = ExecutionId::new();
        let span = tracing::info_span!("execute", id = %id, task = %node.name());
        let _enter = span.enter();

        let outcome = if node.has_dependence_errors() {
            let errors = node.all_dependency_errors();
            tracing::warn!(errors = errors.len(), "dependency errors");
            Outcome::Rejected(TaskError::Dependencies(errors))
        } else {
            let verification = TaskMetaError::verify(meta, &node, self.runner.routing())?;
            if verification.has_error() {
                tracing::info!("meta verification failed");
                Outcome::Rejected(TaskError::Meta(verification))
            } else {
                let runner = Arc::clone(&self.runner);
                let node = Arc::clone(&node);
                let meta = meta.clone();
                let span = span.clone();
                Outcome::Deferred(Box::new(move || {
                    let _enter = span.enter();
                    tracing::debug!("realizing result");
                    runner.run(&meta, &node)
                }))
            }
        };

        Ok(TaskResult {
            id,
            node,
            outcome,
            cache: OnceLock::new(),
        })
    }
}

impl fmt::Debug for TaskMaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskMaster")
            .field("routing", &self.runner.routing())
            .field("cached", &self.tree.is_some())
            .finish()
    }
}

//! Task tree resolution.
//!
//! Binds a task and its declared dependencies to concrete [`TaskNode`]s within
//! a workspace. Resolution never fails: an unknown name or a cycle is recorded
//! on the node that declared it, and the error state propagates to every
//! ancestor.
//!
//! Design:
//! - Depth-first, with the current path kept on a stack (cycle detection)
//! - Nodes are memoized per resolution, so diamonds share one node
//! - Nodes are immutable once built

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;

use crate::meta::Meta;
use crate::task::{Dependency, TaskRef};
use crate::workspace::{TaskPath, Workspace};

/// Why a dependency could not be bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DependencyError {
    #[error("task '{task}' depends on '{dependency}', which is not in workspace '{workspace}'")]
    NotFound {
        task: String,
        dependency: String,
        workspace: String,
    },

    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}

/// A task bound to its resolved dependencies.
pub struct TaskNode {
    task: TaskRef,
    path: Option<TaskPath>,
    dependencies: Vec<Arc<TaskNode>>,
    errors: Vec<DependencyError>,
    in_error: bool,
}

impl TaskNode {
    /// Resolves `task` against `workspace`.
    pub fn resolve(task: TaskRef, workspace: &Workspace) -> Arc<TaskNode> {
        Resolver::new(workspace).resolve(task, None)
    }

    /// Resolves the task found at `path`. `None` if nothing is there.
    pub fn resolve_path(path: &str, workspace: &Workspace) -> Option<Arc<TaskNode>> {
        let (path, task) = workspace.locate(&TaskPath::parse(path))?;
        Some(Resolver::new(workspace).resolve(task, Some(path)))
    }

    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    pub fn name(&self) -> String {
        self.task.name()
    }

    /// `meta` with the task's settings filled in underneath.
    pub fn effective_meta(&self, meta: &Meta) -> Meta {
        match self.task.settings() {
            Some(settings) => meta.with_defaults(settings),
            None => meta.clone(),
        }
    }

    /// Qualified workspace path; `None` for a task passed by reference.
    pub fn path(&self) -> Option<&TaskPath> {
        self.path.as_ref()
    }

    /// Resolved dependencies, in declaration order.
    pub fn dependencies(&self) -> &[Arc<TaskNode>] {
        &self.dependencies
    }

    /// Errors recorded on this node itself.
    pub fn errors(&self) -> &[DependencyError] {
        &self.errors
    }

    /// `true` if this node or any node below it failed to resolve.
    pub fn has_dependence_errors(&self) -> bool {
        self.in_error
    }

    /// Every error in the tree, each node visited once.
    pub fn all_dependency_errors(&self) -> Vec<DependencyError> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        self.collect_errors(&mut seen, &mut out);
        out
    }

    fn collect_errors(&self, seen: &mut HashSet<*const TaskNode>, out: &mut Vec<DependencyError>) {
        if !self.in_error || !seen.insert(self as *const TaskNode) {
            return;
        }
        out.extend(self.errors.iter().cloned());
        for dep in &self.dependencies {
            dep.collect_errors(seen, out);
        }
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("task", &self.task.name())
            .field("path", &self.path)
            .field("dependencies", &self.dependencies)
            .field("errors", &self.errors)
            .finish()
    }
}

fn task_key(task: &TaskRef) -> usize {
    Arc::as_ptr(task) as *const () as usize
}

type NodeKey = (usize, Option<TaskPath>);

struct Resolver<'a> {
    workspace: &'a Workspace,
    stack: Vec<(usize, String)>,
    memo: HashMap<NodeKey, Arc<TaskNode>>,
}

impl<'a> Resolver<'a> {
    fn new(workspace: &'a Workspace) -> Self {
        Self {
            workspace,
            stack: Vec::new(),
            memo: HashMap::new(),
        }
    }

    fn resolve(&mut self, task: TaskRef, path: Option<TaskPath>) -> Arc<TaskNode> {
        let key = (task_key(&task), path);
        if let Some(node) = self.memo.get(&key) {
            return Arc::clone(node);
        }

        let name = task.name();
        self.stack.push((key.0, name.clone()));

        let mut dependencies = Vec::new();
        let mut errors = Vec::new();
        for dependency in task.dependencies() {
            let (dep_task, dep_path) = match dependency {
                Dependency::Task(dep) => (Arc::clone(dep), None),
                Dependency::Name(dep_name) => match self.workspace.locate(&TaskPath::parse(dep_name)) {
                    Some((path, dep)) => (dep, Some(path)),
                    None => {
                        tracing::warn!(
                            task = %name,
                            dependency = %dep_name,
                            workspace = self.workspace.name(),
                            "dependency not found"
                        );
                        errors.push(DependencyError::NotFound {
                            task: name.clone(),
                            dependency: dep_name.clone(),
                            workspace: self.workspace.name().to_string(),
                        });
                        continue;
                    }
                },
            };

            let dep_key = task_key(&dep_task);
            if let Some(start) = self.stack.iter().position(|(k, _)| *k == dep_key) {
                let mut path: Vec<String> = self.stack[start..].iter().map(|(_, n)| n.clone()).collect();
                path.push(dep_task.name());
                tracing::warn!(cycle = %path.join(" -> "), "dependency cycle");
                errors.push(DependencyError::Cycle { path });
                continue;
            }

            dependencies.push(self.resolve(dep_task, dep_path));
        }

        self.stack.pop();

        let in_error = !errors.is_empty() || dependencies.iter().any(|d| d.has_dependence_errors());
        let node = Arc::new(TaskNode {
            task,
            path: key.1.clone(),
            dependencies,
            errors,
            in_error,
        });
        self.memo.insert(key, Arc::clone(&node));
        node
    }
}

/// Resolution cache bound to one workspace.
///
/// Nodes are immutable, so a cached node can be handed to any number of
/// concurrent executions.
pub struct TaskTree {
    workspace: Arc<Workspace>,
    nodes: Mutex<HashMap<usize, Arc<TaskNode>>>,
}

impl TaskTree {
    pub fn new(workspace: impl Into<Arc<Workspace>>) -> Self {
        Self {
            workspace: workspace.into(),
            nodes: Mutex::new(HashMap::new()),
        }
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    /// Cached node for `task`, resolving it on first request.
    pub fn resolve_node(&self, task: &TaskRef) -> Arc<TaskNode> {
        let key = task_key(task);
        let mut nodes = self.nodes.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            nodes
                .entry(key)
                .or_insert_with(|| TaskNode::resolve(Arc::clone(task), &self.workspace)),
        )
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

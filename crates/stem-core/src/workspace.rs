//! Workspace - task の名前空間
//!
//! A workspace is a named registry of tasks and nested sub-workspaces. It is
//! built once through [`WorkspaceBuilder`] and read-only afterwards, so it can
//! be shared freely between runners and threads.
//!
//! # Lookup
//! - `"text.shout"`: descend into sub-workspace `text`, then look up `shout`
//! - `"shout"`: own tasks first, then breadth-first through sub-workspaces

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::meta::{Meta, Specification};
use crate::task::{Data, Dependency, Inputs, IntoTaskRef, Task, TaskRef};

/// Dot-separated location of a task inside a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskPath {
    segments: Vec<String>,
}

impl TaskPath {
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_leaf(&self) -> bool {
        self.segments.len() == 1
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// First segment.
    pub fn head(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Everything after the first segment.
    pub fn sub_path(&self) -> TaskPath {
        Self {
            segments: self.segments.iter().skip(1).cloned().collect(),
        }
    }

    /// Last segment.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    fn prefixed(mut self, prefix: &[String]) -> Self {
        let mut segments = prefix.to_vec();
        segments.append(&mut self.segments);
        Self { segments }
    }
}

impl fmt::Display for TaskPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

impl From<&str> for TaskPath {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

/// A task registered under an alias different from its own name.
pub struct ProxyTask {
    name: String,
    task: TaskRef,
}

impl ProxyTask {
    pub fn new(name: impl Into<String>, task: TaskRef) -> Self {
        Self {
            name: name.into(),
            task,
        }
    }

    pub fn inner(&self) -> &TaskRef {
        &self.task
    }
}

#[async_trait]
impl Task for ProxyTask {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn dependencies(&self) -> &[Dependency] {
        self.task.dependencies()
    }

    fn specification(&self) -> Option<&Specification> {
        self.task.specification()
    }

    fn settings(&self) -> Option<&Meta> {
        self.task.settings()
    }

    fn transform(&self, meta: &Meta, inputs: Inputs) -> anyhow::Result<Data> {
        self.task.transform(meta, inputs)
    }

    async fn transform_async(&self, meta: &Meta, inputs: Inputs) -> anyhow::Result<Data> {
        self.task.transform_async(meta, inputs).await
    }
}

/// WorkspaceError は build() 時の検証エラー
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkspaceError {
    #[error("task '{task}' is already registered in workspace '{workspace}'")]
    DuplicateTask { workspace: String, task: String },

    #[error("sub-workspace '{name}' is already registered in workspace '{workspace}'")]
    DuplicateWorkspace { workspace: String, name: String },
}

/// Named registry of tasks and sub-workspaces.
///
/// # 使用例
/// ```ignore
/// let text = Workspace::builder("text").add(shout).add(greet).build()?;
/// let ws = Workspace::builder("demo")
///     .add(double)
///     .task("sum", total)
///     .workspace(text)
///     .build()?;
///
/// assert!(ws.find_task("text.shout").is_some());
/// assert!(ws.find_task("greet").is_some()); // breadth-first fallback
/// ```
pub struct Workspace {
    name: String,
    tasks: BTreeMap<String, TaskRef>,
    workspaces: Vec<Arc<Workspace>>,
}

impl Workspace {
    pub fn builder(name: impl Into<String>) -> WorkspaceBuilder {
        WorkspaceBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tasks(&self) -> &BTreeMap<String, TaskRef> {
        &self.tasks
    }

    /// Sub-workspaces in registration order.
    pub fn workspaces(&self) -> &[Arc<Workspace>] {
        &self.workspaces
    }

    pub fn get_workspace(&self, name: &str) -> Option<&Arc<Workspace>> {
        self.workspaces.iter().find(|ws| ws.name == name)
    }

    pub fn find_task(&self, path: &str) -> Option<TaskRef> {
        self.locate(&TaskPath::parse(path)).map(|(_, task)| task)
    }

    pub fn has_task(&self, path: &str) -> bool {
        self.find_task(path).is_some()
    }

    /// Resolves `path` and returns the task together with its fully qualified
    /// path relative to this workspace.
    pub fn locate(&self, path: &TaskPath) -> Option<(TaskPath, TaskRef)> {
        if path.is_leaf() {
            return self.locate_leaf(path.head()?);
        }
        let sub = self.get_workspace(path.head()?)?;
        let (found, task) = sub.locate(&path.sub_path())?;
        Some((found.prefixed(&[sub.name.clone()]), task))
    }

    fn locate_leaf(&self, name: &str) -> Option<(TaskPath, TaskRef)> {
        if let Some(task) = self.tasks.get(name) {
            return Some((TaskPath::parse(name), Arc::clone(task)));
        }

        // level by level: every sibling's own tasks before any grandchild
        let mut queue: VecDeque<(Vec<String>, &Workspace)> = self
            .workspaces
            .iter()
            .map(|ws| (vec![ws.name.clone()], ws.as_ref()))
            .collect();
        while let Some((prefix, ws)) = queue.pop_front() {
            if let Some(task) = ws.tasks.get(name) {
                return Some((TaskPath::parse(name).prefixed(&prefix), Arc::clone(task)));
            }
            for sub in &ws.workspaces {
                let mut next = prefix.clone();
                next.push(sub.name.clone());
                queue.push_back((next, sub.as_ref()));
            }
        }
        None
    }

    /// Names of everything registered, recursively.
    pub fn structure(&self) -> WorkspaceStructure {
        WorkspaceStructure {
            name: self.name.clone(),
            tasks: self.tasks.keys().cloned().collect(),
            workspaces: self.workspaces.iter().map(|ws| ws.structure()).collect(),
        }
    }
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("name", &self.name)
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .field("workspaces", &self.workspaces)
            .finish()
    }
}

/// Serializable outline of a [`Workspace`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkspaceStructure {
    pub name: String,
    pub tasks: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub workspaces: Vec<WorkspaceStructure>,
}

/// WorkspaceBuilder は Workspace を構築
///
/// # Fail-fast 設計
/// - 登録は記録するだけで失敗しない
/// - build() 時に重複した task 名 / sub-workspace 名を検出して返す
pub struct WorkspaceBuilder {
    name: String,
    tasks: BTreeMap<String, TaskRef>,
    workspaces: Vec<Arc<Workspace>>,
    conflicts: Vec<WorkspaceError>,
}

impl WorkspaceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: BTreeMap::new(),
            workspaces: Vec::new(),
            conflicts: Vec::new(),
        }
    }

    /// Registers `task` under `alias`. A differing alias wraps the task in a
    /// [`ProxyTask`] so the task reports the alias as its name.
    pub fn task(mut self, alias: impl Into<String>, task: impl IntoTaskRef) -> Self {
        let alias = alias.into();
        let task = task.into_task_ref();
        let task = if task.name() == alias {
            task
        } else {
            Arc::new(ProxyTask::new(alias.clone(), task)) as TaskRef
        };

        if self.tasks.contains_key(&alias) {
            self.conflicts.push(WorkspaceError::DuplicateTask {
                workspace: self.name.clone(),
                task: alias,
            });
        } else {
            self.tasks.insert(alias, task);
        }
        self
    }

    /// Registers `task` under its own name.
    pub fn add(self, task: impl IntoTaskRef) -> Self {
        let task = task.into_task_ref();
        let name = task.name();
        self.task(name, task)
    }

    pub fn workspace(mut self, workspace: impl Into<Arc<Workspace>>) -> Self {
        let workspace = workspace.into();
        if self.workspaces.iter().any(|ws| ws.name == workspace.name) {
            self.conflicts.push(WorkspaceError::DuplicateWorkspace {
                workspace: self.name.clone(),
                name: workspace.name.clone(),
            });
        } else {
            self.workspaces.push(workspace);
        }
        self
    }

    pub fn build(mut self) -> Result<Workspace, WorkspaceError> {
        if !self.conflicts.is_empty() {
            return Err(self.conflicts.remove(0));
        }
        Ok(Workspace {
            name: self.name,
            tasks: self.tasks,
            workspaces: self.workspaces,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::data;
    use serde_json::json;

    fn constant(name: &str, value: i64) -> TaskRef {
        data(name.to_string(), move |_meta: &Meta| Ok(value)).into_task_ref()
    }

    fn nested() -> Workspace {
        let deep = Workspace::builder("deep")
            .add(constant("shared", 3))
            .add(constant("bottom", 4))
            .build()
            .unwrap();
        let left = Workspace::builder("left")
            .add(constant("only_left", 1))
            .workspace(deep)
            .build()
            .unwrap();
        let right = Workspace::builder("right")
            .add(constant("shared", 2))
            .build()
            .unwrap();
        Workspace::builder("root")
            .add(constant("top", 0))
            .workspace(left)
            .workspace(right)
            .build()
            .unwrap()
    }

    fn value_of(task: &TaskRef) -> serde_json::Value {
        task.transform(&Meta::new(), Inputs::new()).unwrap().into_value()
    }

    #[test]
    fn task_path_parsing() {
        let path = TaskPath::parse("text.shout");
        assert!(!path.is_leaf());
        assert_eq!(path.head(), Some("text"));
        assert_eq!(path.sub_path(), TaskPath::parse("shout"));
        assert_eq!(path.name(), Some("shout"));
        assert_eq!(path.to_string(), "text.shout");
        assert!(TaskPath::parse("").is_empty());
    }

    #[test]
    fn qualified_paths_descend_into_sub_workspaces() {
        let ws = nested();
        let (path, task) = ws.locate(&"left.deep.bottom".into()).unwrap();
        assert_eq!(path.to_string(), "left.deep.bottom");
        assert_eq!(value_of(&task), json!(4));

        assert!(ws.find_task("right.bottom").is_none());
        assert!(ws.find_task("nowhere.top").is_none());
    }

    #[test]
    fn leaf_lookup_is_breadth_first() {
        let ws = nested();

        // right.shared sits one level above left.deep.shared
        let (path, task) = ws.locate(&"shared".into()).unwrap();
        assert_eq!(path.to_string(), "right.shared");
        assert_eq!(value_of(&task), json!(2));

        let (path, _) = ws.locate(&"bottom".into()).unwrap();
        assert_eq!(path.to_string(), "left.deep.bottom");

        assert!(ws.has_task("top"));
        assert!(!ws.has_task("missing"));
    }

    #[test]
    fn alias_wraps_task_in_proxy() {
        let ws = Workspace::builder("ws")
            .task("answer", constant("forty_two", 42))
            .build()
            .unwrap();

        let task = ws.find_task("answer").unwrap();
        assert_eq!(task.name(), "answer");
        assert_eq!(value_of(&task), json!(42));
    }

    #[test]
    fn duplicates_are_rejected_at_build() {
        let err = Workspace::builder("ws")
            .add(constant("a", 1))
            .add(constant("a", 2))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            WorkspaceError::DuplicateTask {
                workspace: "ws".into(),
                task: "a".into()
            }
        );

        let sub = || Workspace::builder("sub").build().unwrap();
        let err = Workspace::builder("ws")
            .workspace(sub())
            .workspace(sub())
            .build()
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::DuplicateWorkspace { name, .. } if name == "sub"));
    }

    #[test]
    fn structure_lists_names_recursively() {
        let structure = serde_json::to_value(nested().structure()).unwrap();
        assert_eq!(
            structure,
            json!({
                "name": "root",
                "tasks": ["top"],
                "workspaces": [
                    {
                        "name": "left",
                        "tasks": ["only_left"],
                        "workspaces": [{ "name": "deep", "tasks": ["bottom", "shared"] }]
                    },
                    { "name": "right", "tasks": ["shared"] }
                ]
            })
        );
    }
}

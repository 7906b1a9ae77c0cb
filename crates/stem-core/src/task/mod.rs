//! Task - 計算単位の定義
//!
//! A task is an immutable value object: a name, the names (or direct
//! references) of the tasks it depends on, an optional specification, optional
//! settings and a `transform` that turns meta plus dependency outputs into
//! [`Data`].
//!
//! # Variants
//! - [`FunctionTask`]: closure over meta and dependency outputs
//! - [`DataTask`]: closure over meta only, no dependencies
//! - [`AsyncFunctionTask`]: closure returning a future
//! - [`MapTask`] / [`FilterTask`] / [`ReduceTask`]: derived from one upstream
//!   sequence

pub mod function;
pub mod sequence;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;

use crate::meta::{Meta, Specification};

pub use self::function::{AsyncFunctionTask, DataTask, FunctionTask, data, task};
pub use self::sequence::{FilterTask, MapTask, ReduceTask};

/// Shared, type-erased task.
pub type TaskRef = Arc<dyn Task>;

/// A named unit of computation.
///
/// # 使用例
/// ```ignore
/// struct LoadNumbers;
///
/// impl Task for LoadNumbers {
///     fn transform(&self, meta: &Meta, _inputs: Inputs) -> anyhow::Result<Data> {
///         let n = meta.get("n").and_then(Value::as_i64).unwrap_or(3);
///         Ok(Sequence::new((1..=n).map(Value::from)).into())
///     }
/// }
///
/// assert_eq!(LoadNumbers.name(), "load_numbers");
/// ```
#[async_trait]
pub trait Task: Send + Sync {
    /// Defaults to the snake_case form of the implementing type's name.
    fn name(&self) -> String {
        default_task_name(std::any::type_name::<Self>())
    }

    fn dependencies(&self) -> &[Dependency] {
        &[]
    }

    fn specification(&self) -> Option<&Specification> {
        None
    }

    /// Static meta merged under the caller's meta at invocation.
    fn settings(&self) -> Option<&Meta> {
        None
    }

    /// Computes this task's output. `inputs` holds one entry per dependency,
    /// keyed by the dependency's task name.
    fn transform(&self, meta: &Meta, inputs: Inputs) -> anyhow::Result<Data>;

    /// Cooperative variant of [`Task::transform`], awaited by the cooperative
    /// runner.
    async fn transform_async(&self, meta: &Meta, inputs: Inputs) -> anyhow::Result<Data> {
        self.transform(meta, inputs)
    }
}

/// `PascalCase` type path → `snake_case` task name.
pub(crate) fn default_task_name(type_name: &str) -> String {
    let base = type_name.split('<').next().unwrap_or(type_name);
    let ident = base.rsplit("::").next().unwrap_or(base);

    let mut name = String::with_capacity(ident.len() + 4);
    for (i, ch) in ident.chars().enumerate() {
        if ch.is_uppercase() {
            if i != 0 {
                name.push('_');
            }
            name.extend(ch.to_lowercase());
        } else {
            name.push(ch);
        }
    }
    name
}

/// Anything that can be stored as a [`TaskRef`].
pub trait IntoTaskRef {
    fn into_task_ref(self) -> TaskRef;
}

impl<T: Task + 'static> IntoTaskRef for T {
    fn into_task_ref(self) -> TaskRef {
        Arc::new(self)
    }
}

impl IntoTaskRef for TaskRef {
    fn into_task_ref(self) -> TaskRef {
        self
    }
}

/// A declared dependency: a workspace path, or a task used as-is.
#[derive(Clone)]
pub enum Dependency {
    Name(String),
    Task(TaskRef),
}

impl Dependency {
    pub fn task(task: impl IntoTaskRef) -> Self {
        Dependency::Task(task.into_task_ref())
    }

    pub fn name(&self) -> String {
        match self {
            Dependency::Name(name) => name.clone(),
            Dependency::Task(task) => task.name(),
        }
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::Name(name) => f.debug_tuple("Name").field(name).finish(),
            Dependency::Task(task) => f.debug_tuple("Task").field(&task.name()).finish(),
        }
    }
}

impl From<&str> for Dependency {
    fn from(name: &str) -> Self {
        Dependency::Name(name.to_string())
    }
}

impl From<String> for Dependency {
    fn from(name: String) -> Self {
        Dependency::Name(name)
    }
}

impl From<TaskRef> for Dependency {
    fn from(task: TaskRef) -> Self {
        Dependency::Task(task)
    }
}

/// Lazy, single-pass sequence of values.
///
/// Clones share one cursor: once an element has been pulled through any
/// clone, no clone yields it again.
#[derive(Clone)]
pub struct Sequence {
    inner: Arc<Mutex<Box<dyn Iterator<Item = Value> + Send>>>,
}

impl Sequence {
    pub fn new<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::new(items.into_iter()))),
        }
    }
}

impl Iterator for Sequence {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next()
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Sequence(..)")
    }
}

/// Output of a task.
#[derive(Debug, Clone)]
pub enum Data {
    Value(Value),
    Seq(Sequence),
}

impl Data {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Data::Value(value) => Some(value),
            Data::Seq(_) => None,
        }
    }

    /// Materializes the output. A sequence is drained into an array.
    pub fn into_value(self) -> Value {
        match self {
            Data::Value(value) => value,
            Data::Seq(seq) => Value::Array(seq.collect()),
        }
    }

    /// The output as a sequence; arrays are accepted as well.
    pub fn into_sequence(self) -> anyhow::Result<Sequence> {
        match self {
            Data::Seq(seq) => Ok(seq),
            Data::Value(Value::Array(items)) => Ok(Sequence::new(items)),
            Data::Value(other) => bail!("expected a sequence, found {}", crate::meta::MetaType::of(&other)),
        }
    }
}

impl From<Value> for Data {
    fn from(value: Value) -> Self {
        Data::Value(value)
    }
}

impl From<Sequence> for Data {
    fn from(seq: Sequence) -> Self {
        Data::Seq(seq)
    }
}

impl From<Vec<Value>> for Data {
    fn from(items: Vec<Value>) -> Self {
        Data::Value(Value::Array(items))
    }
}

impl From<i64> for Data {
    fn from(n: i64) -> Self {
        Data::Value(n.into())
    }
}

impl From<f64> for Data {
    fn from(n: f64) -> Self {
        Data::Value(n.into())
    }
}

impl From<bool> for Data {
    fn from(b: bool) -> Self {
        Data::Value(b.into())
    }
}

impl From<String> for Data {
    fn from(s: String) -> Self {
        Data::Value(s.into())
    }
}

impl From<&str> for Data {
    fn from(s: &str) -> Self {
        Data::Value(s.into())
    }
}

/// Dependency outputs handed to [`Task::transform`], in declaration order.
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    entries: Vec<(String, Data)>,
}

impl Inputs {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn insert(&mut self, name: impl Into<String>, data: Data) {
        self.entries.push((name.into(), data));
    }

    pub fn get(&self, name: &str) -> Option<&Data> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    /// The named output as a plain value.
    pub fn value(&self, name: &str) -> anyhow::Result<&Value> {
        match self.get(name) {
            Some(Data::Value(value)) => Ok(value),
            Some(Data::Seq(_)) => bail!("dependency '{name}' produced a sequence, not a value"),
            None => bail!("no output for dependency '{name}'"),
        }
    }

    pub fn take(&mut self, name: &str) -> Option<Data> {
        let index = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(index).1)
    }

    /// The single output of a one-dependency task.
    pub fn into_only(self) -> anyhow::Result<Data> {
        let mut entries = self.entries;
        match entries.len() {
            1 => Ok(entries.remove(0).1),
            n => Err(anyhow!("expected exactly one dependency output, found {n}")),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, Data)> for Inputs {
    fn from_iter<I: IntoIterator<Item = (String, Data)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct LoadNumbers;

    impl Task for LoadNumbers {
        fn transform(&self, _meta: &Meta, _inputs: Inputs) -> anyhow::Result<Data> {
            Ok(json!([1, 2, 3]).into())
        }
    }

    #[test]
    fn default_name_is_snake_cased_type_name() {
        assert_eq!(LoadNumbers.name(), "load_numbers");
        assert_eq!(default_task_name("my_crate::tasks::HTTPFetch"), "h_t_t_p_fetch");
        assert_eq!(default_task_name("Wrapper<u8>"), "wrapper");
        assert_eq!(default_task_name("already_snake"), "already_snake");
    }

    #[test]
    fn sequence_is_single_pass_across_clones() {
        let seq = Sequence::new(vec![json!(1), json!(2), json!(3)]);
        let mut other = seq.clone();

        assert_eq!(other.next(), Some(json!(1)));
        let rest: Vec<Value> = seq.collect();
        assert_eq!(rest, vec![json!(2), json!(3)]);
        assert_eq!(other.next(), None);
    }

    #[test]
    fn arrays_are_accepted_as_sequences() {
        let seq = Data::from(json!([1, 2])).into_sequence().unwrap();
        assert_eq!(seq.collect::<Vec<_>>(), vec![json!(1), json!(2)]);

        assert!(Data::from(json!(1)).into_sequence().is_err());
    }

    #[test]
    fn inputs_keep_declaration_order() {
        let mut inputs = Inputs::new();
        inputs.insert("b", Data::from(2_i64));
        inputs.insert("a", Data::from(1_i64));

        assert_eq!(inputs.names().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(inputs.value("a").unwrap(), &json!(1));
        assert!(inputs.value("missing").is_err());
    }

    #[test]
    fn into_only_requires_exactly_one_output() {
        let inputs: Inputs = vec![("a".to_string(), Data::from(1_i64))].into_iter().collect();
        assert_eq!(inputs.into_only().unwrap().into_value(), json!(1));

        assert!(Inputs::new().into_only().is_err());
    }

    #[test]
    fn dependency_names() {
        assert_eq!(Dependency::from("sub.numbers").name(), "sub.numbers");
        assert_eq!(Dependency::task(LoadNumbers).name(), "load_numbers");
    }
}

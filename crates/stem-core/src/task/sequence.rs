//! Tasks derived from a single upstream sequence.
//!
//! The upstream output may be a [`Sequence`] or a JSON array. Map and filter
//! stay lazy and single-pass; reduce folds the whole sequence into one value.

use std::sync::Arc;

use anyhow::{Context, anyhow};
use serde_json::Value;

use super::{Data, Dependency, Inputs, Sequence, Task};
use crate::meta::Meta;

type MapFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;
type FilterFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
type ReduceFn = Arc<dyn Fn(Value, Value) -> Value + Send + Sync>;

fn upstream_sequence(task: &str, inputs: Inputs) -> anyhow::Result<Sequence> {
    inputs
        .into_only()
        .and_then(Data::into_sequence)
        .with_context(|| format!("{task}: upstream did not produce a sequence"))
}

/// Applies `func` to every element of the upstream sequence.
pub struct MapTask {
    name: String,
    func: MapFn,
    dependencies: [Dependency; 1],
}

impl MapTask {
    /// Named `map_<upstream>`.
    pub fn new<F>(func: F, upstream: impl Into<Dependency>) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        let upstream = upstream.into();
        Self {
            name: format!("map_{}", upstream.name()),
            func: Arc::new(func),
            dependencies: [upstream],
        }
    }
}

impl Task for MapTask {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    fn transform(&self, _meta: &Meta, inputs: Inputs) -> anyhow::Result<Data> {
        let upstream = upstream_sequence(&self.name, inputs)?;
        let func = Arc::clone(&self.func);
        Ok(Sequence::new(upstream.map(move |item| func(item))).into())
    }
}

/// Keeps the upstream elements for which `predicate` holds.
pub struct FilterTask {
    name: String,
    predicate: FilterFn,
    dependencies: [Dependency; 1],
}

impl FilterTask {
    /// Named `filter_<upstream>`.
    pub fn new<F>(predicate: F, upstream: impl Into<Dependency>) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        let upstream = upstream.into();
        Self {
            name: format!("filter_{}", upstream.name()),
            predicate: Arc::new(predicate),
            dependencies: [upstream],
        }
    }
}

impl Task for FilterTask {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    fn transform(&self, _meta: &Meta, inputs: Inputs) -> anyhow::Result<Data> {
        let upstream = upstream_sequence(&self.name, inputs)?;
        let predicate = Arc::clone(&self.predicate);
        Ok(Sequence::new(upstream.filter(move |item| predicate(item))).into())
    }
}

/// Folds the upstream sequence pairwise with `func`.
pub struct ReduceTask {
    name: String,
    func: ReduceFn,
    dependencies: [Dependency; 1],
}

impl ReduceTask {
    /// Named `reduce_<upstream>`.
    pub fn new<F>(func: F, upstream: impl Into<Dependency>) -> Self
    where
        F: Fn(Value, Value) -> Value + Send + Sync + 'static,
    {
        let upstream = upstream.into();
        Self {
            name: format!("reduce_{}", upstream.name()),
            func: Arc::new(func),
            dependencies: [upstream],
        }
    }
}

impl Task for ReduceTask {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    fn transform(&self, _meta: &Meta, inputs: Inputs) -> anyhow::Result<Data> {
        let upstream = upstream_sequence(&self.name, inputs)?;
        upstream
            .reduce(|acc, item| (self.func)(acc, item))
            .map(Data::Value)
            .ok_or_else(|| anyhow!("{}: reduce of an empty sequence", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn one_input(name: &str, data: Data) -> Inputs {
        vec![(name.to_string(), data)].into_iter().collect()
    }

    fn square(v: Value) -> Value {
        let n = v.as_i64().unwrap_or_default();
        json!(n * n)
    }

    fn add(a: Value, b: Value) -> Value {
        json!(a.as_i64().unwrap_or_default() + b.as_i64().unwrap_or_default())
    }

    #[test]
    fn derived_names_use_the_upstream_name() {
        assert_eq!(MapTask::new(square, "numbers").name(), "map_numbers");
        assert_eq!(FilterTask::new(|_: &Value| true, "numbers").name(), "filter_numbers");
        assert_eq!(ReduceTask::new(add, "numbers").name(), "reduce_numbers");
    }

    #[test]
    fn map_is_lazy_and_single_pass() {
        let task = MapTask::new(square, "numbers");
        let input = Sequence::new(vec![json!(1), json!(2), json!(3)]);

        let Data::Seq(mut out) = task.transform(&Meta::new(), one_input("numbers", input.into())).unwrap() else {
            panic!("map must produce a sequence");
        };

        assert_eq!(out.next(), Some(json!(1)));
        assert_eq!(out.next(), Some(json!(4)));
        assert_eq!(out.next(), Some(json!(9)));
        assert_eq!(out.next(), None);
        // no restart
        assert_eq!(out.next(), None);
    }

    #[test]
    fn filter_keeps_matching_elements() {
        let task = FilterTask::new(|v: &Value| v.as_i64().is_some_and(|n| n % 2 == 0), "numbers");
        let out = task
            .transform(&Meta::new(), one_input("numbers", json!([1, 2, 3, 4]).into()))
            .unwrap();
        assert_eq!(out.into_value(), json!([2, 4]));
    }

    #[test]
    fn reduce_folds_into_one_value() {
        let task = ReduceTask::new(add, "numbers");
        let out = task
            .transform(&Meta::new(), one_input("numbers", json!([1, 2, 3]).into()))
            .unwrap();
        assert_eq!(out.into_value(), json!(6));
    }

    #[test]
    fn reduce_of_empty_sequence_fails() {
        let task = ReduceTask::new(add, "numbers");
        let err = task
            .transform(&Meta::new(), one_input("numbers", json!([]).into()))
            .unwrap_err();
        assert!(err.to_string().contains("empty sequence"));
    }

    #[test]
    fn non_sequence_upstream_fails() {
        let task = MapTask::new(square, "numbers");
        let err = task
            .transform(&Meta::new(), one_input("numbers", json!(5).into()))
            .unwrap_err();
        assert!(err.to_string().contains("map_numbers"));
    }
}

//! Sibling dependencies on a bounded rayon pool.

use rayon::prelude::*;

use super::{TaskRunner, assert_runnable, dependency_metas, invoke};
use crate::error::InvocationError;
use crate::meta::{Meta, MetaRouting};
use crate::task::{Data, Inputs};
use crate::tree::TaskNode;

pub const MAX_WORKERS: usize = 5;

/// Runs sibling dependencies concurrently on a pool of at most `max_workers`
/// threads. The pool lives for a single `run` call.
#[derive(Debug, Clone, Copy)]
pub struct ThreadRunner {
    max_workers: usize,
    routing: MetaRouting,
}

impl Default for ThreadRunner {
    fn default() -> Self {
        Self::new(MetaRouting::default())
    }
}

impl ThreadRunner {
    pub fn new(routing: MetaRouting) -> Self {
        Self {
            max_workers: MAX_WORKERS,
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

    fn run_in_pool(&self, meta: &Meta, node: &TaskNode) -> Result<Data, InvocationError> {
        let outputs = dependency_metas(meta, node, self.routing)
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|(dep, dep_meta)| -> Result<(String, Data), InvocationError> {
                Ok((dep.name(), self.run_in_pool(&dep_meta, dep)?))
            })
            .collect::<Result<Vec<_>, _>>()?;

        invoke(node, meta, outputs.into_iter().collect::<Inputs>())
    }
}

impl TaskRunner for ThreadRunner {
    fn run(&self, meta: &Meta, node: &TaskNode) -> Result<Data, InvocationError> {
        assert_runnable(node);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.max_workers)
            .thread_name(|i| format!("stem-worker-{i}"))
            .build()
            .map_err(|err| InvocationError::new(node.name(), err))?;
        tracing::debug!(workers = self.max_workers, task = %node.name(), "thread pool started");

        pool.install(|| self.run_in_pool(meta, node))
    }

    fn routing(&self) -> MetaRouting {
        self.routing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::SequentialRunner;
    use crate::runner::testing::{arithmetic, counting, failing, node, panicking};
    use crate::task::task;
    use crate::workspace::Workspace;
    use rstest::rstest;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[rstest]
    #[case::double("double", json!(10))]
    #[case::total("total", json!(14))]
    #[case::combo("combo", json!(24))]
    fn agrees_with_sequential(#[case] path: &str, #[case] expected: serde_json::Value) {
        let ws = arithmetic();
        let meta = Meta::from(json!({ "x": 5 }));

        let threaded = ThreadRunner::default().run(&meta, &node(&ws, path)).unwrap();
        let sequential = SequentialRunner::default().run(&meta, &node(&ws, path)).unwrap();
        assert_eq!(threaded.into_value(), expected);
        assert_eq!(sequential.into_value(), expected);
    }

    #[test]
    fn siblings_run_concurrently() {
        let sleepy = |name: &'static str| {
            crate::task::data(name, |_meta: &Meta| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(1_i64)
            })
        };
        let all = task("all", ["s1", "s2", "s3"], |_meta: &Meta, inputs: Inputs| Ok(inputs.len() as i64));
        let ws = Workspace::builder("ws")
            .add(sleepy("s1"))
            .add(sleepy("s2"))
            .add(sleepy("s3"))
            .add(all)
            .build()
            .unwrap();

        let started = Instant::now();
        let out = ThreadRunner::default().run(&Meta::new(), &node(&ws, "all")).unwrap();
        assert_eq!(out.into_value(), json!(3));
        assert!(started.elapsed() < Duration::from_millis(550));
    }

    #[test]
    fn parent_runs_once_after_its_dependencies() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let seen_in_parent = Arc::clone(&seen);
        let calls_in_parent = Arc::clone(&calls);

        let parent = task("parent", ["leaf"], move |_meta: &Meta, _inputs: Inputs| {
            seen_in_parent.store(calls_in_parent.load(Ordering::SeqCst), Ordering::SeqCst);
            Ok(0_i64)
        });
        let ws = Workspace::builder("ws")
            .task("leaf", counting("leaf", Arc::clone(&calls)))
            .add(parent)
            .build()
            .unwrap();

        ThreadRunner::default().run(&Meta::new(), &node(&ws, "parent")).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[case::error(failing("bad"), "boom")]
    #[case::panic(panicking("bad"), "kaboom")]
    fn failures_surface_as_invocation_errors(#[case] bad: crate::task::TaskRef, #[case] message: &str) {
        let parent = task("parent", ["bad"], |_meta: &Meta, _inputs: Inputs| Ok(0_i64));
        let ws = Workspace::builder("ws").task("bad", bad).add(parent).build().unwrap();

        let err = ThreadRunner::default()
            .with_max_workers(2)
            .run(&Meta::new(), &node(&ws, "parent"))
            .unwrap_err();
        assert_eq!(err.task(), "bad");
        assert!(err.to_string().contains(message));
    }

    #[test]
    fn worker_count_is_at_least_one() {
        assert_eq!(ThreadRunner::default().with_max_workers(0).max_workers(), 1);
        assert_eq!(ThreadRunner::default().max_workers(), MAX_WORKERS);
    }
}

//! Cooperative execution on a single-threaded tokio runtime.
//!
//! Sibling dependencies are awaited concurrently. Tasks that override
//! `transform_async` suspend while waiting; plain tasks run to completion when
//! polled.
//!
//! `run` owns its runtime. Called from inside another runtime (where
//! `block_on` cannot nest) it drives that runtime on a scoped helper thread.

use std::panic::AssertUnwindSafe;

use anyhow::anyhow;
use futures::FutureExt;
use futures::future::{BoxFuture, try_join_all};
use tracing::Instrument;

use super::{TaskRunner, assert_runnable, dependency_metas, panic_message};
use crate::error::InvocationError;
use crate::meta::{Meta, MetaRouting};
use crate::task::{Data, Inputs};
use crate::tree::TaskNode;

#[derive(Debug, Clone, Copy, Default)]
pub struct CooperativeRunner {
    routing: MetaRouting,
}

impl CooperativeRunner {
    pub fn new(routing: MetaRouting) -> Self {
        Self { routing }
    }

    /// Runs `node` on the caller's runtime.
    pub async fn run_async(&self, meta: &Meta, node: &TaskNode) -> Result<Data, InvocationError> {
        assert_runnable(node);
        self.run_node(meta.clone(), node).await
    }

    fn block_on(&self, meta: &Meta, node: &TaskNode) -> Result<Data, InvocationError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|err| InvocationError::new(node.name(), err))?;
        runtime.block_on(self.run_async(meta, node))
    }

    fn run_node<'a>(&'a self, meta: Meta, node: &'a TaskNode) -> BoxFuture<'a, Result<Data, InvocationError>> {
        async move {
            let pending = dependency_metas(&meta, node, self.routing)
                .map(|(dep, dep_meta)| async move {
                    let data = self.run_node(dep_meta, dep).await?;
                    Ok::<_, InvocationError>((dep.name(), data))
                })
                .collect::<Vec<_>>();
            let inputs: Inputs = try_join_all(pending).await?.into_iter().collect();

            invoke_async(node, &meta, inputs).await
        }
        .boxed()
    }
}

async fn invoke_async(node: &TaskNode, meta: &Meta, inputs: Inputs) -> Result<Data, InvocationError> {
    let name = node.name();
    let meta = node.effective_meta(meta);
    let span = tracing::debug_span!("task", task = %name, inputs = inputs.len());

    let outcome = AssertUnwindSafe(node.task().transform_async(&meta, inputs))
        .catch_unwind()
        .instrument(span)
        .await;

    match outcome {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(err)) => Err(InvocationError::new(name, err)),
        Err(payload) => Err(InvocationError::new(name, anyhow!(panic_message(payload.as_ref())))),
    }
}

impl TaskRunner for CooperativeRunner {
    /// Drives the graph on a fresh current-thread runtime.
    ///
    /// Inside an existing runtime the caller's thread blocks until the helper
    /// thread finishes; [`CooperativeRunner::run_async`] avoids that.
    fn run(&self, meta: &Meta, node: &TaskNode) -> Result<Data, InvocationError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return self.block_on(meta, node);
        }

        tracing::debug!(task = %node.name(), "inside a runtime, driving on a helper thread");
        std::thread::scope(|scope| {
            scope
                .spawn(|| self.block_on(meta, node))
                .join()
                .unwrap_or_else(|payload| {
                    Err(InvocationError::new(node.name(), anyhow!(panic_message(payload.as_ref()))))
                })
        })
    }

    fn routing(&self) -> MetaRouting {
        self.routing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::{TaskMaster, TaskStatus};
    use crate::runner::SequentialRunner;
    use crate::runner::testing::{arithmetic, node, panicking};
    use crate::task::{AsyncFunctionTask, IntoTaskRef, TaskRef, task};
    use crate::workspace::Workspace;
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn sleeper(name: &'static str, millis: u64) -> TaskRef {
        AsyncFunctionTask::new(name, Vec::<&str>::new(), move |_meta: Meta, _inputs: Inputs| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok::<_, anyhow::Error>(millis as i64)
        })
        .into_task_ref()
    }

    #[test]
    fn agrees_with_sequential() {
        let ws = arithmetic();
        let meta = Meta::from(json!({ "x": 5 }));
        for path in ["double", "total", "combo"] {
            let cooperative = CooperativeRunner::default().run(&meta, &node(&ws, path)).unwrap();
            let sequential = SequentialRunner::default().run(&meta, &node(&ws, path)).unwrap();
            assert_eq!(cooperative.into_value(), sequential.into_value(), "{path}");
        }
    }

    #[test]
    fn async_siblings_overlap_on_one_thread() {
        let all = task("all", ["a", "b", "c"], |_meta: &Meta, inputs: Inputs| Ok(inputs.len() as i64));
        let ws = Workspace::builder("ws")
            .add(sleeper("a", 200))
            .add(sleeper("b", 200))
            .add(sleeper("c", 200))
            .add(all)
            .build()
            .unwrap();

        let started = Instant::now();
        let out = CooperativeRunner::default().run(&Meta::new(), &node(&ws, "all")).unwrap();
        assert_eq!(out.into_value(), json!(3));
        assert!(started.elapsed() < Duration::from_millis(550));
    }

    #[tokio::test]
    async fn run_async_uses_the_callers_runtime() {
        let ws = arithmetic();
        let out = CooperativeRunner::default()
            .run_async(&Meta::from(json!({ "x": 1 })), &node(&ws, "combo"))
            .await
            .unwrap();
        assert_eq!(out.into_value(), json!(16));
    }

    #[tokio::test]
    async fn run_inside_a_current_thread_runtime() {
        let ws = arithmetic();
        let master = TaskMaster::new().with_runner(CooperativeRunner::default());

        let result = master.execute_path(&Meta::from(json!({ "x": 5 })), "combo", &ws).unwrap();
        assert_eq!(result.value().unwrap(), json!(24));
        assert_eq!(result.status(), TaskStatus::ContainsData);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_inside_a_multi_thread_runtime() {
        let ws = Workspace::builder("ws").add(sleeper("nap", 5)).build().unwrap();
        let master = TaskMaster::new().with_runner(CooperativeRunner::default());

        let result = master.execute_path(&Meta::new(), "nap", &ws).unwrap();
        assert_eq!(result.value().unwrap(), json!(5));
    }

    #[tokio::test]
    async fn failures_inside_a_runtime_still_become_invocation_errors() {
        let ws = Workspace::builder("ws").task("bad", panicking("bad")).build().unwrap();
        let master = TaskMaster::new().with_runner(CooperativeRunner::default());

        let result = master.execute_path(&Meta::new(), "bad", &ws).unwrap();
        assert!(result.data().is_err());
        assert_eq!(result.status(), TaskStatus::InvocationError);
    }

    #[test]
    fn panics_are_captured() {
        let parent = task("parent", ["bad"], |_meta: &Meta, _inputs: Inputs| Ok(0_i64));
        let ws = Workspace::builder("ws")
            .task("bad", panicking("bad"))
            .add(parent)
            .build()
            .unwrap();

        let err = CooperativeRunner::default().run(&Meta::new(), &node(&ws, "parent")).unwrap_err();
        assert_eq!(err.task(), "bad");
        assert!(err.to_string().contains("kaboom"));
    }
}

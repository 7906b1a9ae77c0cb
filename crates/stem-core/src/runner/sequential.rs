//! Single-threaded, declaration-order execution.

use super::{TaskRunner, assert_runnable, dependency_metas, invoke};
use crate::error::InvocationError;
use crate::meta::{Meta, MetaRouting};
use crate::task::{Data, Inputs};
use crate::tree::TaskNode;

/// Runs every dependency on the caller's thread, in declaration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialRunner {
    routing: MetaRouting,
}

impl SequentialRunner {
    pub fn new(routing: MetaRouting) -> Self {
        Self { routing }
    }
}

impl TaskRunner for SequentialRunner {
    fn run(&self, meta: &Meta, node: &TaskNode) -> Result<Data, InvocationError> {
        assert_runnable(node);

        let mut inputs = Inputs::new();
        for (dep, dep_meta) in dependency_metas(meta, node, self.routing) {
            inputs.insert(dep.name(), self.run(&dep_meta, dep)?);
        }
        invoke(node, meta, inputs)
    }

    fn routing(&self) -> MetaRouting {
        self.routing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::{arithmetic, failing, node};
    use crate::task::{IntoTaskRef, task};
    use crate::workspace::Workspace;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[test]
    fn double_of_five_is_ten() {
        let ws = arithmetic();
        let out = SequentialRunner::default()
            .run(&Meta::from(json!({ "x": 5 })), &node(&ws, "double"))
            .unwrap();
        assert_eq!(out.into_value(), json!(10));
    }

    #[test]
    fn combo_adds_double_and_sum_of_squares() {
        let ws = arithmetic();
        let out = SequentialRunner::default()
            .run(&Meta::from(json!({ "x": 5 })), &node(&ws, "combo"))
            .unwrap();
        // 10 + (1 + 4 + 9)
        assert_eq!(out.into_value(), json!(24));
    }

    #[test]
    fn dependencies_run_in_declaration_order_before_parent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let step = |name: &'static str, log: Arc<Mutex<Vec<&'static str>>>| {
            crate::task::data(name, move |_meta: &Meta| {
                log.lock().unwrap().push(name);
                Ok(0_i64)
            })
        };

        let parent_log = Arc::clone(&log);
        let parent = task("parent", ["c", "a", "b"], move |_meta: &Meta, _inputs: Inputs| {
            parent_log.lock().unwrap().push("parent");
            Ok(0_i64)
        });
        let ws = Workspace::builder("ws")
            .add(step("a", Arc::clone(&log)))
            .add(step("b", Arc::clone(&log)))
            .add(step("c", Arc::clone(&log)))
            .add(parent)
            .build()
            .unwrap();

        SequentialRunner::default().run(&Meta::new(), &node(&ws, "parent")).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["c", "a", "b", "parent"]);
    }

    #[test]
    fn dependency_failure_reaches_the_caller() {
        let parent = task("parent", ["bad"], |_meta: &Meta, _inputs: Inputs| Ok(0_i64));
        let ws = Workspace::builder("ws").task("bad", failing("bad")).add(parent).build().unwrap();

        let err = SequentialRunner::default()
            .run(&Meta::new(), &node(&ws, "parent"))
            .unwrap_err();
        assert_eq!(err.task(), "bad");
    }

    #[test]
    fn overlay_routing_gives_each_dependency_its_own_keys() {
        let echo = |name: &'static str| {
            crate::task::data(name, |meta: &Meta| Ok(meta.get("v").cloned().unwrap_or_default()))
        };
        let both = task("both", ["left", "right"], |_meta: &Meta, inputs: Inputs| {
            Ok(json!([inputs.value("left")?, inputs.value("right")?]))
        });
        let ws = Workspace::builder("ws")
            .add(echo("left"))
            .add(echo("right"))
            .add(both)
            .build()
            .unwrap();
        let meta = Meta::from(json!({ "v": 0, "left": { "v": 1 } }));

        let overlay = SequentialRunner::new(MetaRouting::Overlay)
            .run(&meta, &node(&ws, "both"))
            .unwrap();
        assert_eq!(overlay.into_value(), json!([1, 0]));

        let shared = SequentialRunner::new(MetaRouting::Shared)
            .run(&meta, &node(&ws, "both"))
            .unwrap();
        assert_eq!(shared.into_value(), json!([0, 0]));
    }

    #[test]
    fn direct_reference_dependencies_run_in_process() {
        let leaf = failing("leaf");
        let parent = task("parent", [crate::task::Dependency::Task(leaf)], |_m: &Meta, _i: Inputs| Ok(0_i64));
        let ws = Workspace::builder("ws").build().unwrap();
        let node = TaskNode::resolve(parent.into_task_ref(), &ws);

        let err = SequentialRunner::default().run(&Meta::new(), &node).unwrap_err();
        assert_eq!(err.task(), "leaf");
    }
}

//! Demo workspace served by the `stem` binary.
//!
//! ```text
//! demo
//! ├── double, scaled, combo          arithmetic on meta `x`
//! ├── numbers, squares, evens, total  sequence pipeline over 1..=n
//! ├── tick                           async task
//! ├── broken, fail                   error paths
//! └── text
//!     └── shout, greet
//! ```

use std::time::Duration;

use serde_json::Value;
use stem_core::task::{AsyncFunctionTask, FilterTask, Inputs, MapTask, ReduceTask, Sequence, data, task};
use stem_core::{Meta, MetaType, Specification, Workspace, WorkspaceError};

fn int(inputs: &Inputs, name: &str) -> anyhow::Result<i64> {
    inputs
        .value(name)?
        .as_i64()
        .ok_or_else(|| anyhow::anyhow!("'{name}' is not an integer"))
}

fn meta_int(meta: &Meta, key: &str) -> i64 {
    meta.get(key).and_then(Value::as_i64).unwrap_or_default()
}

fn text() -> Result<Workspace, WorkspaceError> {
    let shout = data("shout", |meta: &Meta| {
        let word = meta.get("word").and_then(Value::as_str).unwrap_or_default();
        Ok(word.to_uppercase())
    })
    .with_specification(Specification::new().field("word", MetaType::String));

    let greet = task("greet", ["shout"], |_meta: &Meta, inputs: Inputs| {
        let word = inputs.value("shout")?.as_str().unwrap_or_default();
        Ok(format!("Hello, {word}!"))
    });

    Workspace::builder("text").add(shout).add(greet).build()
}

pub fn workspace() -> Result<Workspace, WorkspaceError> {
    let double = data("double", |meta: &Meta| Ok(meta_int(meta, "x") * 2))
        .with_specification(Specification::new().field("x", MetaType::Integer));

    let scaled = task("scaled", ["double"], |meta: &Meta, inputs: Inputs| {
        Ok(int(&inputs, "double")? * meta_int(meta, "factor"))
    })
    .with_specification(Specification::new().field("factor", MetaType::Integer))
    .with_settings(Meta::from(serde_json::json!({ "factor": 3 })));

    let numbers = data("numbers", |meta: &Meta| {
        Ok(Sequence::new((1..=meta_int(meta, "n")).map(Value::from)))
    })
    .with_specification(Specification::new().field("n", MetaType::Integer))
    .with_settings(Meta::from(serde_json::json!({ "n": 3 })));

    let squares = MapTask::new(|v: Value| Value::from(v.as_i64().unwrap_or_default().pow(2)), "numbers");
    let evens = FilterTask::new(|v: &Value| v.as_i64().is_some_and(|n| n % 2 == 0), "numbers");
    let total = ReduceTask::new(
        |a: Value, b: Value| Value::from(a.as_i64().unwrap_or_default() + b.as_i64().unwrap_or_default()),
        "squares",
    );

    let combo = task("combo", ["double", "total"], |_meta: &Meta, inputs: Inputs| {
        Ok(int(&inputs, "double")? + int(&inputs, "total")?)
    });

    let tick = AsyncFunctionTask::new("tick", Vec::<&str>::new(), |meta: Meta, _inputs: Inputs| async move {
        let delay = meta.get("delay_ms").and_then(Value::as_u64).unwrap_or(10);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok::<_, anyhow::Error>("tick")
    });

    let broken = task("broken", ["missing"], |_meta: &Meta, _inputs: Inputs| Ok(0_i64));
    let fail = data("fail", |_meta: &Meta| -> anyhow::Result<i64> {
        anyhow::bail!("intentional failure")
    });

    Workspace::builder("demo")
        .add(double)
        .add(scaled)
        .add(numbers)
        .task("squares", squares)
        .task("evens", evens)
        .task("total", total)
        .add(combo)
        .add(tick)
        .add(broken)
        .add(fail)
        .workspace(text()?)
        .build()
}

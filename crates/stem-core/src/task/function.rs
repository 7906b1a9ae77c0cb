//! Closure-backed tasks.
//!
//! Dependencies are always declared explicitly; nothing is inferred from the
//! closure's parameters.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::{Data, Dependency, Inputs, Task};
use crate::meta::{Meta, Specification};

/// Task computing a value from meta plus its dependencies' outputs.
///
/// # 使用例
/// ```ignore
/// let combo = task("combo", ["double", "total"], |_meta, inputs: Inputs| {
///     let double = inputs.value("double")?.as_i64().unwrap_or_default();
///     let total = inputs.value("total")?.as_i64().unwrap_or_default();
///     Ok(double + total)
/// });
/// ```
pub struct FunctionTask<F, R> {
    name: String,
    func: F,
    dependencies: Vec<Dependency>,
    specification: Option<Specification>,
    settings: Option<Meta>,
    _marker: PhantomData<fn() -> R>,
}

impl<F, R> FunctionTask<F, R>
where
    F: Fn(&Meta, Inputs) -> anyhow::Result<R> + Send + Sync,
    R: Into<Data>,
{
    pub fn new<D>(name: impl Into<String>, dependencies: impl IntoIterator<Item = D>, func: F) -> Self
    where
        D: Into<Dependency>,
    {
        Self {
            name: name.into(),
            func,
            dependencies: dependencies.into_iter().map(Into::into).collect(),
            specification: None,
            settings: None,
            _marker: PhantomData,
        }
    }

    pub fn with_specification(mut self, specification: Specification) -> Self {
        self.specification = Some(specification);
        self
    }

    pub fn with_settings(mut self, settings: Meta) -> Self {
        self.settings = Some(settings);
        self
    }
}

impl<F, R> Task for FunctionTask<F, R>
where
    F: Fn(&Meta, Inputs) -> anyhow::Result<R> + Send + Sync,
    R: Into<Data>,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    fn specification(&self) -> Option<&Specification> {
        self.specification.as_ref()
    }

    fn settings(&self) -> Option<&Meta> {
        self.settings.as_ref()
    }

    fn transform(&self, meta: &Meta, inputs: Inputs) -> anyhow::Result<Data> {
        (self.func)(meta, inputs).map(Into::into)
    }
}

/// Shorthand for [`FunctionTask::new`].
pub fn task<F, R, D>(
    name: impl Into<String>,
    dependencies: impl IntoIterator<Item = D>,
    func: F,
) -> FunctionTask<F, R>
where
    F: Fn(&Meta, Inputs) -> anyhow::Result<R> + Send + Sync,
    R: Into<Data>,
    D: Into<Dependency>,
{
    FunctionTask::new(name, dependencies, func)
}

/// Leaf task: computes purely from meta.
pub struct DataTask<F, R> {
    name: String,
    func: F,
    specification: Option<Specification>,
    settings: Option<Meta>,
    _marker: PhantomData<fn() -> R>,
}

impl<F, R> DataTask<F, R>
where
    F: Fn(&Meta) -> anyhow::Result<R> + Send + Sync,
    R: Into<Data>,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
            specification: None,
            settings: None,
            _marker: PhantomData,
        }
    }

    pub fn with_specification(mut self, specification: Specification) -> Self {
        self.specification = Some(specification);
        self
    }

    pub fn with_settings(mut self, settings: Meta) -> Self {
        self.settings = Some(settings);
        self
    }
}

impl<F, R> Task for DataTask<F, R>
where
    F: Fn(&Meta) -> anyhow::Result<R> + Send + Sync,
    R: Into<Data>,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    fn specification(&self) -> Option<&Specification> {
        self.specification.as_ref()
    }

    fn settings(&self) -> Option<&Meta> {
        self.settings.as_ref()
    }

    fn transform(&self, meta: &Meta, _inputs: Inputs) -> anyhow::Result<Data> {
        (self.func)(meta).map(Into::into)
    }
}

/// Shorthand for [`DataTask::new`].
pub fn data<F, R>(name: impl Into<String>, func: F) -> DataTask<F, R>
where
    F: Fn(&Meta) -> anyhow::Result<R> + Send + Sync,
    R: Into<Data>,
{
    DataTask::new(name, func)
}

/// Task whose body is a future.
///
/// The cooperative runner awaits it directly; the other runners drive it on a
/// private current-thread runtime.
pub struct AsyncFunctionTask<F, R> {
    name: String,
    func: F,
    dependencies: Vec<Dependency>,
    specification: Option<Specification>,
    _marker: PhantomData<fn() -> R>,
}

impl<F, Fut, R> AsyncFunctionTask<F, R>
where
    F: Fn(Meta, Inputs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    R: Into<Data> + 'static,
{
    pub fn new<D>(name: impl Into<String>, dependencies: impl IntoIterator<Item = D>, func: F) -> Self
    where
        D: Into<Dependency>,
    {
        Self {
            name: name.into(),
            func,
            dependencies: dependencies.into_iter().map(Into::into).collect(),
            specification: None,
            _marker: PhantomData,
        }
    }

    pub fn with_specification(mut self, specification: Specification) -> Self {
        self.specification = Some(specification);
        self
    }
}

#[async_trait]
impl<F, Fut, R> Task for AsyncFunctionTask<F, R>
where
    F: Fn(Meta, Inputs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    R: Into<Data> + 'static,
{
    fn name(&self) -> String {
        self.name.clone()
    }

    fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    fn specification(&self) -> Option<&Specification> {
        self.specification.as_ref()
    }

    fn transform(&self, meta: &Meta, inputs: Inputs) -> anyhow::Result<Data> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        runtime.block_on((self.func)(meta.clone(), inputs)).map(Into::into)
    }

    async fn transform_async(&self, meta: &Meta, inputs: Inputs) -> anyhow::Result<Data> {
        (self.func)(meta.clone(), inputs).await.map(Into::into)
    }
}

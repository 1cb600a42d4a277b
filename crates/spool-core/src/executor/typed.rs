//! Typed task parameters.
//!
//! Two layers:
//! - **typed**: `TaskParams` (a params struct bound to a kind) and `Handler<P>`
//! - **dyn**: `TypedExecutor<P, H>` erases `P` so the handler fits into the registry
//!   as an `Arc<dyn Executor>`

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{Executor, TaskContext};
use crate::domain::Task;
use crate::error::ExecutionError;

/// Binds a params type to an executor kind.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct ResizeImages { width: u32, height: u32 }
///
/// impl TaskParams for ResizeImages {
///     const KIND: &'static str = "dataset.images.resize.v1";
/// }
/// ```
pub trait TaskParams: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Naming: `{domain}.{subject}.{action}.v{major}`
    const KIND: &'static str;
}

/// Runs a task with its params already decoded.
#[async_trait]
pub trait Handler<P: TaskParams>: Send + Sync {
    async fn handle(&self, params: P, ctx: TaskContext) -> Result<serde_json::Value, ExecutionError>;
}

pub struct TypedExecutor<P: TaskParams, H: Handler<P>> {
    handler: H,
    _marker: PhantomData<P>,
}

impl<P: TaskParams, H: Handler<P>> TypedExecutor<P, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<P: TaskParams, H: Handler<P>> Executor for TypedExecutor<P, H> {
    async fn run(&self, ctx: TaskContext) -> Result<serde_json::Value, ExecutionError> {
        let params: P = serde_json::from_value(ctx.params().clone())
            .map_err(|e| ExecutionError::InvalidParams(format!("{}: {e}", P::KIND)))?;
        self.handler.handle(params, ctx).await
    }
}

impl Task {
    /// A task whose kind and params come from a `TaskParams` value.
    pub fn typed<P: TaskParams>(name: impl Into<String>, params: &P) -> serde_json::Result<Task> {
        Ok(Task::new(name, P::KIND).with_params(serde_json::to_value(params)?))
    }
}

//! Task capability trait and its type-erased form.
//!
//! `Task` uses native async fn in traits (RPITIT), so it cannot be a trait
//! object directly. The registry stores tasks as [`SharedTask`], an
//! `Arc<dyn TaskDyn>`, where `TaskDyn` is an object-safe mirror with boxed
//! futures and a blanket impl for every `Task`.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;

use crate::context::{Context, ContextError};

/// Failure reported by task logic.
///
/// All variants are subject to the task's retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }
}

impl From<ContextError> for TaskError {
    fn from(err: ContextError) -> Self {
        TaskError::Failed(err.to_string())
    }
}

/// Executable task logic.
///
/// Receives a private copy of the run context and returns the context it
/// wants committed. Keys added, changed or removed relative to the input are
/// merged into the run context when the task succeeds.
pub trait Task: Send + Sync {
    fn invoke(&self, ctx: Context) -> impl Future<Output = Result<Context, TaskError>> + Send;
}

/// Object-safe version of [`Task`] with a boxed future.
pub trait TaskDyn: Send + Sync {
    fn invoke_boxed(
        &self,
        ctx: Context,
    ) -> Pin<Box<dyn Future<Output = Result<Context, TaskError>> + Send + '_>>;
}

impl<T: Task> TaskDyn for T {
    fn invoke_boxed(
        &self,
        ctx: Context,
    ) -> Pin<Box<dyn Future<Output = Result<Context, TaskError>> + Send + '_>> {
        Box::pin(self.invoke(ctx))
    }
}

/// Type-erased, shareable task logic.
pub type SharedTask = Arc<dyn TaskDyn>;

// ---------------------------------------------------------------------------
// Closure adapter
// ---------------------------------------------------------------------------

/// A [`Task`] backed by an async closure.
pub struct FnTask<F> {
    f: F,
}

/// Wrap an async closure `Fn(Context) -> Future<Output = Result<Context, TaskError>>`.
pub fn task_fn<F, Fut>(f: F) -> FnTask<F>
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Context, TaskError>> + Send,
{
    FnTask { f }
}

impl<F, Fut> Task for FnTask<F>
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Context, TaskError>> + Send,
{
    fn invoke(&self, ctx: Context) -> impl Future<Output = Result<Context, TaskError>> + Send {
        (self.f)(ctx)
    }
}

// ---------------------------------------------------------------------------
// Guarded invocation
// ---------------------------------------------------------------------------

/// Invoke a task, converting panics and timeouts into [`TaskError`]s.
pub async fn invoke_guarded(
    task: SharedTask,
    ctx: Context,
    timeout: Option<Duration>,
) -> Result<Context, TaskError> {
    let fut = AssertUnwindSafe(task.invoke_boxed(ctx)).catch_unwind();
    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(TaskError::Timeout(limit)),
        },
        None => fut.await,
    };
    outcome.unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

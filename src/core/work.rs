//! Work-unit abstraction.
//!
//! Callers hand the governor opaque asynchronous work (an LLM call, a
//! sub-search, a sandboxed analysis). The trait is nullary: the caller's
//! closure owns its own payload. Retried tasks call `run` again, so the unit
//! must be re-runnable.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::GovernorError;

/// Outcome of a single work attempt.
pub type WorkResult = Result<Value, GovernorError>;

/// An opaque, re-runnable unit of asynchronous work.
#[async_trait]
pub trait WorkUnit: Send + Sync + 'static {
    /// Execute one attempt and produce a JSON result.
    async fn run(&self) -> WorkResult;
}

struct FnWork<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> WorkUnit for FnWork<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkResult> + Send + 'static,
{
    async fn run(&self) -> WorkResult {
        (self.f)().await
    }
}

/// Wrap an async closure as a shareable [`WorkUnit`].
///
/// ```rust,ignore
/// let work = work_fn(|| async { Ok(serde_json::json!({"answer": 42})) });
/// scheduler.submit("t-1", 5.0, "quick_action", work, Priority::Normal);
/// ```
pub fn work_fn<F, Fut>(f: F) -> Arc<dyn WorkUnit>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = WorkResult> + Send + 'static,
{
    Arc::new(FnWork { f })
}

//! The backend port and the closed set of backends implementing it.
//!
//! Every backend returns a [`FilterResult`] rather than an error: failures,
//! cancellation and even panics inside a backend are folded into the result
//! by [`run_normalized`], together with the elapsed time and any warnings
//! recorded while the backend ran.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use geosieve_common::warnings::collect_warnings;
use geosieve_common::{
    BackendKind, CancelToken, DatasetDescriptor, FilterResult, FilterSpec, Matched,
};
use geosieve_error::{ErrorCode, Result, SieveError};
use geosieve_sql::MATCH_NOTHING;
use tracing::{error, warn};

pub mod fallback;
pub mod sql;

pub use fallback::FallbackBackend;
pub use sql::postgres::{PgManager, RelationalBackend};
pub use sql::sqlite::EmbeddedBackend;

#[async_trait]
pub trait BackendPort: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether this backend can filter `dataset` at all.
    fn supports_dataset(&self, dataset: &DatasetDescriptor) -> bool;

    /// Run one filter step against `target`. Never fails: errors are
    /// reported through the result status.
    async fn execute(
        &self,
        spec: &FilterSpec,
        target: &DatasetDescriptor,
        auxiliary: &[DatasetDescriptor],
        cancel: &CancelToken,
    ) -> FilterResult;

    /// Release transient resources (views, staging tables) created for
    /// `dataset`.
    async fn cleanup(&self, dataset: &DatasetDescriptor);
}

/// The backends the selector can hand out.
#[derive(Clone)]
pub enum Backend {
    Relational(Arc<RelationalBackend<PgManager>>),
    Embedded(Arc<EmbeddedBackend>),
    Fallback(Arc<FallbackBackend>),
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Backend").field(&self.kind()).finish()
    }
}

impl Backend {
    fn port(&self) -> &dyn BackendPort {
        match self {
            Backend::Relational(b) => b.as_ref(),
            Backend::Embedded(b) => b.as_ref(),
            Backend::Fallback(b) => b.as_ref(),
        }
    }
}

#[async_trait]
impl BackendPort for Backend {
    fn kind(&self) -> BackendKind {
        self.port().kind()
    }

    fn supports_dataset(&self, dataset: &DatasetDescriptor) -> bool {
        self.port().supports_dataset(dataset)
    }

    async fn execute(
        &self,
        spec: &FilterSpec,
        target: &DatasetDescriptor,
        auxiliary: &[DatasetDescriptor],
        cancel: &CancelToken,
    ) -> FilterResult {
        self.port().execute(spec, target, auxiliary, cancel).await
    }

    async fn cleanup(&self, dataset: &DatasetDescriptor) {
        self.port().cleanup(dataset).await
    }
}

/// Run a backend body and fold its outcome into a [`FilterResult`].
///
/// The body runs in its own warning scope; a panic becomes an
/// `InternalPanic` error and cancellation becomes a `Cancelled` result.
pub(crate) async fn run_normalized<F>(kind: BackendKind, body: F) -> FilterResult
where
    F: std::future::Future<Output = Result<FilterResult>> + Send,
{
    let started = Instant::now();
    let (outcome, warnings) = collect_warnings(AssertUnwindSafe(body).catch_unwind()).await;

    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(e)) if e.is_cancelled() => FilterResult::cancelled(kind),
        Ok(Err(e)) => {
            warn!(target: "backend", backend = kind.as_str(), code = %e.code, "Filter step failed: {}", e);
            FilterResult::error(kind, e)
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(target: "backend", backend = kind.as_str(), "Backend panicked: {}", message);
            FilterResult::error(
                kind,
                SieveError::new(
                    ErrorCode::InternalPanic,
                    format!("{} backend panicked: {}", kind.as_str(), message),
                ),
            )
        }
    };
    result.with_elapsed(started.elapsed()).with_warnings(warnings)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Final result of a step. A step that matched nothing always hands back the
/// constant-false filter.
pub(crate) fn step_result(kind: BackendKind, filter_text: String, matched: Matched) -> FilterResult {
    if matched.is_empty() {
        FilterResult::empty(kind, MATCH_NOTHING)
    } else {
        FilterResult::success(kind, filter_text, matched)
    }
}

/// Map a blocking-task join failure.
pub(crate) fn join_error(err: tokio::task::JoinError) -> SieveError {
    if err.is_panic() {
        let message = panic_message(err.into_panic().as_ref());
        SieveError::new(ErrorCode::InternalPanic, format!("Blocking task panicked: {}", message))
    } else {
        SieveError::cancelled()
    }
}

//! # Filter Engine
//!
//! Runs filter requests against the backend chain built by the
//! [`BackendSelector`].
//!
//! Request lifecycle:
//! 1. **Select**: the selector returns the ordered chain for the target
//!    dataset. Backends it had to leave out become warnings.
//! 2. **Execute**: backends are tried in order. A connection-class failure
//!    (unreachable database, exhausted pool, open circuit) cleans up the
//!    failed backend and moves on to the next one. Any other outcome is final.
//! 3. **Report**: selector and fallthrough warnings precede the answering
//!    backend's own warnings, and `elapsed` covers the whole walk.
//!
//! [`FilterEngine::submit`] runs the same steps on a spawned task and hands
//! back a [`FilterHandle`] for cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use geosieve_common::circuit_breaker::BreakerSnapshot;
use geosieve_common::config::AppConfig;
use geosieve_common::pool::PoolStats;
use geosieve_common::warnings::{add_warning, collect_warnings};
use geosieve_common::{BackendKind, CancelToken, DatasetDescriptor, FilterRequest, FilterResult};
use geosieve_connectors::{BackendPort, BackendSelector, Capabilities, ReaderRegistry};
use geosieve_error::{ErrorCode, SieveError};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Point-in-time view of the engine's shared resources.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub capabilities: Capabilities,
    pub active_requests: usize,
    pub cached_chains: u64,
    pub pools: Vec<PoolStats>,
    pub breakers: Vec<BreakerSnapshot>,
}

/// A request running on its own task.
#[derive(Debug)]
pub struct FilterHandle {
    cancel: CancelToken,
    join: JoinHandle<FilterResult>,
}

impl FilterHandle {
    /// Ask the request to stop. Backends notice at their next safe point and
    /// release what they hold before the result comes back `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the result. A panic on the request task is reported as an
    /// `InternalPanic` error.
    pub async fn join(self) -> FilterResult {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                error!(target: "engine", "Filter task panicked");
                FilterResult::error(
                    BackendKind::Fallback,
                    SieveError::new(ErrorCode::InternalPanic, "Filter task panicked"),
                )
            }
            Err(_) => FilterResult::cancelled(BackendKind::Fallback),
        }
    }
}

/// Decrements the active-request counter when a request finishes, however
/// it finishes.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct FilterEngine {
    selector: Arc<BackendSelector>,
    active: Arc<AtomicUsize>,
}

impl FilterEngine {
    pub fn new(config: AppConfig, readers: Arc<ReaderRegistry>) -> Self {
        Self::from_selector(Arc::new(BackendSelector::new(config, readers)))
    }

    pub fn from_selector(selector: Arc<BackendSelector>) -> Self {
        Self {
            selector,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn selector(&self) -> &Arc<BackendSelector> {
        &self.selector
    }

    pub fn active_requests(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Run `request` on a new task.
    pub fn submit(&self, request: FilterRequest) -> FilterHandle {
        let cancel = CancelToken::new();
        let engine = self.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move { engine.execute(&request, &token).await });
        FilterHandle { cancel, join }
    }

    /// Run `request` on the current task.
    pub async fn execute(&self, request: &FilterRequest, cancel: &CancelToken) -> FilterResult {
        let _active = ActiveGuard::enter(&self.active);
        let started = Instant::now();
        let target = &request.target;
        info!(
            target: "engine",
            dataset = %target.id,
            provider = ?target.provider,
            combine = %request.spec.combine,
            "Filter request started"
        );

        let (result, warnings) = collect_warnings(self.walk_chain(request, cancel)).await;

        // Engine-level warnings come first; they explain how the answering
        // backend was reached.
        let mut result = result;
        let own = std::mem::replace(&mut result.warnings, warnings);
        let result = result.with_warnings(own).with_elapsed(started.elapsed());

        info!(
            target: "engine",
            dataset = %target.id,
            backend = result.backend.as_str(),
            status = ?result.status,
            step = result.step,
            cache_hit = result.cache_hit,
            warnings = result.warnings.len(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Filter request finished"
        );
        result
    }

    async fn walk_chain(&self, request: &FilterRequest, cancel: &CancelToken) -> FilterResult {
        let target = &request.target;
        if cancel.is_cancelled() {
            return FilterResult::cancelled(BackendKind::Fallback);
        }

        let chain = self.selector.select(target).await;
        let mut last_failure = None;

        for backend in chain {
            let kind = backend.kind();
            debug!(target: "engine", dataset = %target.id, backend = kind.as_str(), "Trying backend");
            let result = backend
                .execute(&request.spec, target, &request.auxiliary, cancel)
                .await;

            let falls_through = result
                .error
                .as_ref()
                .is_some_and(SieveError::triggers_fallback);
            if !falls_through {
                return result;
            }

            let reason = result
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            warn!(
                target: "engine",
                dataset = %target.id,
                backend = kind.as_str(),
                "Backend unavailable, falling through: {}",
                reason
            );
            backend.cleanup(target).await;
            for warning in &result.warnings {
                add_warning(warning.clone());
            }
            add_warning(format!("{} backend unavailable ({}); trying the next backend", kind, reason));
            last_failure = Some(result);
        }

        match last_failure {
            Some(mut failure) => {
                // Its warnings were already carried over above.
                failure.warnings.clear();
                failure
            }
            None => FilterResult::error(
                BackendKind::Fallback,
                SieveError::new(
                    ErrorCode::UnsupportedDataset,
                    format!("No backend can filter dataset '{}'", target.id),
                )
                .with_hint("Check the dataset provider and source path"),
            ),
        }
    }

    /// Forget the dataset's filter chain and drop every transient object any
    /// backend holds for it.
    pub async fn reset(&self, dataset: &DatasetDescriptor) {
        self.selector.cache().invalidate_dataset(&dataset.id).await;
        for backend in self.selector.all_backends().await {
            backend.cleanup(dataset).await;
        }
        info!(target: "engine", dataset = %dataset.id, "Dataset filter state reset");
    }

    pub async fn stats(&self) -> EngineStats {
        EngineStats {
            capabilities: self.selector.capabilities(),
            active_requests: self.active_requests(),
            cached_chains: self.selector.cache().len().await,
            pools: self.selector.pool_stats().await,
            breakers: self.selector.breaker_snapshot(),
        }
    }

    /// Close every connection pool. Requests still running fail with
    /// `PoolClosed` on the relational backend and fall through.
    pub async fn shutdown(&self) {
        self.selector.shutdown().await;
        self.selector.cache().clear();
        info!(target: "engine", "Filter engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geosieve_common::{FilterSpec, FilterStatus, ProviderKind, SpatialPredicate};

    fn engine() -> FilterEngine {
        let mut config = AppConfig::default();
        config.embedded.enabled = false;
        config.relational.enabled = false;
        FilterEngine::new(config, Arc::new(ReaderRegistry::new()))
    }

    fn request(provider: ProviderKind, source: &str) -> FilterRequest {
        FilterRequest {
            target: DatasetDescriptor::new("d", provider, source, "d"),
            spec: FilterSpec::new()
                .with_predicate(SpatialPredicate::Intersects)
                .with_literal_source(["POINT(0 0)"]),
            auxiliary: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_no_backend_is_unsupported_dataset() {
        let engine = engine();
        let result = engine
            .execute(&request(ProviderKind::Postgres, "host=db"), &CancelToken::new())
            .await;
        assert_eq!(result.status, FilterStatus::Error);
        assert_eq!(result.error.map(|e| e.code), Some(ErrorCode::UnsupportedDataset));
        assert_eq!(result.warnings, vec!["relational backend skipped: the relational backend is disabled"]);
        assert_eq!(engine.active_requests(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = engine()
            .execute(&request(ProviderKind::File, "/data/a.geojson"), &cancel)
            .await;
        assert_eq!(result.status, FilterStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_stats_start_empty() {
        let stats = engine().stats().await;
        assert_eq!(stats.active_requests, 0);
        assert!(stats.pools.is_empty());
        assert!(!stats.capabilities.relational_driver);
    }
}

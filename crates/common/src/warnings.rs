//! # Filter Warnings
//!
//! Task-local warning collection for filter execution.
//!
//! Non-fatal conditions (a source or candidate geometry that could not be
//! repaired, a precomputed view downgraded to the direct strategy, a backend
//! skipped by the selector) are recorded here and returned on the
//! `FilterResult` instead of failing the request.

use std::future::Future;
use std::sync::{Arc, Mutex};

tokio::task_local! {
    pub static FILTER_WARNINGS: Arc<Mutex<Vec<String>>>;
}

/// Helper to add a warning to the current task's warning list, if active.
pub fn add_warning(warning: impl Into<String>) {
    let warning = warning.into();
    tracing::debug!(target: "engine", %warning, "Filter warning recorded");
    if let Ok(warnings) = FILTER_WARNINGS.try_with(|w: &Arc<Mutex<Vec<String>>>| w.clone()) {
        if let Ok(mut lock) = warnings.lock() {
            lock.push(warning);
        }
    }
}

/// Run `fut` with a fresh warning scope and return its output together with
/// the warnings recorded while it ran.
pub async fn collect_warnings<F: Future>(fut: F) -> (F::Output, Vec<String>) {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let output = FILTER_WARNINGS.scope(sink.clone(), fut).await;
    let warnings = sink.lock().map(|mut w| std::mem::take(&mut *w)).unwrap_or_default();
    (output, warnings)
}

//! Maps a dataset to the ordered chain of backends that can filter it.
//!
//! The order is fixed: the relational backend for Postgres datasets, the
//! embedded backend for SpatiaLite/GeoPackage files, then the in-process
//! fallback for anything a feature reader can open. A backend whose
//! constructor fails is left out of the chain with a warning; that is not an
//! error for the request.

use std::collections::HashMap;
use std::sync::Arc;

use geosieve_common::circuit_breaker::{BreakerSnapshot, CircuitBreakerRegistry};
use geosieve_common::config::AppConfig;
use geosieve_common::pool::{PoolRegistry, PoolStats};
use geosieve_common::step_cache::StepCache;
use geosieve_common::warnings::add_warning;
use geosieve_common::{BackendKind, DatasetDescriptor, ProviderKind};
use geosieve_error::{Result, SieveError};
use geosieve_sql::FilterClassifier;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::backends::sql::sqlite::SpatialSupport;
use crate::backends::{Backend, BackendPort, EmbeddedBackend, FallbackBackend, PgManager, RelationalBackend};
use crate::readers::ReaderRegistry;

/// What the process can do, resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub relational_driver: bool,
    /// The SpatiaLite extension is loadable. Without it the embedded backend
    /// uses in-process SQL functions.
    pub embedded_spatial: bool,
}

pub struct BackendSelector {
    config: AppConfig,
    capabilities: Capabilities,
    breakers: CircuitBreakerRegistry,
    cache: Arc<StepCache>,
    pools: PoolRegistry<PgManager>,
    /// Relational backends by connection string, each built at most once.
    relational: Mutex<HashMap<String, Arc<OnceCell<Arc<RelationalBackend<PgManager>>>>>>,
    embedded: Option<Arc<EmbeddedBackend>>,
    fallback: Option<Arc<FallbackBackend>>,
}

impl BackendSelector {
    /// Build the selector. Detects SpatiaLite, so this may touch the disk.
    pub fn new(config: AppConfig, readers: Arc<ReaderRegistry>) -> Self {
        let support = if config.embedded.enabled {
            SpatialSupport::detect(config.embedded.spatialite_path.as_deref())
        } else {
            SpatialSupport::InProcess
        };
        Self::with_support(config, readers, support)
    }

    pub fn with_support(config: AppConfig, readers: Arc<ReaderRegistry>, support: SpatialSupport) -> Self {
        let capabilities = Capabilities {
            relational_driver: config.relational.enabled,
            embedded_spatial: matches!(support, SpatialSupport::Extension(_)),
        };
        let breakers = CircuitBreakerRegistry::new(config.breaker);
        let cache = Arc::new(StepCache::new(&config.cache));
        let classifier = FilterClassifier::new([
            config.relational.view_prefix.as_str(),
            config.embedded.stage_prefix.as_str(),
        ]);

        let embedded = EmbeddedBackend::new(
            &config.embedded,
            config.lock_retry,
            support,
            cache.clone(),
            breakers.get(BackendKind::Embedded.as_str()),
            classifier.clone(),
        )
        .map(Arc::new)
        .map_err(|e| info!(target: "selector", "Embedded backend not available: {}", e))
        .ok();

        let fallback = FallbackBackend::new(&config.fallback, readers)
            .map(|b| Arc::new(b.with_classifier(classifier)))
            .map_err(|e| info!(target: "selector", "Fallback backend not available: {}", e))
            .ok();

        info!(
            target: "selector",
            relational = capabilities.relational_driver,
            embedded_spatial = capabilities.embedded_spatial,
            "Backend capabilities resolved"
        );

        Self {
            pools: PoolRegistry::new(config.pool.clone()),
            config,
            capabilities,
            breakers,
            cache,
            relational: Mutex::new(HashMap::new()),
            embedded,
            fallback,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<StepCache> {
        &self.cache
    }

    pub fn breaker_snapshot(&self) -> Vec<BreakerSnapshot> {
        self.breakers.snapshot()
    }

    pub async fn pool_stats(&self) -> Vec<PoolStats> {
        self.pools.stats()
    }

    /// Ordered backend chain for `dataset`. May be empty.
    pub async fn select(&self, dataset: &DatasetDescriptor) -> Vec<Backend> {
        let mut chain = Vec::with_capacity(3);

        if dataset.provider == ProviderKind::Postgres {
            if !self.capabilities.relational_driver {
                skipped(dataset, BackendKind::Relational, "the relational backend is disabled");
            } else {
                match self.relational_for(dataset).await {
                    Ok(backend) => chain.push(Backend::Relational(backend)),
                    Err(e) => skipped(dataset, BackendKind::Relational, &e.to_string()),
                }
            }
        }

        if let Some(embedded) = &self.embedded {
            if embedded.supports_dataset(dataset) {
                chain.push(Backend::Embedded(embedded.clone()));
            }
        } else if matches!(dataset.provider, ProviderKind::Spatialite | ProviderKind::GeoPackage) {
            skipped(dataset, BackendKind::Embedded, "the embedded backend is disabled");
        }

        if let Some(fallback) = &self.fallback {
            if fallback.supports_dataset(dataset) {
                chain.push(Backend::Fallback(fallback.clone()));
            }
        }

        if chain.is_empty() {
            warn!(target: "selector", dataset = %dataset.id, provider = ?dataset.provider, "No backend can filter this dataset");
        }
        chain
    }

    /// The relational backend for the dataset's connection target, built
    /// (and its pool pre-filled) on first use.
    async fn relational_for(&self, dataset: &DatasetDescriptor) -> Result<Arc<RelationalBackend<PgManager>>> {
        let cell = self
            .relational
            .lock()
            .entry(dataset.source.clone())
            .or_default()
            .clone();
        let backend = cell
            .get_or_try_init(|| async {
                let breaker = self.breakers.get(BackendKind::Relational.as_str());
                let pool = breaker
                    .call_classified(
                        || {
                            self.pools.get_or_connect(&dataset.source, || {
                                PgManager::new(dataset, &self.config.relational, &self.config.pool)
                            })
                        },
                        SieveError::counts_as_breaker_failure,
                    )
                    .await?;
                let backend = Arc::new(RelationalBackend::new(pool, &self.config.relational, breaker)?);
                info!(target: "selector", pool = backend.target(), "Relational backend ready");
                Ok::<_, SieveError>(backend)
            })
            .await?;
        Ok(backend.clone())
    }

    /// Every backend constructed so far, for cleanup.
    pub async fn all_backends(&self) -> Vec<Backend> {
        let mut all: Vec<Backend> = self
            .relational
            .lock()
            .values()
            .filter_map(|cell| cell.get().cloned())
            .map(Backend::Relational)
            .collect();
        all.extend(self.embedded.clone().map(Backend::Embedded));
        all.extend(self.fallback.clone().map(Backend::Fallback));
        all
    }

    /// Close every pool. Backends handed out earlier fail with `PoolClosed`
    /// from now on.
    pub async fn shutdown(&self) {
        self.relational.lock().clear();
        self.pools.close_all();
        info!(target: "selector", "Connection pools closed");
    }
}

fn skipped(dataset: &DatasetDescriptor, kind: BackendKind, reason: &str) {
    warn!(target: "selector", dataset = %dataset.id, backend = kind.as_str(), "Backend skipped: {}", reason);
    add_warning(format!("{} backend skipped: {}", kind, reason));
}

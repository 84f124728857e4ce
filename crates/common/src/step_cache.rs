//! Cross-step cache of feature-id sets for multi-step filtering.
//!
//! One chain is kept per dataset. Each filter step on that dataset either
//! continues the chain (the source geometry is unchanged and the request
//! asks for a combination) or starts a new one at step 1.
//!
//! Updates for one dataset are serialized through moka's per-key
//! `and_compute_with`, so two tasks filtering the same dataset concurrently
//! cannot lose each other's step.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use moka::ops::compute::Op;
use tracing::{debug, info};

use crate::config::StepCacheSettings;
use crate::models::{CombineOperator, FeatureIdSet, SpatialPredicate};

/// Full fingerprint of one filter step.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepKey {
    pub dataset_id: String,
    /// Content hash of the source geometry.
    pub geometry_hash: String,
    pub buffer: Option<String>,
    pub predicates: BTreeSet<SpatialPredicate>,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: StepKey,
    pub ids: Arc<FeatureIdSet>,
    pub step: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What `record_step` did.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Id set after combination.
    pub ids: Arc<FeatureIdSet>,
    pub step: u32,
    pub cache_hit: bool,
    /// An entry existed but was discarded because its source hash differed.
    pub invalidated: bool,
    /// No entry existed for the dataset before this step.
    pub fresh: bool,
}

pub struct StepCache {
    enabled: bool,
    cache: Cache<String, Arc<CacheEntry>>,
}

impl std::fmt::Debug for StepCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepCache")
            .field("enabled", &self.enabled)
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl StepCache {
    pub fn new(settings: &StepCacheSettings) -> Self {
        info!(
            target: "cache",
            enabled = settings.enabled,
            max_entries = settings.max_entries,
            ttl_secs = settings.ttl_secs,
            "Initializing step cache"
        );

        let cache = Cache::builder()
            .max_capacity(settings.max_entries)
            .time_to_live(Duration::from_secs(settings.ttl_secs))
            .eviction_listener(|key, entry: Arc<CacheEntry>, cause| {
                debug!(
                    target: "cache",
                    dataset = %key,
                    step = entry.step,
                    cause = ?cause,
                    "Evicting step cache entry"
                );
            })
            .build();

        Self {
            enabled: settings.enabled,
            cache,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Record a step's result and combine it with the cached chain.
    ///
    /// A hit needs a cached entry whose geometry hash equals the key's and a
    /// combining operator; the ids are then combined per `op` and the step
    /// counter increments. Anything else stores `new_ids` at step 1.
    pub async fn record_step(
        &self,
        key: StepKey,
        new_ids: FeatureIdSet,
        op: CombineOperator,
    ) -> StepOutcome {
        if !self.enabled {
            return StepOutcome {
                ids: Arc::new(new_ids),
                step: 1,
                cache_hit: false,
                invalidated: false,
                fresh: true,
            };
        }

        let dataset_id = key.dataset_id.clone();
        let new_ids = Arc::new(new_ids);
        let mut outcome: Option<StepOutcome> = None;

        self.cache
            .entry_by_ref(&dataset_id)
            .and_compute_with(|current| {
                let now = Utc::now();
                let previous = current.map(|e| e.into_value());
                let (entry, result) = match previous {
                    Some(prev)
                        if prev.key.geometry_hash == key.geometry_hash
                            && op != CombineOperator::Replace =>
                    {
                        let combined = Arc::new(op.apply(&prev.ids, &new_ids));
                        let step = prev.step.saturating_add(1);
                        debug!(
                            target: "cache",
                            dataset = %key.dataset_id,
                            operator = %op,
                            previous = prev.ids.len(),
                            new = new_ids.len(),
                            combined = combined.len(),
                            step,
                            "Step cache hit"
                        );
                        (
                            CacheEntry {
                                key: key.clone(),
                                ids: combined.clone(),
                                step,
                                created_at: prev.created_at,
                                updated_at: now,
                            },
                            StepOutcome {
                                ids: combined,
                                step,
                                cache_hit: true,
                                invalidated: false,
                                fresh: false,
                            },
                        )
                    }
                    other => {
                        let invalidated = other
                            .as_ref()
                            .is_some_and(|p| p.key.geometry_hash != key.geometry_hash);
                        if invalidated {
                            debug!(
                                target: "cache",
                                dataset = %key.dataset_id,
                                "Source geometry changed; restarting step chain"
                            );
                        }
                        (
                            CacheEntry {
                                key: key.clone(),
                                ids: new_ids.clone(),
                                step: 1,
                                created_at: now,
                                updated_at: now,
                            },
                            StepOutcome {
                                ids: new_ids.clone(),
                                step: 1,
                                cache_hit: false,
                                invalidated,
                                fresh: other.is_none(),
                            },
                        )
                    }
                };
                outcome = Some(result);
                std::future::ready(Op::Put(Arc::new(entry)))
            })
            .await;

        outcome.unwrap_or_else(|| StepOutcome {
            ids: new_ids,
            step: 1,
            cache_hit: false,
            invalidated: false,
            fresh: true,
        })
    }

    /// Current chain for a dataset, if any.
    pub async fn peek(&self, dataset_id: &str) -> Option<Arc<CacheEntry>> {
        self.cache.get(dataset_id).await
    }

    /// Put back the chain that was current before a step whose result was
    /// never handed to the caller. `None` removes the dataset's entry.
    pub async fn restore(&self, dataset_id: &str, previous: Option<Arc<CacheEntry>>) {
        if !self.enabled {
            return;
        }
        match previous {
            Some(entry) => {
                debug!(target: "cache", dataset = %dataset_id, step = entry.step, "Step chain rolled back");
                self.cache.insert(dataset_id.to_string(), entry).await;
            }
            None => self.cache.invalidate(dataset_id).await,
        }
    }

    /// Drop the chain for a dataset (its filter was reset).
    pub async fn invalidate_dataset(&self, dataset_id: &str) {
        if self.cache.remove(dataset_id).await.is_some() {
            info!(target: "cache", dataset = %dataset_id, "Step cache cleared for dataset");
        }
    }

    pub fn clear(&self) {
        self.cache.invalidate_all();
    }

    pub async fn len(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }
}

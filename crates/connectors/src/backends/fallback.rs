//! In-process evaluation over plain feature readers.
//!
//! No spatial SQL engine is involved: the backend reads every feature of the
//! target through a [`FeatureReader`], evaluates the attribute condition and
//! the spatial predicates itself and hands back a primary-key membership
//! filter. It has no index, so it is the last backend in every chain.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use geo_types::Geometry;
use geosieve_common::config::FallbackSettings;
use geosieve_common::warnings::add_warning;
use geosieve_common::{
    BackendKind, BufferDistance, CancelToken, CombineOperator, DatasetDescriptor, FeatureId,
    FeatureIdSet, FilterResult, FilterSpec, Matched, SourceGeometry, SpatialPredicate,
};
use geosieve_error::{ErrorCode, Result, SieveError};
use geosieve_geometry::{buffer_geometry, evaluate_any, parse_wkt, prepare_literals, repair, Repaired};
use geosieve_sql::spatial::find_auxiliary;
use geosieve_sql::{key_membership, Condition, FilterClass, FilterClassifier, SqlGenError};
use serde_json::Value;
use tracing::{debug, instrument};

use super::{join_error, run_normalized, step_result, BackendPort};
use crate::readers::{Feature, FeatureReader, ReaderRegistry};

/// Key column of the emitted membership filter when the dataset declares none.
pub const DEFAULT_KEY_COLUMN: &str = "fid";

const DIALECT_NAME: &str = "in-process";

fn to_sieve(e: SqlGenError) -> SieveError {
    e.to_sieve_error(DIALECT_NAME)
}

pub struct FallbackBackend {
    settings: FallbackSettings,
    readers: Arc<ReaderRegistry>,
    classifier: FilterClassifier,
}

/// Everything the blocking evaluation needs, owned.
struct Job {
    spec: FilterSpec,
    target: DatasetDescriptor,
    target_reader: Arc<dyn FeatureReader>,
    source: Option<SourceJob>,
    cancel_check_interval: usize,
    classifier: FilterClassifier,
}

enum SourceJob {
    Literal(Vec<String>),
    Dataset {
        descriptor: DatasetDescriptor,
        reader: Arc<dyn FeatureReader>,
        filter: Option<String>,
    },
}

struct Evaluated {
    result: FilterResult,
    warnings: Vec<String>,
}

impl FallbackBackend {
    pub fn new(settings: &FallbackSettings, readers: Arc<ReaderRegistry>) -> Result<Self> {
        if !settings.enabled {
            return Err(SieveError::new(
                ErrorCode::DriverUnavailable,
                "The in-process fallback backend is disabled",
            ));
        }
        Ok(Self {
            settings: settings.clone(),
            readers,
            classifier: FilterClassifier::default(),
        })
    }

    pub fn with_classifier(mut self, classifier: FilterClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn readers(&self) -> &Arc<ReaderRegistry> {
        &self.readers
    }

    fn reader_for(&self, dataset: &DatasetDescriptor) -> Result<Arc<dyn FeatureReader>> {
        self.readers.resolve(dataset).ok_or_else(|| {
            SieveError::new(
                ErrorCode::UnsupportedDataset,
                format!("No feature reader can open dataset '{}'", dataset.id),
            )
            .with_hint("Register a reader for the dataset id")
        })
    }

    fn prepare(
        &self,
        spec: &FilterSpec,
        target: &DatasetDescriptor,
        auxiliary: &[DatasetDescriptor],
    ) -> Result<Job> {
        let source = match spec.source.as_ref().filter(|_| spec.is_spatial()) {
            None => None,
            Some(SourceGeometry::Literal { wkts, .. }) => Some(SourceJob::Literal(wkts.clone())),
            Some(SourceGeometry::Dataset {
                dataset_id, filter, ..
            }) => {
                let descriptor = find_auxiliary(dataset_id, auxiliary).map_err(to_sieve)?;
                Some(SourceJob::Dataset {
                    reader: self.reader_for(descriptor)?,
                    filter: filter
                        .clone()
                        .or_else(|| descriptor.current_filter().map(str::to_string)),
                    descriptor: descriptor.clone(),
                })
            }
        };
        Ok(Job {
            spec: spec.clone(),
            target: target.clone(),
            target_reader: self.reader_for(target)?,
            source,
            cancel_check_interval: self.settings.cancel_check_interval.max(1),
            classifier: self.classifier.clone(),
        })
    }

    #[instrument(skip_all, fields(dataset = %target.id))]
    async fn run(
        &self,
        spec: &FilterSpec,
        target: &DatasetDescriptor,
        auxiliary: &[DatasetDescriptor],
        cancel: &CancelToken,
    ) -> Result<FilterResult> {
        let job = self.prepare(spec, target, auxiliary)?;
        let token = cancel.clone();
        let evaluated = tokio::task::spawn_blocking(move || evaluate_step(job, &token))
            .await
            .map_err(join_error)??;
        for warning in evaluated.warnings {
            add_warning(warning);
        }
        Ok(evaluated.result)
    }
}

/// Looks at the cancel signal once every `interval` features.
struct Checkpoint<'a> {
    cancel: &'a CancelToken,
    interval: usize,
    seen: usize,
}

impl<'a> Checkpoint<'a> {
    fn new(cancel: &'a CancelToken, interval: usize) -> Self {
        Self {
            cancel,
            interval: interval.max(1),
            seen: 0,
        }
    }

    fn tick(&mut self) -> Result<()> {
        let due = self.seen % self.interval == 0;
        self.seen += 1;
        if due {
            self.cancel.check()?;
        }
        Ok(())
    }
}

fn parse_condition(text: Option<&str>) -> Result<Option<Condition>> {
    text.map(Condition::parse).transpose().map_err(to_sieve)
}

/// Repair and buffer one source geometry. `None` when nothing is left.
fn prepare_source_geometry(wkt: &str, distance: Option<f64>) -> Result<Option<Geometry<f64>>> {
    let repaired = repair(parse_wkt(wkt)?)?;
    let result = match (repaired, distance) {
        (Repaired::Valid(g), Some(d)) if d != 0.0 => buffer_geometry(&g, d),
        (other, _) => other,
    };
    Ok(result.into_geometry())
}

/// Source geometries ready for predicate evaluation; `None` when every
/// source eroded away.
fn collect_sources(
    job: &Job,
    cancel: &CancelToken,
    warnings: &mut Vec<String>,
) -> Result<Option<Vec<Geometry<f64>>>> {
    let buffer = job.spec.effective_buffer();
    let Some(source) = job.source.as_ref() else {
        return Ok(Some(Vec::new()));
    };

    match source {
        SourceJob::Literal(wkts) => {
            let distance = match buffer.map(|b| &b.distance) {
                Some(BufferDistance::Expression(_)) => {
                    return Err(to_sieve(SqlGenError::InvalidBuffer(
                        "an expression buffer needs a dataset source".to_string(),
                    )))
                }
                Some(BufferDistance::Constant(d)) => Some(*d),
                None => None,
            };
            let prepared = prepare_literals(wkts, distance);
            for skipped in &prepared.skipped {
                warnings.push(format!("Skipped source geometry: {}", skipped.message));
            }
            if prepared.all_failed() {
                return Err(prepared.skipped.into_iter().next().unwrap_or_else(|| {
                    SieveError::new(ErrorCode::InvalidGeometry, "No usable source geometry")
                }));
            }
            Ok((!prepared.is_empty()).then_some(prepared.geometries))
        }
        SourceJob::Dataset {
            descriptor,
            reader,
            filter,
        } => {
            let filter = parse_condition(filter.as_deref())?;
            let expression = match buffer.map(|b| &b.distance) {
                Some(BufferDistance::Expression(text)) => Some(Condition::parse(text).map_err(to_sieve)?),
                _ => None,
            };
            let constant = buffer.and_then(|b| b.constant_distance());

            let mut geometries = Vec::new();
            let mut skipped = 0usize;
            let mut checkpoint = Checkpoint::new(cancel, job.cancel_check_interval);
            for feature in reader.read_features(descriptor)? {
                checkpoint.tick()?;
                if let Some(filter) = &filter {
                    if !filter.matches(&feature.attributes).map_err(to_sieve)? {
                        continue;
                    }
                }
                let Some(wkt) = feature.geometry.as_deref() else {
                    continue;
                };
                let distance = match &expression {
                    Some(expr) => match expr.evaluate(&feature.attributes).map_err(to_sieve)?.as_f64() {
                        Some(d) if d.is_finite() => Some(d),
                        _ => {
                            warnings.push(format!(
                                "Source feature {} has no numeric buffer distance; skipped",
                                feature.id
                            ));
                            continue;
                        }
                    },
                    None => constant,
                };
                match prepare_source_geometry(wkt, distance) {
                    Ok(Some(g)) => geometries.push(g),
                    Ok(None) => {}
                    Err(_) => skipped += 1,
                }
            }
            if skipped > 0 {
                warnings.push(format!(
                    "Skipped {} source geometries of '{}' that could not be repaired",
                    skipped, descriptor.id
                ));
            }
            Ok((!geometries.is_empty()).then_some(geometries))
        }
    }
}

/// The applied filter as an evaluable condition. A spatial filter left
/// behind by a database backend cannot be evaluated here; only its
/// attribute part is kept.
fn applied_condition(job: &Job, warnings: &mut Vec<String>) -> Result<Option<Condition>> {
    let Some(applied) = job.target.current_filter() else {
        return Ok(None);
    };
    match job.classifier.classify(applied) {
        FilterClass::Empty => Ok(None),
        FilterClass::Spatial => {
            warnings.push(
                "The applied spatial filter cannot be evaluated in-process; only its attribute part is kept"
                    .to_string(),
            );
            parse_condition(job.classifier.retained_attribute(applied).as_deref())
        }
        FilterClass::KeyMembership | FilterClass::Attribute => parse_condition(Some(applied)),
    }
}

/// Whether the candidate satisfies any predicate against any source.
/// `Err(())` when its geometry is unusable.
fn spatial_match(
    predicates: &BTreeSet<SpatialPredicate>,
    wkt: Option<&str>,
    sources: &[Geometry<f64>],
) -> std::result::Result<bool, ()> {
    let Some(wkt) = wkt else {
        return Ok(false);
    };
    let geometry = parse_wkt(wkt).and_then(repair).map_err(|_| ())?;
    Ok(match geometry {
        Repaired::Valid(candidate) => evaluate_any(predicates, &candidate, sources),
        Repaired::Empty => false,
    })
}

fn evaluate_step(job: Job, cancel: &CancelToken) -> Result<Evaluated> {
    let kind = BackendKind::Fallback;
    let mut warnings = Vec::new();

    let condition = parse_condition(job.spec.condition_for(kind))?;
    if job.spec.source.is_some() && job.spec.predicates.is_empty() {
        return Err(to_sieve(SqlGenError::NoPredicates));
    }
    let spatial = job.source.is_some();
    if !spatial && condition.is_none() {
        return Err(SieveError::expression(
            "The filter has neither an attribute condition nor a spatial source",
        ));
    }

    let op = job.spec.combine;
    let sources = collect_sources(&job, cancel, &mut warnings)?;
    // With nothing left of the source only OR and AND NOT can keep features.
    let eroded = sources.is_none();
    if eroded {
        debug!(target: "fallback", operator = %op, "Every source geometry eroded away");
        if matches!(op, CombineOperator::Replace | CombineOperator::And) {
            return Ok(Evaluated {
                result: step_result(kind, String::new(), Matched::Ids(FeatureIdSet::new())),
                warnings,
            });
        }
    }
    let sources = sources.unwrap_or_default();

    let applied = applied_condition(&job, &mut warnings)?;
    let key_column = job
        .target
        .primary_key
        .as_ref()
        .map(|k| k.column.clone())
        .unwrap_or_else(|| DEFAULT_KEY_COLUMN.to_string());

    let features = job.target_reader.read_features(&job.target)?;
    let total = features.len();
    let mut ids = FeatureIdSet::new();
    let mut unusable = 0usize;

    let mut checkpoint = Checkpoint::new(cancel, job.cancel_check_interval);
    for feature in features {
        checkpoint.tick()?;
        let Feature {
            id,
            geometry,
            mut attributes,
        } = feature;
        attributes
            .entry(key_column.clone())
            .or_insert_with(|| id_value(&id));

        let mut new = match &condition {
            Some(c) => c.matches(&attributes).map_err(to_sieve)?,
            None => true,
        };
        if new && spatial {
            new = !eroded
                && match spatial_match(&job.spec.predicates, geometry.as_deref(), &sources) {
                    Ok(hit) => hit,
                    Err(()) => {
                        unusable += 1;
                        false
                    }
                };
        }

        let keep = match &applied {
            Some(previous) => op.combine(previous.matches(&attributes).map_err(to_sieve)?, new),
            None if op == CombineOperator::AndNot => !new,
            None => new,
        };
        if keep {
            ids.insert(id);
        }
    }

    if unusable > 0 {
        warnings.push(format!(
            "Skipped {} features of '{}' whose geometry could not be repaired",
            unusable, job.target.id
        ));
    }
    debug!(target: "fallback", scanned = total, matched = ids.len(), "In-process step evaluated");

    let filter = key_membership(&key_column, &ids).map_err(to_sieve)?;
    Ok(Evaluated {
        result: step_result(kind, filter, Matched::Ids(ids)),
        warnings,
    })
}

fn id_value(id: &FeatureId) -> Value {
    match id {
        FeatureId::Int(i) => Value::from(*i),
        FeatureId::Text(s) => Value::from(s.as_str()),
    }
}

#[async_trait]
impl BackendPort for FallbackBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fallback
    }

    fn supports_dataset(&self, dataset: &DatasetDescriptor) -> bool {
        self.settings.enabled && self.readers.resolve(dataset).is_some()
    }

    async fn execute(
        &self,
        spec: &FilterSpec,
        target: &DatasetDescriptor,
        auxiliary: &[DatasetDescriptor],
        cancel: &CancelToken,
    ) -> FilterResult {
        run_normalized(self.kind(), self.run(spec, target, auxiliary, cancel)).await
    }

    async fn cleanup(&self, _dataset: &DatasetDescriptor) {}
}

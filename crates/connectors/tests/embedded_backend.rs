use std::sync::Arc;
use std::time::Duration;

use geosieve_common::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use geosieve_common::config::{EmbeddedSettings, RetrySettings, StepCacheSettings};
use geosieve_common::step_cache::StepCache;
use geosieve_common::{
    BufferSpec, CancelToken, CombineOperator, DatasetDescriptor, FeatureId, FeatureIdSet,
    FilterResult, FilterSpec, FilterStatus, ProviderKind, SourceGeometry, SpatialPredicate,
};
use geosieve_connectors::backends::sql::sqlite::SpatialSupport;
use geosieve_connectors::backends::EmbeddedBackend;
use geosieve_connectors::BackendPort;
use geosieve_sql::{FilterClassifier, MATCH_NOTHING};
use rusqlite::Connection;
use tempfile::TempDir;

const SQUARE: &str = "POLYGON((0 0, 5 0, 5 5, 0 5, 0 0))";

struct Fixture {
    _dir: TempDir,
    parcels: DatasetDescriptor,
    zones: DatasetDescriptor,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("city.sqlite");
    let conn = Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE parcels (fid INTEGER PRIMARY KEY, kind TEXT, geom TEXT);
         INSERT INTO parcels VALUES (1, 'a', 'POINT(1 1)');
         INSERT INTO parcels VALUES (2, 'b', 'POINT(3 3)');
         INSERT INTO parcels VALUES (3, 'a', 'POINT(50 50)');
         CREATE TABLE zones (zid INTEGER PRIMARY KEY, width REAL, geom TEXT);
         INSERT INTO zones VALUES (1, 2.0, 'POLYGON((0 0, 2 0, 2 2, 0 2, 0 0))');",
    )
    .unwrap();
    let source = path.to_string_lossy().into_owned();
    Fixture {
        parcels: DatasetDescriptor::new("parcels", ProviderKind::Spatialite, source.clone(), "parcels")
            .with_primary_key("fid", true),
        zones: DatasetDescriptor::new("zones", ProviderKind::Spatialite, source, "zones")
            .with_primary_key("zid", true),
        _dir: dir,
    }
}

fn backend_with(retry: RetrySettings) -> EmbeddedBackend {
    backend_from(EmbeddedSettings::default(), retry)
}

fn backend_from(settings: EmbeddedSettings, retry: RetrySettings) -> EmbeddedBackend {
    EmbeddedBackend::new(
        &settings,
        retry,
        SpatialSupport::InProcess,
        Arc::new(StepCache::new(&StepCacheSettings::default())),
        Arc::new(CircuitBreaker::new(CircuitBreakerConfig::from_settings(
            "embedded",
            &Default::default(),
        ))),
        FilterClassifier::default(),
    )
    .unwrap()
}

fn backend() -> EmbeddedBackend {
    backend_with(RetrySettings::default())
}

fn ids(values: &[i64]) -> FeatureIdSet {
    values.iter().copied().map(FeatureId::Int).collect()
}

fn in_square() -> FilterSpec {
    FilterSpec::new()
        .with_predicate(SpatialPredicate::Intersects)
        .with_literal_source([SQUARE])
}

/// The dataset as it looks after `result` was applied.
fn applied(target: &DatasetDescriptor, result: &FilterResult) -> DatasetDescriptor {
    target
        .clone()
        .with_applied_filter(result.filter_text.clone().unwrap())
}

#[tokio::test]
async fn test_attribute_only_step() {
    let fx = fixture();
    let result = backend()
        .execute(
            &FilterSpec::new().with_condition("kind = 'a'"),
            &fx.parcels,
            &[],
            &CancelToken::new(),
        )
        .await;
    assert_eq!(result.status, FilterStatus::Success, "{:?}", result.error);
    assert_eq!(result.filter_text.as_deref(), Some("kind = 'a'"));
    assert_eq!(result.ids(), Some(&ids(&[1, 3])));
}

#[tokio::test]
async fn test_and_chain_hits_cache() {
    let fx = fixture();
    let backend = backend();

    let first = backend
        .execute(&in_square(), &fx.parcels, &[], &CancelToken::new())
        .await;
    assert_eq!(first.ids(), Some(&ids(&[1, 2])));
    assert_eq!((first.step, first.cache_hit), (1, false));
    assert_eq!(first.filter_text.as_deref(), Some(r#""fid" IN (1, 2)"#));

    let second_spec = in_square()
        .with_condition("kind = 'a'")
        .with_combine(CombineOperator::And);
    let second = backend
        .execute(&second_spec, &applied(&fx.parcels, &first), &[], &CancelToken::new())
        .await;
    assert_eq!(second.ids(), Some(&ids(&[1])));
    assert_eq!((second.step, second.cache_hit), (2, true));
    // The previous membership list is replaced, not nested.
    assert_eq!(second.filter_text.as_deref(), Some(r#""fid" IN (1)"#));
}

#[tokio::test]
async fn test_or_chain_unions() {
    let fx = fixture();
    let backend = backend();

    let first = backend
        .execute(
            &in_square().with_condition("kind = 'b'"),
            &fx.parcels,
            &[],
            &CancelToken::new(),
        )
        .await;
    assert_eq!(first.ids(), Some(&ids(&[2])));

    let second = backend
        .execute(
            &in_square()
                .with_condition("kind = 'a'")
                .with_combine(CombineOperator::Or),
            &applied(&fx.parcels, &first),
            &[],
            &CancelToken::new(),
        )
        .await;
    assert_eq!(second.ids(), Some(&ids(&[1, 2])));
    assert_eq!((second.step, second.cache_hit), (2, true));
}

#[tokio::test]
async fn test_and_not_chain_subtracts() {
    let fx = fixture();
    let backend = backend();

    let first = backend
        .execute(&in_square(), &fx.parcels, &[], &CancelToken::new())
        .await;
    let second = backend
        .execute(
            &in_square()
                .with_condition("kind = 'b'")
                .with_combine(CombineOperator::AndNot),
            &applied(&fx.parcels, &first),
            &[],
            &CancelToken::new(),
        )
        .await;
    assert_eq!(second.ids(), Some(&ids(&[1])));
    assert_eq!(second.step, 2);
}

#[tokio::test]
async fn test_and_not_without_chain_keeps_outside_features() {
    let fx = fixture();
    let result = backend()
        .execute(
            &in_square().with_combine(CombineOperator::AndNot),
            &fx.parcels,
            &[],
            &CancelToken::new(),
        )
        .await;
    assert_eq!(result.ids(), Some(&ids(&[3])));
    assert_eq!(result.step, 1);
}

#[tokio::test]
async fn test_changed_source_restarts_chain() {
    let fx = fixture();
    let backend = backend();

    let first = backend
        .execute(&in_square(), &fx.parcels, &[], &CancelToken::new())
        .await;
    let moved = FilterSpec::new()
        .with_predicate(SpatialPredicate::Intersects)
        .with_literal_source(["POLYGON((40 40, 60 40, 60 60, 40 60, 40 40))"])
        .with_combine(CombineOperator::And);
    let second = backend
        .execute(&moved, &applied(&fx.parcels, &first), &[], &CancelToken::new())
        .await;

    // Replaced, not intersected with the stale step.
    assert_eq!(second.ids(), Some(&ids(&[3])));
    assert_eq!((second.step, second.cache_hit), (1, false));
    assert!(second
        .warnings
        .iter()
        .any(|w| w.contains("starting a new filter chain")));
}

#[tokio::test]
async fn test_attribute_filter_is_retained() {
    let fx = fixture();
    let target = fx.parcels.clone().with_applied_filter("kind = 'a'");
    let result = backend()
        .execute(&in_square(), &target, &[], &CancelToken::new())
        .await;
    assert_eq!(
        result.filter_text.as_deref(),
        Some(r#"(kind = 'a') AND ("fid" IN (1, 2))"#)
    );
    assert_eq!(result.ids(), Some(&ids(&[1])));
}

#[tokio::test]
async fn test_eroded_source_is_empty() {
    let fx = fixture();
    let spec = FilterSpec::new()
        .with_predicate(SpatialPredicate::Intersects)
        .with_literal_source(["POLYGON((0 0, 30 0, 30 500, 0 500, 0 0))"])
        .with_buffer(BufferSpec::constant(-60.0));
    let result = backend()
        .execute(&spec, &fx.parcels, &[], &CancelToken::new())
        .await;
    assert_eq!(result.status, FilterStatus::Empty);
    assert_eq!(result.filter_text.as_deref(), Some(MATCH_NOTHING));
    assert!(result.error.is_none());
}

fn eroded_strip() -> FilterSpec {
    FilterSpec::new()
        .with_predicate(SpatialPredicate::Intersects)
        .with_literal_source(["POLYGON((0 0, 30 0, 30 500, 0 500, 0 0))"])
        .with_buffer(BufferSpec::constant(-60.0))
}

#[tokio::test]
async fn test_eroded_source_or_keeps_applied_filter() {
    let fx = fixture();
    let target = fx.parcels.clone().with_applied_filter("kind = 'a'");
    let result = backend()
        .execute(
            &eroded_strip().with_combine(CombineOperator::Or),
            &target,
            &[],
            &CancelToken::new(),
        )
        .await;
    assert_eq!(result.status, FilterStatus::Success, "{:?}", result.error);
    assert_eq!(result.filter_text.as_deref(), Some("kind = 'a'"));
    assert_eq!(result.ids(), Some(&ids(&[1, 3])));
}

#[tokio::test]
async fn test_eroded_source_and_not_keeps_previous_step() {
    let fx = fixture();
    let backend = backend();

    let first = backend
        .execute(&in_square(), &fx.parcels, &[], &CancelToken::new())
        .await;
    let second = backend
        .execute(
            &eroded_strip().with_combine(CombineOperator::AndNot),
            &applied(&fx.parcels, &first),
            &[],
            &CancelToken::new(),
        )
        .await;
    assert_eq!(second.status, FilterStatus::Success, "{:?}", second.error);
    assert_eq!(second.ids(), Some(&ids(&[1, 2])));
    assert_eq!(second.filter_text, first.filter_text);
}

#[tokio::test]
async fn test_eroded_source_and_not_alone_keeps_everything() {
    let fx = fixture();
    let result = backend()
        .execute(
            &eroded_strip().with_combine(CombineOperator::AndNot),
            &fx.parcels,
            &[],
            &CancelToken::new(),
        )
        .await;
    assert_eq!(result.status, FilterStatus::Success, "{:?}", result.error);
    assert_eq!(result.ids(), Some(&ids(&[1, 2, 3])));
}

#[tokio::test]
async fn test_failed_step_does_not_advance_chain() {
    let fx = fixture();
    let read_only = DatasetDescriptor::new(
        "parcels",
        ProviderKind::Spatialite,
        format!("file:{}?mode=ro", fx.parcels.source),
        "parcels",
    )
    .with_primary_key("fid", true);
    let backend = backend_from(
        EmbeddedSettings {
            inline_id_limit: 1,
            ..Default::default()
        },
        RetrySettings::default(),
    );

    // Two matches need a staging table, which a read-only file refuses.
    let first = backend
        .execute(&in_square(), &read_only, &[], &CancelToken::new())
        .await;
    assert_eq!(first.status, FilterStatus::Error);
    assert!(backend.staged_tables("parcels").is_empty());

    let second = backend
        .execute(
            &in_square()
                .with_condition("kind = 'a'")
                .with_combine(CombineOperator::And),
            &read_only,
            &[],
            &CancelToken::new(),
        )
        .await;
    assert_eq!(second.status, FilterStatus::Success, "{:?}", second.error);
    assert_eq!(second.ids(), Some(&ids(&[1])));
    assert_eq!((second.step, second.cache_hit), (1, false));
}

#[tokio::test]
async fn test_repeated_step_is_idempotent() {
    let fx = fixture();
    let backend = backend();
    let spec = in_square().with_condition("kind = 'a'");

    let first = backend
        .execute(&spec, &fx.parcels, &[], &CancelToken::new())
        .await;
    let again = backend
        .execute(&spec, &fx.parcels, &[], &CancelToken::new())
        .await;
    assert_eq!(first.ids(), Some(&ids(&[1])));
    assert_eq!(again.ids(), first.ids());
    assert_eq!(again.filter_text, first.filter_text);
    assert_eq!((again.step, again.cache_hit), (1, false));
}

#[tokio::test]
async fn test_dataset_source_with_expression_buffer() {
    let fx = fixture();
    let by_zone = FilterSpec::new()
        .with_predicate(SpatialPredicate::Intersects)
        .with_source(SourceGeometry::Dataset {
            dataset_id: "zones".to_string(),
            filter: None,
            revision: 0,
        });
    let backend = backend();

    let plain = backend
        .execute(&by_zone, &fx.parcels, &[fx.zones.clone()], &CancelToken::new())
        .await;
    assert_eq!(plain.ids(), Some(&ids(&[1])), "{:?}", plain.error);

    let buffered = by_zone.with_buffer(BufferSpec::expression("width"));
    let result = backend
        .execute(&buffered, &fx.parcels, &[fx.zones.clone()], &CancelToken::new())
        .await;
    assert_eq!(result.ids(), Some(&ids(&[1, 2])), "{:?}", result.error);
}

#[tokio::test]
async fn test_locked_database_is_retried() {
    let fx = fixture();
    let locker = Connection::open(&fx.parcels.source).unwrap();
    locker.execute_batch("BEGIN EXCLUSIVE").unwrap();
    let release = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(250));
        locker.execute_batch("COMMIT").unwrap();
    });

    let result = backend()
        .execute(
            &FilterSpec::new().with_condition("kind = 'b'"),
            &fx.parcels,
            &[],
            &CancelToken::new(),
        )
        .await;
    release.join().unwrap();

    assert_eq!(result.status, FilterStatus::Success, "{:?}", result.error);
    assert_eq!(result.ids(), Some(&ids(&[2])));
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].starts_with("Database was locked"));
}

#[tokio::test]
async fn test_lock_exhaustion_surfaces_error() {
    let fx = fixture();
    let locker = Connection::open(&fx.parcels.source).unwrap();
    locker.execute_batch("BEGIN EXCLUSIVE").unwrap();

    let retry = RetrySettings {
        max_attempts: 2,
        base_delay_ms: 10,
        max_delay_ms: 10,
    };
    let result = backend_with(retry)
        .execute(
            &FilterSpec::new().with_condition("kind = 'b'"),
            &fx.parcels,
            &[],
            &CancelToken::new(),
        )
        .await;
    locker.execute_batch("COMMIT").unwrap();

    assert_eq!(result.status, FilterStatus::Error);
    assert!(result.error.unwrap().is_lock());
}

#[tokio::test]
async fn test_cancellation_while_locked() {
    let fx = fixture();
    let locker = Connection::open(&fx.parcels.source).unwrap();
    locker.execute_batch("BEGIN EXCLUSIVE").unwrap();

    let retry = RetrySettings {
        max_attempts: 20,
        base_delay_ms: 50,
        max_delay_ms: 50,
    };
    let backend = backend_with(retry);
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        trigger.cancel();
    });

    let result = backend.execute(&in_square(), &fx.parcels, &[], &cancel).await;
    locker.execute_batch("COMMIT").unwrap();

    assert_eq!(result.status, FilterStatus::Cancelled);
    assert!(backend.staged_tables("parcels").is_empty());
}

#[tokio::test]
async fn test_in_process_functions_reject_geopackage() {
    let backend = backend();
    let gpkg = DatasetDescriptor::new("g", ProviderKind::GeoPackage, "/data/city.gpkg", "g");
    assert!(!backend.supports_dataset(&gpkg));
    let pg = DatasetDescriptor::new("p", ProviderKind::Postgres, "host=db", "p");
    assert!(!backend.supports_dataset(&pg));
}

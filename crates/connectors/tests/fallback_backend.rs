use std::sync::Arc;

use geosieve_common::config::FallbackSettings;
use geosieve_common::{
    BackendKind, BufferSpec, CancelToken, CombineOperator, DatasetDescriptor, FeatureId,
    FeatureIdSet, FilterSpec, FilterStatus, ProviderKind, SourceGeometry, SpatialPredicate,
};
use geosieve_connectors::backends::FallbackBackend;
use geosieve_connectors::readers::MemoryReader;
use geosieve_connectors::{BackendPort, Feature, FeatureReader, ReaderRegistry};
use geosieve_error::{ErrorCode, Result};
use serde_json::json;

fn ids(values: &[i64]) -> FeatureIdSet {
    values.iter().copied().map(FeatureId::Int).collect()
}

fn trees() -> Vec<Feature> {
    vec![
        Feature::new(1_i64, Some("POINT(1 1)")).with_attribute("species", "oak"),
        Feature::new(2_i64, Some("POINT(3 3)")).with_attribute("species", "elm"),
        Feature::new(3_i64, Some("POINT(50 50)")).with_attribute("species", "oak"),
        Feature::new(4_i64, None).with_attribute("species", "oak"),
    ]
}

fn parks() -> Vec<Feature> {
    vec![
        Feature::new(10_i64, Some("POLYGON((0 0, 2 0, 2 2, 0 2, 0 0))"))
            .with_attribute("margin", 2.0)
            .with_attribute("open", true),
        Feature::new(11_i64, Some("POLYGON((49 49, 51 49, 51 51, 49 51, 49 49))"))
            .with_attribute("margin", json!(null))
            .with_attribute("open", false),
    ]
}

fn backend() -> FallbackBackend {
    let memory = Arc::new(MemoryReader::new());
    memory.insert("trees", trees());
    memory.insert("parks", parks());
    let registry = ReaderRegistry::new();
    registry.register("trees", memory.clone());
    registry.register("parks", memory);
    FallbackBackend::new(&FallbackSettings::default(), Arc::new(registry)).unwrap()
}

fn trees_dataset() -> DatasetDescriptor {
    DatasetDescriptor::new("trees", ProviderKind::File, "memory://trees", "trees")
}

fn parks_dataset() -> DatasetDescriptor {
    DatasetDescriptor::new("parks", ProviderKind::File, "memory://parks", "parks")
}

fn in_square() -> FilterSpec {
    FilterSpec::new()
        .with_predicate(SpatialPredicate::Intersects)
        .with_literal_source(["POLYGON((0 0, 5 0, 5 5, 0 5, 0 0))"])
}

fn by_parks(filter: Option<&str>) -> FilterSpec {
    FilterSpec::new()
        .with_predicate(SpatialPredicate::Within)
        .with_source(SourceGeometry::Dataset {
            dataset_id: "parks".to_string(),
            filter: filter.map(str::to_string),
            revision: 0,
        })
}

#[tokio::test]
async fn test_literal_source_with_condition() {
    let result = backend()
        .execute(
            &in_square().with_condition("species = 'oak'"),
            &trees_dataset(),
            &[],
            &CancelToken::new(),
        )
        .await;
    assert_eq!(result.status, FilterStatus::Success, "{:?}", result.error);
    assert_eq!(result.backend, BackendKind::Fallback);
    assert_eq!(result.ids(), Some(&ids(&[1])));
    assert_eq!(result.filter_text.as_deref(), Some(r#""fid" IN (1)"#));
}

#[tokio::test]
async fn test_declared_key_names_the_filter_column() {
    let target = trees_dataset().with_primary_key("tree_id", true);
    let result = backend()
        .execute(&in_square(), &target, &[], &CancelToken::new())
        .await;
    assert_eq!(result.filter_text.as_deref(), Some(r#""tree_id" IN (1, 2)"#));
}

#[tokio::test]
async fn test_dataset_source_and_source_filter() {
    let backend = backend();
    let aux = [parks_dataset()];

    let all = backend
        .execute(&by_parks(None), &trees_dataset(), &aux, &CancelToken::new())
        .await;
    assert_eq!(all.ids(), Some(&ids(&[1, 3])));

    let open_only = backend
        .execute(&by_parks(Some("open")), &trees_dataset(), &aux, &CancelToken::new())
        .await;
    assert_eq!(open_only.ids(), Some(&ids(&[1])));
}

#[tokio::test]
async fn test_per_feature_buffer_expression() {
    let spec = by_parks(None)
        .with_buffer(BufferSpec::expression("margin"))
        .with_combine(CombineOperator::Replace);
    let result = backend()
        .execute(&spec, &trees_dataset(), &[parks_dataset()], &CancelToken::new())
        .await;
    // Park 11 has no margin and is skipped with a warning.
    assert_eq!(result.ids(), Some(&ids(&[1, 2])), "{:?}", result.error);
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].contains("no numeric buffer distance"));
}

#[tokio::test]
async fn test_combines_with_applied_filter() {
    let backend = backend();
    let cases = [
        (CombineOperator::And, vec![1]),
        (CombineOperator::Or, vec![1, 2, 3, 4]),
        (CombineOperator::AndNot, vec![3, 4]),
        (CombineOperator::Replace, vec![1, 2]),
    ];
    for (op, expected) in cases {
        let target = trees_dataset().with_applied_filter("species = 'oak'");
        let result = backend
            .execute(&in_square().with_combine(op), &target, &[], &CancelToken::new())
            .await;
        assert_eq!(result.ids(), Some(&ids(&expected)), "{}", op);
    }
}

#[tokio::test]
async fn test_chains_on_previous_membership_filter() {
    let backend = backend();
    let target = trees_dataset().with_applied_filter(r#""fid" IN (2, 3)"#);
    let result = backend
        .execute(
            &in_square().with_combine(CombineOperator::And),
            &target,
            &[],
            &CancelToken::new(),
        )
        .await;
    assert_eq!(result.ids(), Some(&ids(&[2])));
}

#[tokio::test]
async fn test_and_not_without_applied_filter() {
    let result = backend()
        .execute(
            &in_square().with_combine(CombineOperator::AndNot),
            &trees_dataset(),
            &[],
            &CancelToken::new(),
        )
        .await;
    assert_eq!(result.ids(), Some(&ids(&[3, 4])));
}

#[tokio::test]
async fn test_spatial_applied_filter_keeps_attribute_part() {
    let target = trees_dataset().with_applied_filter(
        "(species = 'oak') AND (ST_Intersects(geom, ST_GeomFromText('POINT(0 0)')))",
    );
    let result = backend()
        .execute(
            &in_square().with_combine(CombineOperator::And),
            &target,
            &[],
            &CancelToken::new(),
        )
        .await;
    assert_eq!(result.ids(), Some(&ids(&[1])));
    assert_eq!(result.warnings.len(), 1);
}

#[tokio::test]
async fn test_no_match_is_empty() {
    let spec = FilterSpec::new()
        .with_predicate(SpatialPredicate::Intersects)
        .with_literal_source(["POINT(1000 1000)"]);
    let result = backend()
        .execute(&spec, &trees_dataset(), &[], &CancelToken::new())
        .await;
    assert_eq!(result.status, FilterStatus::Empty);
    assert_eq!(result.filter_text.as_deref(), Some("0 = 1"));
}

#[tokio::test]
async fn test_failures_are_reported_as_results() {
    let backend = backend();

    let unknown = DatasetDescriptor::new("ghost", ProviderKind::File, "/data/ghost.shp", "ghost");
    assert!(!backend.supports_dataset(&unknown));
    let result = backend
        .execute(&in_square(), &unknown, &[], &CancelToken::new())
        .await;
    assert_eq!(result.error.unwrap().code, ErrorCode::UnsupportedDataset);

    let result = backend
        .execute(
            &FilterSpec::new().with_condition("species = "),
            &trees_dataset(),
            &[],
            &CancelToken::new(),
        )
        .await;
    assert_eq!(result.error.unwrap().code, ErrorCode::InvalidExpression);

    let result = backend
        .execute(&by_parks(None), &trees_dataset(), &[], &CancelToken::new())
        .await;
    assert_eq!(result.status, FilterStatus::Error);

    let garbage = FilterSpec::new()
        .with_predicate(SpatialPredicate::Intersects)
        .with_literal_source(["POLYGON((0 0, 1"]);
    let result = backend
        .execute(&garbage, &trees_dataset(), &[], &CancelToken::new())
        .await;
    assert_eq!(result.error.unwrap().code, ErrorCode::InvalidGeometry);
}

#[tokio::test]
async fn test_geojson_file_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wells.geojson");
    std::fs::write(
        &path,
        json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "properties": {"code": "w1", "depth": 12},
                 "geometry": {"type": "Point", "coordinates": [1, 1]}},
                {"type": "Feature", "properties": {"code": "w2", "depth": 40},
                 "geometry": {"type": "Point", "coordinates": [2, 2]}}
            ]
        })
        .to_string(),
    )
    .unwrap();
    let target = DatasetDescriptor::new("wells", ProviderKind::File, path.to_string_lossy(), "wells")
        .with_primary_key("code", false);
    let backend = FallbackBackend::new(&FallbackSettings::default(), Arc::new(ReaderRegistry::new()))
        .unwrap();
    assert!(backend.supports_dataset(&target));

    let result = backend
        .execute(
            &in_square().with_condition("depth > 20"),
            &target,
            &[],
            &CancelToken::new(),
        )
        .await;
    assert_eq!(result.filter_text.as_deref(), Some(r#""code" IN ('w2')"#));
}

fn eroded_strip() -> FilterSpec {
    FilterSpec::new()
        .with_predicate(SpatialPredicate::Intersects)
        .with_literal_source(["POLYGON((0 0, 30 0, 30 500, 0 500, 0 0))"])
        .with_buffer(BufferSpec::constant(-60.0))
}

#[tokio::test]
async fn test_eroded_source_or_keeps_applied_filter() {
    let target = trees_dataset().with_applied_filter("species = 'oak'");
    let result = backend()
        .execute(
            &eroded_strip().with_combine(CombineOperator::Or),
            &target,
            &[],
            &CancelToken::new(),
        )
        .await;
    assert_eq!(result.status, FilterStatus::Success, "{:?}", result.error);
    assert_eq!(result.ids(), Some(&ids(&[1, 3, 4])));
}

#[tokio::test]
async fn test_eroded_source_and_not() {
    let backend = backend();
    let spec = eroded_strip().with_combine(CombineOperator::AndNot);

    let applied = trees_dataset().with_applied_filter("species = 'elm'");
    let kept = backend.execute(&spec, &applied, &[], &CancelToken::new()).await;
    assert_eq!(kept.ids(), Some(&ids(&[2])));

    let alone = backend
        .execute(&spec, &trees_dataset(), &[], &CancelToken::new())
        .await;
    assert_eq!(alone.ids(), Some(&ids(&[1, 2, 3, 4])));

    let and = backend
        .execute(
            &eroded_strip().with_combine(CombineOperator::And),
            &applied,
            &[],
            &CancelToken::new(),
        )
        .await;
    assert_eq!(and.status, FilterStatus::Empty);
}

#[tokio::test]
async fn test_repeated_step_is_idempotent() {
    let backend = backend();
    let spec = in_square().with_condition("species = 'oak'");
    let target = trees_dataset();

    let first = backend.execute(&spec, &target, &[], &CancelToken::new()).await;
    let again = backend.execute(&spec, &target, &[], &CancelToken::new()).await;
    assert_eq!(first.ids(), Some(&ids(&[1])));
    assert_eq!(again.ids(), first.ids());
    assert_eq!(again.filter_text, first.filter_text);
}

/// Raises the cancel signal while the target is being read.
struct CancelOnRead {
    inner: Arc<MemoryReader>,
    cancel: CancelToken,
}

impl FeatureReader for CancelOnRead {
    fn read_features(&self, dataset: &DatasetDescriptor) -> Result<Vec<Feature>> {
        self.cancel.cancel();
        self.inner.read_features(dataset)
    }
}

#[tokio::test]
async fn test_cancelled_during_scan() {
    let memory = Arc::new(MemoryReader::new());
    memory.insert("trees", trees());
    memory.insert("parks", parks());
    let cancel = CancelToken::new();
    let registry = ReaderRegistry::new();
    registry.register("parks", memory.clone());
    registry.register(
        "trees",
        Arc::new(CancelOnRead {
            inner: memory,
            cancel: cancel.clone(),
        }),
    );
    let settings = FallbackSettings {
        cancel_check_interval: 2,
        ..Default::default()
    };
    let backend = FallbackBackend::new(&settings, Arc::new(registry)).unwrap();

    // The source scan finishes; the target scan stops at its first check.
    let result = backend
        .execute(&by_parks(None), &trees_dataset(), &[parks_dataset()], &cancel)
        .await;
    assert_eq!(result.status, FilterStatus::Cancelled);
    assert!(result.filter_text.is_none());
    assert!(result.error.unwrap().is_cancelled());
}

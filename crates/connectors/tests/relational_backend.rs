use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use geosieve_common::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use geosieve_common::config::{BreakerSettings, PoolSettings, RelationalSettings};
use geosieve_common::pool::{ConnectionPool, ManageConnection};
use geosieve_common::{
    BackendKind, BufferSpec, CancelToken, CombineOperator, DatasetDescriptor, FeatureId, FeatureIdSet, FilterSpec, FilterStatus,
    Matched, PrimaryKey, ProviderKind, SpatialPredicate,
};
use geosieve_connectors::backends::sql::postgres::{RelationalBackend, RelationalClient};
use geosieve_connectors::BackendPort;
use geosieve_error::{ErrorCode, Result, SieveError};

/// Scripted stand-in for a PostGIS server. Every statement is recorded.
#[derive(Default)]
struct FakeDb {
    statements: Mutex<Vec<String>>,
    ids: Vec<i64>,
    count: i64,
    key: Option<PrimaryKey>,
    fail_on: Option<&'static str>,
    /// Error raised by `fail_on`; defaults to a full disk.
    fail_code: Option<ErrorCode>,
    fail_count: bool,
    stall_on: Option<&'static str>,
    refuse: AtomicBool,
    connects: AtomicUsize,
}

impl FakeDb {
    fn log(&self, sql: &str) {
        self.statements.lock().unwrap().push(sql.to_string());
    }

    fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }
}

struct FakeManager(Arc<FakeDb>);

struct FakeClient(Arc<FakeDb>);

#[async_trait]
impl ManageConnection for FakeManager {
    type Connection = FakeClient;

    async fn connect(&self) -> Result<FakeClient> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        if self.0.refuse.load(Ordering::SeqCst) {
            return Err(SieveError::new(ErrorCode::ConnectionFailed, "connection refused"));
        }
        Ok(FakeClient(self.0.clone()))
    }

    async fn is_valid(&self, _conn: &mut FakeClient) -> Result<()> {
        Ok(())
    }

    fn has_broken(&self, _conn: &mut FakeClient) -> bool {
        false
    }

    fn target(&self) -> String {
        "fake://gis".to_string()
    }
}

#[async_trait]
impl RelationalClient for FakeClient {
    async fn query_ids(&mut self, sql: &str) -> Result<FeatureIdSet> {
        self.0.log(sql);
        Ok(self.0.ids.iter().copied().map(FeatureId::Int).collect())
    }

    async fn query_count(&mut self, sql: &str) -> Result<i64> {
        self.0.log(sql);
        if self.0.fail_count {
            return Err(SieveError::new(ErrorCode::QueryFailed, "canceling statement due to statement timeout"));
        }
        Ok(self.0.count)
    }

    async fn execute_in_transaction(&mut self, sql: &str) -> Result<()> {
        self.0.log(sql);
        if self.0.stall_on.is_some_and(|s| sql.starts_with(s)) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if self.0.fail_on.is_some_and(|s| sql.starts_with(s)) {
            return Err(SieveError::new(
                self.0.fail_code.unwrap_or(ErrorCode::ResourceExhausted),
                "could not extend file: No space left on device",
            ));
        }
        Ok(())
    }

    async fn primary_key(&mut self, relation: &str) -> Result<Option<PrimaryKey>> {
        self.0.log(&format!("PRIMARY KEY OF {}", relation));
        Ok(self.0.key.clone())
    }
}

fn fid() -> PrimaryKey {
    PrimaryKey {
        column: "fid".to_string(),
        numeric: true,
    }
}

async fn backend(db: &Arc<FakeDb>) -> RelationalBackend<FakeManager> {
    let pool = ConnectionPool::connect(
        FakeManager(db.clone()),
        &PoolSettings {
            min_size: 0,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::from_settings(
        "relational",
        &BreakerSettings {
            failure_threshold: 2,
            ..Default::default()
        },
    )));
    RelationalBackend::new(pool, &RelationalSettings::default(), breaker).unwrap()
}

fn roads(feature_count: u64) -> DatasetDescriptor {
    DatasetDescriptor::new("roads", ProviderKind::Postgres, "host=gis dbname=city", "roads")
        .with_feature_count(feature_count)
}

fn eroded_strip() -> FilterSpec {
    FilterSpec::new()
        .with_predicate(SpatialPredicate::Intersects)
        .with_literal_source(["POLYGON((0 0, 30 0, 30 500, 0 500, 0 0))"])
        .with_buffer(BufferSpec::constant(-60.0))
}

fn near_point() -> FilterSpec {
    FilterSpec::new()
        .with_predicate(SpatialPredicate::Intersects)
        .with_literal_source(["POINT(1 2)"])
}

#[tokio::test]
async fn test_attribute_step_uses_direct_query() {
    let db = Arc::new(FakeDb {
        ids: vec![1, 2],
        ..Default::default()
    });
    let backend = backend(&db).await;
    let target = roads(10).with_primary_key("fid", true);
    let spec = FilterSpec::new().with_condition("kind = 'road'");

    let result = backend.execute(&spec, &target, &[], &CancelToken::new()).await;

    assert_eq!(result.status, FilterStatus::Success);
    assert_eq!(result.backend, BackendKind::Relational);
    assert_eq!(result.filter_text.as_deref(), Some("kind = 'road'"));
    assert_eq!(result.matched.len(), 2);
    assert_eq!(
        db.statements(),
        vec![r#"SELECT "fid" FROM "roads" WHERE kind = 'road'"#.to_string()]
    );
}

#[tokio::test]
async fn test_previous_filter_is_combined() {
    let db = Arc::new(FakeDb {
        ids: vec![4],
        ..Default::default()
    });
    let backend = backend(&db).await;
    let target = roads(10)
        .with_primary_key("fid", true)
        .with_applied_filter("lanes > 2");
    let spec = near_point().with_combine(CombineOperator::Or);

    let result = backend.execute(&spec, &target, &[], &CancelToken::new()).await;

    let filter = result.filter_text.unwrap();
    assert!(filter.starts_with("(lanes > 2) OR ("), "{}", filter);
    assert!(filter.contains("ST_Intersects"));
    assert!(backend.views("roads").is_empty());
}

#[tokio::test]
async fn test_large_dataset_goes_through_view() {
    let db = Arc::new(FakeDb {
        count: 7,
        key: Some(fid()),
        ..Default::default()
    });
    let backend = backend(&db).await;
    let target = roads(50_000);

    let result = backend.execute(&near_point(), &target, &[], &CancelToken::new()).await;

    assert_eq!(result.status, FilterStatus::Success);
    assert_eq!(result.matched, Matched::Count(7));
    let filter = result.filter_text.unwrap();
    assert!(
        filter.starts_with(r#""fid" IN (SELECT "fid" FROM "geosieve_mv_"#),
        "{}",
        filter
    );

    let statements = db.statements();
    let kinds: Vec<&str> = statements
        .iter()
        .map(|s| s.split_whitespace().next().unwrap_or_default())
        .collect();
    assert_eq!(kinds, vec!["PRIMARY", "CREATE", "CREATE", "CLUSTER", "ANALYZE", "SELECT"]);
    assert!(statements[1].starts_with("CREATE MATERIALIZED VIEW"));
    assert!(statements[1].ends_with("WITH DATA"));
    assert!(statements[2].contains("USING GIST"));

    let views = backend.views("roads");
    assert_eq!(views.len(), 1);

    backend.cleanup(&target).await;
    assert!(backend.views("roads").is_empty());
    let last = db.statements().pop().unwrap();
    assert_eq!(last, format!("DROP MATERIALIZED VIEW IF EXISTS {}", views[0]));
}

#[tokio::test]
async fn test_view_failure_downgrades_to_direct() {
    let db = Arc::new(FakeDb {
        ids: vec![3, 5],
        key: Some(fid()),
        fail_on: Some("CREATE INDEX"),
        ..Default::default()
    });
    let backend = backend(&db).await;

    let result = backend
        .execute(&near_point(), &roads(50_000), &[], &CancelToken::new())
        .await;

    assert_eq!(result.status, FilterStatus::Success);
    assert_eq!(result.matched.len(), 2);
    assert!(result.filter_text.unwrap().contains("ST_Intersects"));
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].starts_with("Precomputed view unavailable"));

    let statements = db.statements();
    assert!(statements
        .iter()
        .any(|s| s.starts_with("DROP MATERIALIZED VIEW IF EXISTS")));
    assert!(backend.views("roads").is_empty());
}

#[tokio::test]
async fn test_view_lost_to_connection_failure_is_released_by_cleanup() {
    let db = Arc::new(FakeDb {
        ids: vec![3],
        key: Some(fid()),
        fail_on: Some("CREATE INDEX"),
        fail_code: Some(ErrorCode::ConnectionFailed),
        ..Default::default()
    });
    let backend = backend(&db).await;
    let target = roads(50_000);

    let result = backend
        .execute(&near_point(), &target, &[], &CancelToken::new())
        .await;
    assert_eq!(result.status, FilterStatus::Success, "{:?}", result.error);
    assert!(result.warnings[0].starts_with("Precomputed view unavailable"));

    let views = backend.views("roads");
    assert_eq!(views.len(), 1);
    assert!(!db
        .statements()
        .iter()
        .any(|s| s.starts_with("DROP MATERIALIZED VIEW")));

    backend.cleanup(&target).await;
    assert!(backend.views("roads").is_empty());
    assert_eq!(
        db.statements().last().unwrap(),
        &format!("DROP MATERIALIZED VIEW IF EXISTS {}", views[0])
    );
}

#[tokio::test]
async fn test_failed_step_drops_its_view() {
    let db = Arc::new(FakeDb {
        key: Some(fid()),
        fail_count: true,
        ..Default::default()
    });
    let backend = backend(&db).await;

    let result = backend
        .execute(&near_point(), &roads(50_000), &[], &CancelToken::new())
        .await;

    assert_eq!(result.status, FilterStatus::Error);
    assert!(backend.views("roads").is_empty());
    let statements = db.statements();
    let created = statements
        .iter()
        .find(|s| s.starts_with("CREATE MATERIALIZED VIEW"))
        .unwrap();
    let view = created.split_whitespace().nth(3).unwrap();
    assert_eq!(
        statements.last().unwrap(),
        &format!("DROP MATERIALIZED VIEW IF EXISTS {}", view)
    );
}

#[tokio::test]
async fn test_eroded_source_or_keeps_applied_filter() {
    let db = Arc::new(FakeDb {
        ids: vec![4, 9],
        ..Default::default()
    });
    let backend = backend(&db).await;
    let target = roads(10)
        .with_primary_key("fid", true)
        .with_applied_filter("lanes > 2");
    let spec = eroded_strip().with_combine(CombineOperator::Or);

    let result = backend.execute(&spec, &target, &[], &CancelToken::new()).await;

    assert_eq!(result.status, FilterStatus::Success, "{:?}", result.error);
    assert_eq!(result.filter_text.as_deref(), Some("lanes > 2"));
    assert_eq!(result.matched.len(), 2);
    assert_eq!(
        db.statements(),
        vec![r#"SELECT "fid" FROM "roads" WHERE lanes > 2"#.to_string()]
    );
}

#[tokio::test]
async fn test_eroded_source_and_not_keeps_applied_filter() {
    let db = Arc::new(FakeDb {
        ids: vec![4],
        ..Default::default()
    });
    let backend = backend(&db).await;
    let target = roads(10)
        .with_primary_key("fid", true)
        .with_applied_filter("lanes > 2");
    let spec = eroded_strip().with_combine(CombineOperator::AndNot);

    let result = backend.execute(&spec, &target, &[], &CancelToken::new()).await;
    assert_eq!(result.filter_text.as_deref(), Some("lanes > 2"));

    // Without an applied filter every feature is kept.
    let alone = backend
        .execute(&spec, &roads(10).with_primary_key("fid", true), &[], &CancelToken::new())
        .await;
    assert_eq!(alone.status, FilterStatus::Success);
    assert_eq!(alone.filter_text.as_deref(), Some("NOT (0 = 1)"));
}

#[tokio::test]
async fn test_eroded_source_and_matches_nothing() {
    let db = Arc::new(FakeDb {
        ids: vec![4],
        ..Default::default()
    });
    let backend = backend(&db).await;
    let target = roads(10)
        .with_primary_key("fid", true)
        .with_applied_filter("lanes > 2");
    let spec = eroded_strip().with_combine(CombineOperator::And);

    let result = backend.execute(&spec, &target, &[], &CancelToken::new()).await;
    assert_eq!(result.status, FilterStatus::Empty);
    assert_eq!(result.filter_text.as_deref(), Some("0 = 1"));
    assert!(db.statements().is_empty());
}

#[tokio::test]
async fn test_repeated_step_is_idempotent() {
    let db = Arc::new(FakeDb {
        ids: vec![1, 2],
        ..Default::default()
    });
    let backend = backend(&db).await;
    let target = roads(10).with_primary_key("fid", true);
    let spec = near_point().with_condition("kind = 'road'");

    let first = backend.execute(&spec, &target, &[], &CancelToken::new()).await;
    let again = backend.execute(&spec, &target, &[], &CancelToken::new()).await;
    assert_eq!(first.status, FilterStatus::Success);
    assert_eq!(again.filter_text, first.filter_text);
    assert_eq!(again.matched, first.matched);
    let statements = db.statements();
    assert_eq!(statements.len(), 2);
    assert_eq!(statements[0], statements[1]);
}

#[tokio::test]
async fn test_missing_key_filters_directly_with_warning() {
    let db = Arc::new(FakeDb {
        count: 12,
        ..Default::default()
    });
    let backend = backend(&db).await;

    let result = backend
        .execute(&near_point(), &roads(50_000), &[], &CancelToken::new())
        .await;

    assert_eq!(result.matched, Matched::Count(12));
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].contains("no primary key"));
    assert!(!db.statements().iter().any(|s| s.starts_with("CREATE")));
}

#[tokio::test]
async fn test_expression_error_fails_fast() {
    let db = Arc::new(FakeDb::default());
    let backend = backend(&db).await;
    let spec = FilterSpec::new().with_condition("kind = ");

    let result = backend.execute(&spec, &roads(10), &[], &CancelToken::new()).await;

    assert_eq!(result.status, FilterStatus::Error);
    assert_eq!(result.error.unwrap().code, ErrorCode::InvalidExpression);
    assert!(db.statements().is_empty());
    assert_eq!(db.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_breaker_opens_after_connection_failures() {
    let db = Arc::new(FakeDb::default());
    db.refuse.store(true, Ordering::SeqCst);
    let backend = backend(&db).await;
    let spec = FilterSpec::new().with_condition("kind = 'road'");
    let target = roads(10).with_primary_key("fid", true);

    for _ in 0..2 {
        let result = backend.execute(&spec, &target, &[], &CancelToken::new()).await;
        let err = result.error.unwrap();
        assert_eq!(err.code, ErrorCode::ConnectionFailed);
        assert!(err.triggers_fallback());
    }

    let result = backend.execute(&spec, &target, &[], &CancelToken::new()).await;
    let err = result.error.unwrap();
    assert_eq!(err.code, ErrorCode::CircuitOpen);
    assert!(err.triggers_fallback());
    assert_eq!(db.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cancellation_drops_view_under_construction() {
    let db = Arc::new(FakeDb {
        key: Some(fid()),
        stall_on: Some("CLUSTER"),
        ..Default::default()
    });
    let backend = backend(&db).await;
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let result = backend.execute(&near_point(), &roads(50_000), &[], &cancel).await;

    assert_eq!(result.status, FilterStatus::Cancelled);
    assert!(backend.views("roads").is_empty());
    let statements = db.statements();
    let created = statements
        .iter()
        .find(|s| s.starts_with("CREATE MATERIALIZED VIEW"))
        .unwrap();
    let view = created.split_whitespace().nth(3).unwrap();
    assert_eq!(
        statements.last().unwrap(),
        &format!("DROP MATERIALIZED VIEW IF EXISTS {}", view)
    );
    assert_eq!(backend.pool_stats().active, 0);
}

#[tokio::test]
async fn test_breaker_state_is_not_touched_by_expression_errors() {
    let db = Arc::new(FakeDb::default());
    let pool = ConnectionPool::connect(
        FakeManager(db.clone()),
        &PoolSettings {
            min_size: 0,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::from_settings(
        "relational",
        &BreakerSettings {
            failure_threshold: 1,
            ..Default::default()
        },
    )));
    let backend = RelationalBackend::new(pool, &RelationalSettings::default(), breaker.clone()).unwrap();

    let spec = FilterSpec::new().with_condition("((");
    let result = backend.execute(&spec, &roads(10), &[], &CancelToken::new()).await;
    assert_eq!(result.status, FilterStatus::Error);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

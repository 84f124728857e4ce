//! Relational backend: PostGIS through pooled `tokio-postgres` connections.
//!
//! Two strategies:
//! - **Direct**: the spatial clause itself is the new filter and the matching
//!   ids are read back in one query.
//! - **Precomputed view**: for datasets with at least `view_threshold`
//!   features, matching rows go into a materialized view (GiST-indexed,
//!   clustered and analyzed) and the filter becomes a key subquery over it.
//!   A view that cannot be built downgrades the request to the direct
//!   strategy with a warning.
//!
//! Views are tracked per dataset and dropped by [`BackendPort::cleanup`], or
//! immediately when the request that created them is cancelled.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use geosieve_common::circuit_breaker::CircuitBreaker;
use geosieve_common::config::{PoolSettings, RelationalSettings};
use geosieve_common::pool::{ConnectionPool, ManageConnection, PoolStats, PooledConnection};
use geosieve_common::scrubber::scrub;
use geosieve_common::warnings::add_warning;
use geosieve_common::{
    BackendKind, CancelToken, CombineOperator, DatasetDescriptor, FeatureId, FeatureIdSet,
    FilterResult, FilterSpec, Matched, PrimaryKey, ProviderKind,
};
use geosieve_error::{ErrorCategory, ErrorCode, ErrorContext, Result, SieveError};
use geosieve_sql::sanitize::quote_ident;
use geosieve_sql::{combine_filter, key_subquery, SqlDialect, MATCH_NOTHING};
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use tokio_postgres::{Client, Config, NoTls, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::common::{plan_sql_step, sql_error};
use crate::backends::{run_normalized, step_result, BackendPort};

/// The statements the relational backend needs from a connection.
#[async_trait]
pub trait RelationalClient: Send {
    /// First column of every row, read as feature ids.
    async fn query_ids(&mut self, sql: &str) -> Result<FeatureIdSet>;

    /// First column of the single row, read as an integer.
    async fn query_count(&mut self, sql: &str) -> Result<i64>;

    /// Run `sql` in a transaction of its own.
    async fn execute_in_transaction(&mut self, sql: &str) -> Result<()>;

    /// Single-column primary key of `relation` (already quoted), if any.
    async fn primary_key(&mut self, relation: &str) -> Result<Option<PrimaryKey>>;

    /// Handle for cancelling the running statement on the server.
    fn cancel_token(&self) -> Option<tokio_postgres::CancelToken> {
        None
    }
}

/// Opens `tokio-postgres` connections for one connection string.
pub struct PgManager {
    config: Config,
    target: String,
    statement_timeout_ms: u64,
}

impl PgManager {
    pub fn new(
        dataset: &DatasetDescriptor,
        settings: &RelationalSettings,
        pool: &PoolSettings,
    ) -> Result<Self> {
        let mut config = dataset.source.parse::<Config>().map_err(|e| {
            SieveError::new(
                ErrorCode::InvalidConnectionString,
                format!("Cannot parse connection string for '{}': {}", dataset.id, e),
            )
            .with_hint("Use a libpq key/value string or a postgresql:// URL")
        })?;
        if let Some(password) = &dataset.password {
            config.password(password.expose_secret());
        }
        config.connect_timeout(pool.acquire_timeout());
        config.application_name("geosieve");

        Ok(Self {
            config,
            target: scrub(&dataset.source),
            statement_timeout_ms: settings.statement_timeout_ms,
        })
    }
}

pub struct PgConnection {
    client: Client,
}

#[async_trait]
impl ManageConnection for PgManager {
    type Connection = PgConnection;

    async fn connect(&self) -> Result<PgConnection> {
        let (client, connection) = self.config.connect(NoTls).await.map_err(|e| {
            SieveError::from(e).with_context(ErrorContext::Connection {
                backend: BackendKind::Relational.as_str().to_string(),
                target: self.target.clone(),
                sqlstate: None,
            })
        })?;

        let target = self.target.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(target: "relational", %target, "Postgres connection error: {}", e);
            }
        });

        if self.statement_timeout_ms > 0 {
            client
                .batch_execute(&format!("SET statement_timeout = {}", self.statement_timeout_ms))
                .await?;
        }
        Ok(PgConnection { client })
    }

    async fn is_valid(&self, conn: &mut PgConnection) -> Result<()> {
        conn.client.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn has_broken(&self, conn: &mut PgConnection) -> bool {
        conn.client.is_closed()
    }

    fn target(&self) -> String {
        self.target.clone()
    }
}

fn read_key(row: &Row) -> Result<Option<FeatureId>> {
    if let Ok(v) = row.try_get::<_, Option<i64>>(0) {
        return Ok(v.map(FeatureId::Int));
    }
    if let Ok(v) = row.try_get::<_, Option<i32>>(0) {
        return Ok(v.map(|v| FeatureId::Int(v.into())));
    }
    if let Ok(v) = row.try_get::<_, Option<i16>>(0) {
        return Ok(v.map(|v| FeatureId::Int(v.into())));
    }
    if let Ok(v) = row.try_get::<_, Option<String>>(0) {
        return Ok(v.map(FeatureId::Text));
    }
    let type_name = row
        .columns()
        .first()
        .map(|c| c.type_().to_string())
        .unwrap_or_else(|| "none".to_string());
    Err(SieveError::new(
        ErrorCode::QueryFailed,
        format!("Unsupported primary key type: {}", type_name),
    ))
}

const PRIMARY_KEY_SQL: &str = "SELECT a.attname, t.typname \
     FROM pg_index i \
     JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
     JOIN pg_type t ON t.oid = a.atttypid \
     WHERE i.indrelid = to_regclass($1) AND i.indisprimary";

#[async_trait]
impl RelationalClient for PgConnection {
    async fn query_ids(&mut self, sql: &str) -> Result<FeatureIdSet> {
        let rows = self.client.query(sql, &[]).await?;
        let mut ids = FeatureIdSet::new();
        for row in &rows {
            if let Some(id) = read_key(row)? {
                ids.insert(id);
            }
        }
        Ok(ids)
    }

    async fn query_count(&mut self, sql: &str) -> Result<i64> {
        let row = self.client.query_one(sql, &[]).await?;
        Ok(row.try_get::<_, Option<i64>>(0)?.unwrap_or(0))
    }

    async fn execute_in_transaction(&mut self, sql: &str) -> Result<()> {
        let tx = self.client.transaction().await?;
        tx.batch_execute(sql).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn primary_key(&mut self, relation: &str) -> Result<Option<PrimaryKey>> {
        let rows = self.client.query(PRIMARY_KEY_SQL, &[&relation]).await?;
        if rows.len() != 1 {
            return Ok(None);
        }
        let column: String = rows[0].try_get(0)?;
        let type_name: String = rows[0].try_get(1)?;
        Ok(Some(PrimaryKey {
            column,
            numeric: matches!(type_name.as_str(), "int2" | "int4" | "int8" | "numeric"),
        }))
    }

    fn cancel_token(&self) -> Option<tokio_postgres::CancelToken> {
        Some(self.client.cancel_token())
    }
}

/// Race `fut` against the request's cancel token, asking the server to stop
/// the statement when the request is cancelled first.
async fn guarded<T, F>(
    cancel: &CancelToken,
    server: Option<tokio_postgres::CancelToken>,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let outcome = cancel.run(fut).await;
    if outcome.as_ref().is_err_and(|e| e.is_cancelled()) {
        if let Some(token) = server {
            if let Err(e) = token.cancel_query(NoTls).await {
                debug!(target: "relational", "Server-side cancel failed: {}", e);
            }
        }
    }
    outcome
}

/// Views created by the running request.
#[derive(Default)]
struct RequestViews {
    created: Vec<String>,
}

pub struct RelationalBackend<M: ManageConnection> {
    pool: ConnectionPool<M>,
    settings: RelationalSettings,
    breaker: Arc<CircuitBreaker>,
    /// Quoted view names per dataset id.
    views: Mutex<HashMap<String, Vec<String>>>,
}

impl<M> RelationalBackend<M>
where
    M: ManageConnection,
    M::Connection: RelationalClient,
{
    pub fn new(
        pool: ConnectionPool<M>,
        settings: &RelationalSettings,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self> {
        if !settings.enabled {
            return Err(SieveError::new(
                ErrorCode::DriverUnavailable,
                "The relational backend is disabled",
            ));
        }
        Ok(Self {
            pool,
            settings: settings.clone(),
            breaker,
            views: Mutex::new(HashMap::new()),
        })
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn target(&self) -> &str {
        self.pool.target()
    }

    /// Views currently alive for a dataset.
    pub fn views(&self, dataset_id: &str) -> Vec<String> {
        self.views.lock().get(dataset_id).cloned().unwrap_or_default()
    }

    /// Build the precomputed view for `clause`. Returns its quoted name.
    #[allow(clippy::too_many_arguments)]
    async fn create_view(
        &self,
        conn: &mut PooledConnection<M>,
        cancel: &CancelToken,
        target: &DatasetDescriptor,
        table: &str,
        clause: &str,
        request: &mut RequestViews,
    ) -> Result<String> {
        let dialect = SqlDialect::PostGis;
        let name = format!("{}{}", self.settings.view_prefix, Uuid::new_v4().simple());
        let view = dialect
            .qualified_relation(target.schema.as_deref(), &name)
            .map_err(sql_error(dialect))?;
        let index = quote_ident(&format!("{}_gix", name))?;
        let geom = quote_ident(&target.geometry_column)?;

        let statements = [
            format!(
                "CREATE MATERIALIZED VIEW {} AS SELECT * FROM {} WHERE {} WITH DATA",
                view, table, clause
            ),
            format!("CREATE INDEX {} ON {} USING GIST ({})", index, view, geom),
            format!("CLUSTER {} USING {}", view, index),
            format!("ANALYZE {}", view),
        ];

        // Tracked before it exists, so cleanup also covers a partial build.
        self.views
            .lock()
            .entry(target.id.clone())
            .or_default()
            .push(view.clone());
        request.created.push(view.clone());
        let server = conn.cancel_token();
        for statement in statements {
            debug!(target: "relational", %statement, "Building precomputed view");
            if let Err(e) = guarded(cancel, server.clone(), conn.execute_in_transaction(&statement)).await {
                if e.is_cancelled() {
                    return Err(e);
                }
                let reason = e.to_string();
                if e.category() != ErrorCategory::Connection {
                    let drop_sql = format!("DROP MATERIALIZED VIEW IF EXISTS {}", view);
                    match conn.execute_in_transaction(&drop_sql).await {
                        Ok(()) => {
                            request.created.retain(|v| v != &view);
                            self.forget_views(&target.id, std::slice::from_ref(&view));
                        }
                        Err(drop_err) => {
                            warn!(target: "relational", %view, "Cannot drop partial view: {}", drop_err)
                        }
                    }
                }
                return Err(SieveError::new(
                    ErrorCode::ViewCreationFailed,
                    format!("Cannot build precomputed view: {}", reason),
                )
                .with_context(ErrorContext::View {
                    view_name: view,
                    statement,
                }));
            }
        }

        info!(target: "relational", dataset = %target.id, %view, "Precomputed view ready");
        Ok(view)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_with(
        &self,
        conn: &mut PooledConnection<M>,
        mut step_clause: Option<String>,
        probe: Option<String>,
        spec: &FilterSpec,
        target: &DatasetDescriptor,
        cancel: &CancelToken,
        request: &mut RequestViews,
    ) -> Result<FilterResult> {
        let kind = BackendKind::Relational;
        let dialect = SqlDialect::PostGis;
        let table = dialect.qualified_table(target).map_err(sql_error(dialect))?;
        let server = conn.cancel_token();

        if let Some(probe) = probe {
            let remaining = guarded(cancel, server.clone(), conn.query_count(&probe)).await?;
            if remaining == 0 {
                step_clause = None;
            }
        }
        // Nothing left of the source: the new step matches no feature.
        let eroded = step_clause.is_none();
        let clause = step_clause.unwrap_or_else(|| MATCH_NOTHING.to_string());
        if eroded {
            let filter = combine_filter(target.current_filter(), &clause, spec.combine);
            if spec.combine == CombineOperator::And || filter == MATCH_NOTHING {
                return Ok(FilterResult::empty(kind, MATCH_NOTHING));
            }
        }

        let key = match &target.primary_key {
            Some(key) => Some(key.clone()),
            None => guarded(cancel, server.clone(), conn.primary_key(&table)).await?,
        };

        let large = target.feature_count >= self.settings.view_threshold;
        let mut via_view = false;
        let mut new_filter = clause.clone();
        if spec.is_spatial() && large && !eroded {
            match &key {
                Some(key) => {
                    match self
                        .create_view(conn, cancel, target, &table, &clause, request)
                        .await
                    {
                        Ok(view) => {
                            new_filter = key_subquery(&key.column, &view).map_err(sql_error(dialect))?;
                            via_view = true;
                        }
                        Err(e) if e.is_cancelled() => return Err(e),
                        Err(e) => {
                            warn!(target: "relational", dataset = %target.id, "View strategy downgraded: {}", e);
                            add_warning(format!(
                                "Precomputed view unavailable, filtered directly instead: {}",
                                e.message
                            ));
                        }
                    }
                }
                None => add_warning(format!(
                    "Dataset '{}' has no primary key; filtered directly instead of through a view",
                    target.id
                )),
            }
        }

        let filter = combine_filter(target.current_filter(), &new_filter, spec.combine);
        let matched = match (&key, via_view) {
            (Some(key), false) => {
                let sql = format!(
                    "SELECT {} FROM {} WHERE {}",
                    quote_ident(&key.column)?,
                    table,
                    filter
                );
                Matched::Ids(guarded(cancel, server.clone(), conn.query_ids(&sql)).await?)
            }
            _ => {
                let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", table, filter);
                let count = guarded(cancel, server.clone(), conn.query_count(&sql)).await?;
                Matched::Count(count.max(0) as u64)
            }
        };
        Ok(step_result(kind, filter, matched))
    }

    async fn run(
        &self,
        spec: &FilterSpec,
        target: &DatasetDescriptor,
        auxiliary: &[DatasetDescriptor],
        cancel: &CancelToken,
    ) -> Result<FilterResult> {
        let step = plan_sql_step(
            SqlDialect::PostGis,
            BackendKind::Relational,
            spec,
            target,
            auxiliary,
        )?;
        let mut conn = cancel.run(self.pool.acquire()).await?;
        let mut request = RequestViews::default();
        let outcome = self
            .run_with(
                &mut conn,
                step.clause,
                step.probe,
                spec,
                target,
                cancel,
                &mut request,
            )
            .await;

        if let Err(e) = &outcome {
            if e.is_cancelled() || e.category() == ErrorCategory::Connection {
                conn.mark_broken();
            }
            drop(conn);
            // A failed step keeps none of its views.
            if !request.created.is_empty() {
                self.release_views(&target.id, &request.created).await;
            }
        }
        outcome
    }

    fn forget_views(&self, dataset_id: &str, views: &[String]) {
        let mut tracked = self.views.lock();
        if let Some(list) = tracked.get_mut(dataset_id) {
            list.retain(|v| !views.contains(v));
            if list.is_empty() {
                tracked.remove(dataset_id);
            }
        }
    }

    /// Drop `views` on a fresh connection. Views that cannot be dropped stay
    /// tracked for the next cleanup.
    async fn release_views(&self, dataset_id: &str, views: &[String]) -> usize {
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(target: "relational", dataset = %dataset_id, "Cannot drop views {:?}: {}", views, e);
                return 0;
            }
        };
        let mut dropped = Vec::with_capacity(views.len());
        for view in views {
            let sql = format!("DROP MATERIALIZED VIEW IF EXISTS {}", view);
            match conn.execute_in_transaction(&sql).await {
                Ok(()) => {
                    debug!(target: "relational", %view, "Dropped precomputed view");
                    dropped.push(view.clone());
                }
                Err(e) => warn!(target: "relational", %view, "Failed to drop view: {}", e),
            }
        }
        self.forget_views(dataset_id, &dropped);
        dropped.len()
    }
}

#[async_trait]
impl<M> BackendPort for RelationalBackend<M>
where
    M: ManageConnection,
    M::Connection: RelationalClient,
{
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    fn supports_dataset(&self, dataset: &DatasetDescriptor) -> bool {
        dataset.provider == ProviderKind::Postgres
    }

    async fn execute(
        &self,
        spec: &FilterSpec,
        target: &DatasetDescriptor,
        auxiliary: &[DatasetDescriptor],
        cancel: &CancelToken,
    ) -> FilterResult {
        run_normalized(
            BackendKind::Relational,
            self.breaker.call_classified(
                || self.run(spec, target, auxiliary, cancel),
                SieveError::counts_as_breaker_failure,
            ),
        )
        .await
    }

    async fn cleanup(&self, dataset: &DatasetDescriptor) {
        let views = self.views(&dataset.id);
        if views.is_empty() {
            return;
        }
        let dropped = self.release_views(&dataset.id, &views).await;
        info!(
            target: "relational",
            dataset = %dataset.id,
            dropped,
            remaining = views.len() - dropped,
            "Precomputed views released"
        );
    }
}

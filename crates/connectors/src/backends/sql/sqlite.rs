//! Embedded backend: SpatiaLite and GeoPackage files through `rusqlite`.
//!
//! Each request opens its own connection on a blocking thread. Statements
//! that hit a locked database file are retried with exponential backoff, and
//! a cancelled request interrupts the running statement.
//!
//! Spatial steps go through the [`StepCache`]: the ids matched by the new
//! step are combined with the cached ids of the previous step, and the
//! result is handed back as a primary-key membership filter (inline, or via
//! a staging table once the id list grows past `inline_id_limit`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use geosieve_common::circuit_breaker::CircuitBreaker;
use geosieve_common::config::{EmbeddedSettings, RetrySettings};
use geosieve_common::retry::retry_on_lock;
use geosieve_common::step_cache::{CacheEntry, StepCache, StepKey};
use geosieve_common::warnings::add_warning;
use geosieve_common::{
    BackendKind, CancelToken, CombineOperator, DatasetDescriptor, FeatureId, FeatureIdSet,
    FilterResult, FilterSpec, Matched, PrimaryKey, ProviderKind,
};
use geosieve_error::{ErrorCode, Result, SieveError};
use geosieve_geometry::source_hash;
use geosieve_sql::sanitize::quote_ident;
use geosieve_sql::{
    combine_filter, key_membership, key_subquery, FilterClassifier, SqlDialect, MATCH_NOTHING,
};
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle, LoadExtensionGuard, OpenFlags};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::common::{plan_sql_step, sql_error};
use super::sqlite_functions::register_spatial_functions;
use crate::backends::{join_error, run_normalized, step_result, BackendPort};

/// Where the SpatiaLite SQL functions come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpatialSupport {
    /// The loadable extension at this path.
    Extension(PathBuf),
    /// [`register_spatial_functions`]: WKT geometry columns only.
    InProcess,
}

fn load_spatialite(conn: &Connection, path: &Path) -> rusqlite::Result<()> {
    // SAFETY: extension loading stays enabled only while the guard lives, and
    // the library path comes from the operator's configuration.
    unsafe {
        let _guard = LoadExtensionGuard::new(conn)?;
        conn.load_extension(path, None)?;
    }
    Ok(())
}

impl SpatialSupport {
    /// Load the configured extension into a scratch connection; fall back to
    /// the in-process functions when that fails.
    pub fn detect(spatialite_path: Option<&str>) -> Self {
        let Some(path) = spatialite_path.map(str::trim).filter(|p| !p.is_empty()) else {
            return SpatialSupport::InProcess;
        };
        let path = PathBuf::from(path);
        let probe = Connection::open_in_memory().and_then(|conn| load_spatialite(&conn, &path));
        match probe {
            Ok(()) => {
                info!(target: "embedded", path = %path.display(), "SpatiaLite extension loaded");
                SpatialSupport::Extension(path)
            }
            Err(e) => {
                warn!(
                    target: "embedded",
                    path = %path.display(),
                    "Cannot load SpatiaLite ({}); using in-process spatial functions",
                    e
                );
                SpatialSupport::InProcess
            }
        }
    }

    fn install(&self, conn: &Connection, provider: ProviderKind) -> rusqlite::Result<()> {
        match self {
            SpatialSupport::Extension(path) => {
                load_spatialite(conn, path)?;
                if provider == ProviderKind::GeoPackage {
                    conn.query_row("SELECT EnableGpkgAmphibiousMode()", [], |_| Ok(()))?;
                }
                Ok(())
            }
            SpatialSupport::InProcess => register_spatial_functions(conn),
        }
    }
}

/// One connection to a dataset file, used from blocking threads.
struct Session {
    conn: Arc<std::sync::Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

impl Session {
    async fn open(
        path: &str,
        provider: ProviderKind,
        support: &SpatialSupport,
        busy_timeout: Duration,
    ) -> Result<Self> {
        let path = path.to_string();
        let support = support.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| {
                SieveError::from(e).with_hint(format!("Check that '{}' is a readable database file", path))
            })?;
            conn.busy_timeout(busy_timeout)?;
            support.install(&conn, provider)?;
            Ok(conn)
        })
        .await
        .map_err(join_error)??;

        let interrupt = Arc::new(conn.get_interrupt_handle());
        Ok(Self {
            conn: Arc::new(std::sync::Mutex::new(conn)),
            interrupt,
        })
    }

    /// Run `op` on a blocking thread. Cancellation interrupts the statement
    /// and waits for it to unwind before returning.
    async fn run<T, F>(&self, cancel: &CancelToken, op: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        cancel.check()?;
        let conn = self.conn.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| SieveError::internal("embedded connection mutex poisoned"))?;
            op(&guard)
        });
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.interrupt.interrupt();
                let _ = (&mut task).await;
                Err(SieveError::cancelled())
            }
            out = &mut task => out.map_err(join_error)?,
        }
    }
}

fn query_ids(conn: &Connection, sql: &str) -> Result<FeatureIdSet> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    let mut ids = FeatureIdSet::new();
    while let Some(row) = rows.next()? {
        match row.get_ref(0)? {
            ValueRef::Integer(i) => {
                ids.insert(FeatureId::Int(i));
            }
            ValueRef::Text(t) => {
                ids.insert(FeatureId::Text(String::from_utf8_lossy(t).into_owned()));
            }
            ValueRef::Null => {}
            other => {
                return Err(SieveError::new(
                    ErrorCode::QueryFailed,
                    format!("Unsupported primary key type: {}", other.data_type()),
                ))
            }
        }
    }
    Ok(ids)
}

fn query_count(conn: &Connection, sql: &str) -> Result<i64> {
    Ok(conn.query_row(sql, [], |row| row.get::<_, Option<i64>>(0))?.unwrap_or(0))
}

fn create_staging_table(
    conn: &Connection,
    table: &str,
    key: &PrimaryKey,
    ids: &FeatureIdSet,
) -> Result<()> {
    let column = quote_ident(&key.column)?;
    let column_type = if key.numeric { "INTEGER" } else { "TEXT" };
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(&format!(
        "CREATE TABLE {} ({} {} PRIMARY KEY)",
        table, column, column_type
    ))?;
    {
        let mut stmt = tx.prepare(&format!("INSERT INTO {} ({}) VALUES (?1)", table, column))?;
        for id in ids {
            match id {
                FeatureId::Int(i) => stmt.execute([i])?,
                FeatureId::Text(s) => stmt.execute([s])?,
            };
        }
    }
    tx.commit()?;
    Ok(())
}

#[derive(Debug, Clone)]
struct StagedTable {
    path: String,
    /// Quoted table name.
    table: String,
}

/// What a request changed before it finished, undone when it fails.
#[derive(Default)]
struct StepState {
    staged: Vec<StagedTable>,
    recorded: bool,
    /// Chain entry that was current before the step was recorded.
    previous: Option<Arc<CacheEntry>>,
}

pub struct EmbeddedBackend {
    settings: EmbeddedSettings,
    retry: RetrySettings,
    support: SpatialSupport,
    cache: Arc<StepCache>,
    breaker: Arc<CircuitBreaker>,
    classifier: FilterClassifier,
    staging: Mutex<HashMap<String, Vec<StagedTable>>>,
}

impl EmbeddedBackend {
    pub fn new(
        settings: &EmbeddedSettings,
        retry: RetrySettings,
        support: SpatialSupport,
        cache: Arc<StepCache>,
        breaker: Arc<CircuitBreaker>,
        classifier: FilterClassifier,
    ) -> Result<Self> {
        if !settings.enabled {
            return Err(SieveError::new(
                ErrorCode::DriverUnavailable,
                "The embedded backend is disabled",
            ));
        }
        Ok(Self {
            settings: settings.clone(),
            retry,
            support,
            cache,
            breaker,
            classifier,
            staging: Mutex::new(HashMap::new()),
        })
    }

    pub fn support(&self) -> &SpatialSupport {
        &self.support
    }

    /// Quoted staging tables currently alive for a dataset.
    pub fn staged_tables(&self, dataset_id: &str) -> Vec<String> {
        self.staging
            .lock()
            .get(dataset_id)
            .map(|tables| tables.iter().map(|t| t.table.clone()).collect())
            .unwrap_or_default()
    }

    fn key_column(target: &DatasetDescriptor) -> PrimaryKey {
        target.primary_key.clone().unwrap_or(PrimaryKey {
            column: "rowid".to_string(),
            numeric: true,
        })
    }

    async fn open(&self, target: &DatasetDescriptor) -> Result<Session> {
        Session::open(
            &target.source,
            target.provider,
            &self.support,
            Duration::from_millis(self.settings.busy_timeout_ms),
        )
        .await
    }

    /// Run `op`, retrying while the database file is locked.
    async fn run_retried<T, F>(
        &self,
        session: &Session,
        name: &str,
        cancel: &CancelToken,
        op: F,
    ) -> Result<T>
    where
        F: Fn(&Connection) -> Result<T> + Clone + Send + 'static,
        T: Send + 'static,
    {
        let retried = retry_on_lock(name, self.retry, || session.run(cancel, op.clone())).await?;
        if retried.attempts > 1 {
            add_warning(format!(
                "Database was locked; {} succeeded after {} attempts ({} ms waiting)",
                name,
                retried.attempts,
                retried.waited.as_millis()
            ));
        }
        Ok(retried.value)
    }

    async fn select_ids(
        &self,
        session: &Session,
        cancel: &CancelToken,
        key: &PrimaryKey,
        table: &str,
        filter: &str,
    ) -> Result<FeatureIdSet> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            quote_ident(&key.column)?,
            table,
            filter
        );
        debug!(target: "embedded", %sql, "Selecting matching ids");
        self.run_retried(session, "id query", cancel, move |conn| query_ids(conn, &sql))
            .await
    }

    /// Inline `pk IN (...)`, or a staging table for large id sets.
    async fn membership_filter(
        &self,
        session: &Session,
        cancel: &CancelToken,
        target: &DatasetDescriptor,
        key: &PrimaryKey,
        ids: Arc<FeatureIdSet>,
        state: &mut StepState,
    ) -> Result<String> {
        if ids.len() <= self.settings.inline_id_limit {
            return key_membership(&key.column, &ids).map_err(sql_error(SqlDialect::SpatiaLite));
        }

        let name = format!("{}{}", self.settings.stage_prefix, Uuid::new_v4().simple());
        let table = quote_ident(&name)?;
        let staged = StagedTable {
            path: target.source.clone(),
            table: table.clone(),
        };
        state.staged.push(staged.clone());

        let op_table = table.clone();
        let op_key = key.clone();
        self.run_retried(session, "staging table", cancel, move |conn| {
            create_staging_table(conn, &op_table, &op_key, &ids)
        })
        .await?;

        info!(
            target: "embedded",
            dataset = %target.id,
            table = %name,
            "Staged matching ids"
        );
        self.staging
            .lock()
            .entry(target.id.clone())
            .or_default()
            .push(staged);
        key_subquery(&key.column, &table).map_err(sql_error(SqlDialect::SpatiaLite))
    }

    async fn run_step(
        &self,
        session: &Session,
        spec: &FilterSpec,
        target: &DatasetDescriptor,
        auxiliary: &[DatasetDescriptor],
        cancel: &CancelToken,
        state: &mut StepState,
    ) -> Result<FilterResult> {
        let kind = BackendKind::Embedded;
        let dialect = SqlDialect::SpatiaLite;
        let mut step = plan_sql_step(dialect, kind, spec, target, auxiliary)?;
        let key = Self::key_column(target);
        let table = dialect.qualified_table(target).map_err(sql_error(dialect))?;

        if let Some(probe) = step.probe.take() {
            let remaining = self
                .run_retried(session, "emptiness probe", cancel, move |conn| {
                    query_count(conn, &probe)
                })
                .await?;
            if remaining == 0 {
                step.clause = None;
            }
        }
        // Nothing left of the source: the new step matches no feature.
        let eroded = step.clause.is_none();
        let clause = step.clause.unwrap_or_else(|| MATCH_NOTHING.to_string());

        let Some(source) = spec.source.as_ref().filter(|_| spec.is_spatial()) else {
            let filter = combine_filter(target.current_filter(), &clause, spec.combine);
            let ids = self.select_ids(session, cancel, &key, &table, &filter).await?;
            return Ok(step_result(kind, filter, Matched::Ids(ids)));
        };

        let step_key = StepKey {
            dataset_id: target.id.clone(),
            geometry_hash: source_hash(source),
            buffer: spec.effective_buffer().map(|b| b.fingerprint()),
            predicates: spec.predicates.clone(),
        };
        let previous = self.cache.peek(&target.id).await;
        let chained = spec.combine != CombineOperator::Replace
            && previous
                .as_ref()
                .is_some_and(|e| e.key.geometry_hash == step_key.geometry_hash);

        // OR and AND NOT with an empty step leave the applied filter as it is.
        let keeps_previous = matches!(spec.combine, CombineOperator::Or | CombineOperator::AndNot);
        if eroded && !chained && keeps_previous {
            if let Some(current) = target.current_filter() {
                let ids = self.select_ids(session, cancel, &key, &table, current).await?;
                cancel.check()?;
                state.previous = previous;
                state.recorded = true;
                let outcome = self
                    .cache
                    .record_step(step_key, ids.clone(), CombineOperator::Replace)
                    .await;
                return Ok(step_result(kind, current.to_string(), Matched::Ids(ids))
                    .with_step(outcome.step, outcome.cache_hit));
            }
        }

        // AND NOT that starts a chain keeps everything outside the source.
        let mut op = spec.combine;
        let mut select = clause;
        if op == CombineOperator::AndNot && !chained {
            select = format!("NOT ({})", select);
            op = CombineOperator::Replace;
        }

        let new_ids = if select == MATCH_NOTHING {
            FeatureIdSet::new()
        } else {
            self.select_ids(session, cancel, &key, &table, &select).await?
        };
        cancel.check()?;
        state.previous = previous;
        state.recorded = true;
        let outcome = self.cache.record_step(step_key, new_ids, op).await;
        if outcome.invalidated {
            add_warning("Source geometry changed since the previous step; starting a new filter chain");
        }

        let retained = target
            .current_filter()
            .and_then(|f| self.classifier.retained_attribute(f));
        let membership = self
            .membership_filter(session, cancel, target, &key, outcome.ids.clone(), state)
            .await?;
        let filter = combine_filter(retained.as_deref(), &membership, CombineOperator::And);

        let matched = match &retained {
            Some(_) if !outcome.ids.is_empty() => {
                self.select_ids(session, cancel, &key, &table, &filter).await?
            }
            _ => (*outcome.ids).clone(),
        };
        debug!(
            target: "embedded",
            dataset = %target.id,
            step = outcome.step,
            cache_hit = outcome.cache_hit,
            matched = matched.len(),
            "Spatial step finished"
        );
        Ok(step_result(kind, filter, Matched::Ids(matched))
            .with_step(outcome.step, outcome.cache_hit))
    }

    async fn run(
        &self,
        spec: &FilterSpec,
        target: &DatasetDescriptor,
        auxiliary: &[DatasetDescriptor],
        cancel: &CancelToken,
    ) -> Result<FilterResult> {
        let session = self.open(target).await?;
        let mut state = StepState::default();
        let outcome = self
            .run_step(&session, spec, target, auxiliary, cancel, &mut state)
            .await;

        if outcome.is_err() {
            // A failed step must not advance the chain.
            if state.recorded {
                self.cache.restore(&target.id, state.previous.take()).await;
            }
            if !state.staged.is_empty() {
                self.forget_staged(&target.id, &state.staged);
                drop_tables(&session, &state.staged).await;
            }
        }
        outcome
    }

    fn forget_staged(&self, dataset_id: &str, staged: &[StagedTable]) {
        let mut tracked = self.staging.lock();
        if let Some(tables) = tracked.get_mut(dataset_id) {
            tables.retain(|t| !staged.iter().any(|s| s.table == t.table));
            if tables.is_empty() {
                tracked.remove(dataset_id);
            }
        }
    }
}

async fn drop_tables(session: &Session, tables: &[StagedTable]) {
    for staged in tables {
        let sql = format!("DROP TABLE IF EXISTS {}", staged.table);
        let outcome = session
            .run(&CancelToken::new(), move |conn| {
                conn.execute_batch(&sql)?;
                Ok(())
            })
            .await;
        if let Err(e) = outcome {
            warn!(target: "embedded", table = %staged.table, "Failed to drop staging table: {}", e);
        }
    }
}

#[async_trait]
impl BackendPort for EmbeddedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    fn supports_dataset(&self, dataset: &DatasetDescriptor) -> bool {
        match dataset.provider {
            ProviderKind::Spatialite => true,
            // GeoPackage geometries are binary and need the extension.
            ProviderKind::GeoPackage => matches!(self.support, SpatialSupport::Extension(_)),
            ProviderKind::Postgres | ProviderKind::File => false,
        }
    }

    async fn execute(
        &self,
        spec: &FilterSpec,
        target: &DatasetDescriptor,
        auxiliary: &[DatasetDescriptor],
        cancel: &CancelToken,
    ) -> FilterResult {
        run_normalized(
            BackendKind::Embedded,
            self.breaker.call_classified(
                || self.run(spec, target, auxiliary, cancel),
                SieveError::counts_as_breaker_failure,
            ),
        )
        .await
    }

    async fn cleanup(&self, dataset: &DatasetDescriptor) {
        let staged = self.staging.lock().remove(&dataset.id).unwrap_or_default();
        if staged.is_empty() {
            return;
        }
        let mut by_path: HashMap<String, Vec<StagedTable>> = HashMap::new();
        for table in staged {
            by_path.entry(table.path.clone()).or_default().push(table);
        }
        for (path, tables) in by_path {
            match Session::open(
                &path,
                dataset.provider,
                &SpatialSupport::InProcess,
                Duration::from_millis(self.settings.busy_timeout_ms),
            )
            .await
            {
                Ok(session) => drop_tables(&session, &tables).await,
                Err(e) => warn!(
                    target: "embedded",
                    dataset = %dataset.id,
                    "Cannot open {} to drop staging tables: {}",
                    path,
                    e
                ),
            }
        }
        info!(target: "embedded", dataset = %dataset.id, "Staging tables released");
    }
}

use geosieve_error::SieveError;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

// Custom Serde logic for SecretString
fn serialize_secret<S>(secret: &Option<SecretString>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match secret {
        Some(_) => serializer.serialize_str("[REDACTED]"),
        None => serializer.serialize_none(),
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: Option<String> = Option::deserialize(deserializer)?;
    Ok(s.map(SecretString::from))
}

fn default_geometry_column() -> String {
    "geom".to_string()
}

/// Identifier of a single feature: either an integer key or a text key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureId {
    Int(i64),
    Text(String),
}

impl FeatureId {
    /// Render as a SQL literal: bare integers, single-quoted text.
    pub fn to_sql_literal(&self) -> String {
        match self {
            FeatureId::Int(v) => v.to_string(),
            FeatureId::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureId::Int(v) => write!(f, "{}", v),
            FeatureId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for FeatureId {
    fn from(v: i64) -> Self {
        FeatureId::Int(v)
    }
}

impl From<&str> for FeatureId {
    fn from(v: &str) -> Self {
        FeatureId::Text(v.to_string())
    }
}

impl From<String> for FeatureId {
    fn from(v: String) -> Self {
        FeatureId::Text(v)
    }
}

pub type FeatureIdSet = BTreeSet<FeatureId>;

/// Storage technology behind a dataset, as reported by the layer manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Postgres,
    Spatialite,
    #[serde(rename = "gpkg")]
    GeoPackage,
    File,
}

/// The closed set of backend implementations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Relational,
    Embedded,
    Fallback,
}

impl BackendKind {
    /// Name used for circuit breakers and log targets.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Relational => "relational",
            BackendKind::Embedded => "embedded",
            BackendKind::Fallback => "fallback",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKey {
    pub column: String,
    #[serde(default = "default_numeric_key")]
    pub numeric: bool,
}

fn default_numeric_key() -> bool {
    true
}

/// Immutable snapshot of one dataset (layer), taken once per filter request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub id: String,
    pub provider: ProviderKind,
    /// Connection string for relational datasets, file path otherwise.
    pub source: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_secret",
        deserialize_with = "deserialize_secret"
    )]
    pub password: Option<SecretString>,
    #[serde(default)]
    pub schema: Option<String>,
    pub table: String,
    #[serde(default = "default_geometry_column")]
    pub geometry_column: String,
    #[serde(default)]
    pub primary_key: Option<PrimaryKey>,
    #[serde(default)]
    pub feature_count: u64,
    #[serde(default)]
    pub has_spatial_index: bool,
    #[serde(default)]
    pub srid: Option<i32>,
    /// Filter text currently applied to the dataset, if any.
    #[serde(default)]
    pub applied_filter: Option<String>,
}

impl DatasetDescriptor {
    pub fn new(
        id: impl Into<String>,
        provider: ProviderKind,
        source: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            provider,
            source: source.into(),
            password: None,
            schema: None,
            table: table.into(),
            geometry_column: default_geometry_column(),
            primary_key: None,
            feature_count: 0,
            has_spatial_index: false,
            srid: None,
            applied_filter: None,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_geometry_column(mut self, column: impl Into<String>) -> Self {
        self.geometry_column = column.into();
        self
    }

    pub fn with_primary_key(mut self, column: impl Into<String>, numeric: bool) -> Self {
        self.primary_key = Some(PrimaryKey {
            column: column.into(),
            numeric,
        });
        self
    }

    pub fn with_feature_count(mut self, count: u64) -> Self {
        self.feature_count = count;
        self
    }

    pub fn with_srid(mut self, srid: i32) -> Self {
        self.srid = Some(srid);
        self
    }

    pub fn with_applied_filter(mut self, filter: impl Into<String>) -> Self {
        self.applied_filter = Some(filter.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::from(password.into()));
        self
    }

    /// The applied filter, ignoring blank text.
    pub fn current_filter(&self) -> Option<&str> {
        self.applied_filter
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
    }
}

/// The eight standard spatial predicates.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SpatialPredicate {
    Intersects,
    Contains,
    Within,
    Crosses,
    Overlaps,
    Touches,
    Disjoint,
    Equals,
}

impl SpatialPredicate {
    pub const ALL: [SpatialPredicate; 8] = [
        SpatialPredicate::Intersects,
        SpatialPredicate::Contains,
        SpatialPredicate::Within,
        SpatialPredicate::Crosses,
        SpatialPredicate::Overlaps,
        SpatialPredicate::Touches,
        SpatialPredicate::Disjoint,
        SpatialPredicate::Equals,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SpatialPredicate::Intersects => "intersects",
            SpatialPredicate::Contains => "contains",
            SpatialPredicate::Within => "within",
            SpatialPredicate::Crosses => "crosses",
            SpatialPredicate::Overlaps => "overlaps",
            SpatialPredicate::Touches => "touches",
            SpatialPredicate::Disjoint => "disjoint",
            SpatialPredicate::Equals => "equals",
        }
    }
}

impl fmt::Display for SpatialPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the geometry that target features are compared against comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceGeometry {
    /// Geometries supplied with the request as WKT.
    Literal {
        wkts: Vec<String>,
        #[serde(default)]
        srid: Option<i32>,
    },
    /// Features of an auxiliary dataset in the same store as the target.
    /// `revision` changes whenever the caller modifies those features.
    Dataset {
        dataset_id: String,
        #[serde(default)]
        filter: Option<String>,
        #[serde(default)]
        revision: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum BufferDistance {
    /// Signed distance in layer units; negative erodes.
    Constant(f64),
    /// Per-feature attribute expression evaluated on the source features.
    Expression(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferSpec {
    pub distance: BufferDistance,
    #[serde(default = "default_segments")]
    pub segments: u32,
}

fn default_segments() -> u32 {
    8
}

impl BufferSpec {
    pub fn constant(distance: f64) -> Self {
        Self {
            distance: BufferDistance::Constant(distance),
            segments: default_segments(),
        }
    }

    pub fn expression(expr: impl Into<String>) -> Self {
        Self {
            distance: BufferDistance::Expression(expr.into()),
            segments: default_segments(),
        }
    }

    /// Constant distance, if this buffer has one.
    pub fn constant_distance(&self) -> Option<f64> {
        match self.distance {
            BufferDistance::Constant(d) => Some(d),
            BufferDistance::Expression(_) => None,
        }
    }

    /// A zero constant buffer is the same as no buffer.
    pub fn is_noop(&self) -> bool {
        matches!(self.distance, BufferDistance::Constant(d) if d == 0.0)
    }

    pub fn is_erosion(&self) -> bool {
        matches!(self.distance, BufferDistance::Constant(d) if d < 0.0)
    }

    /// Stable text form used in cache keys.
    pub fn fingerprint(&self) -> String {
        match &self.distance {
            BufferDistance::Constant(d) => format!("c:{}:{}", d, self.segments),
            BufferDistance::Expression(e) => format!("e:{}:{}", e, self.segments),
        }
    }
}

/// How a new step's result is combined with the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineOperator {
    #[default]
    Replace,
    And,
    Or,
    AndNot,
}

impl CombineOperator {
    /// Combine the previous step's ids with the new step's ids.
    pub fn apply(&self, previous: &FeatureIdSet, new: &FeatureIdSet) -> FeatureIdSet {
        match self {
            CombineOperator::Replace => new.clone(),
            CombineOperator::And => previous.intersection(new).cloned().collect(),
            CombineOperator::Or => previous.union(new).cloned().collect(),
            CombineOperator::AndNot => previous.difference(new).cloned().collect(),
        }
    }

    /// Boolean counterpart of [`apply`](Self::apply) for a single feature.
    pub fn combine(&self, previous: bool, new: bool) -> bool {
        match self {
            CombineOperator::Replace => new,
            CombineOperator::And => previous && new,
            CombineOperator::Or => previous || new,
            CombineOperator::AndNot => previous && !new,
        }
    }
}

impl fmt::Display for CombineOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CombineOperator::Replace => "REPLACE",
            CombineOperator::And => "AND",
            CombineOperator::Or => "OR",
            CombineOperator::AndNot => "AND NOT",
        })
    }
}

/// A filter request as handed over by the UI layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Raw attribute condition, as typed by the user.
    #[serde(default)]
    pub condition: Option<String>,
    /// Condition already translated for a specific backend.
    #[serde(default)]
    pub dialect_conditions: BTreeMap<BackendKind, String>,
    /// Active predicates, evaluated as a logical OR.
    #[serde(default)]
    pub predicates: BTreeSet<SpatialPredicate>,
    #[serde(default)]
    pub source: Option<SourceGeometry>,
    #[serde(default)]
    pub buffer: Option<BufferSpec>,
    #[serde(default)]
    pub combine: CombineOperator,
}

impl FilterSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_dialect_condition(mut self, kind: BackendKind, text: impl Into<String>) -> Self {
        self.dialect_conditions.insert(kind, text.into());
        self
    }

    pub fn with_predicate(mut self, predicate: SpatialPredicate) -> Self {
        self.predicates.insert(predicate);
        self
    }

    pub fn with_source(mut self, source: SourceGeometry) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_literal_source<I, S>(self, wkts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_source(SourceGeometry::Literal {
            wkts: wkts.into_iter().map(Into::into).collect(),
            srid: None,
        })
    }

    pub fn with_buffer(mut self, buffer: BufferSpec) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn with_combine(mut self, combine: CombineOperator) -> Self {
        self.combine = combine;
        self
    }

    /// The condition text to use for `kind`, preferring a dialect-resolved
    /// form over the raw condition.
    pub fn condition_for(&self, kind: BackendKind) -> Option<&str> {
        self.dialect_conditions
            .get(&kind)
            .map(String::as_str)
            .or(self.condition.as_deref())
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    /// Whether the request carries a spatial part.
    pub fn is_spatial(&self) -> bool {
        !self.predicates.is_empty() && self.source.is_some()
    }

    /// Buffer that actually changes the source geometry.
    pub fn effective_buffer(&self) -> Option<&BufferSpec> {
        self.buffer.as_ref().filter(|b| !b.is_noop())
    }
}

/// Terminal state of one filter request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FilterStatus {
    Success,
    /// The step legitimately matched nothing.
    Empty,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Matched {
    Ids(FeatureIdSet),
    /// Only the count is known; the ids live in a precomputed view.
    Count(u64),
    None,
}

impl Matched {
    pub fn len(&self) -> u64 {
        match self {
            Matched::Ids(ids) => ids.len() as u64,
            Matched::Count(n) => *n,
            Matched::None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Option<&FeatureIdSet> {
        match self {
            Matched::Ids(ids) => Some(ids),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterResult {
    pub status: FilterStatus,
    pub backend: BackendKind,
    /// New filter text to apply to the dataset.
    pub filter_text: Option<String>,
    pub matched: Matched,
    pub elapsed: Duration,
    pub cache_hit: bool,
    /// Position in the step chain (1 for a fresh chain).
    pub step: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SieveError>,
}

impl FilterResult {
    fn base(status: FilterStatus, backend: BackendKind) -> Self {
        Self {
            status,
            backend,
            filter_text: None,
            matched: Matched::None,
            elapsed: Duration::ZERO,
            cache_hit: false,
            step: 1,
            warnings: Vec::new(),
            error: None,
        }
    }

    /// A successful step. Downgrades to `Empty` when nothing matched.
    pub fn success(backend: BackendKind, filter_text: impl Into<String>, matched: Matched) -> Self {
        let status = if matched.is_empty() {
            FilterStatus::Empty
        } else {
            FilterStatus::Success
        };
        Self {
            filter_text: Some(filter_text.into()),
            matched,
            ..Self::base(status, backend)
        }
    }

    pub fn empty(backend: BackendKind, filter_text: impl Into<String>) -> Self {
        Self {
            filter_text: Some(filter_text.into()),
            matched: Matched::Ids(FeatureIdSet::new()),
            ..Self::base(FilterStatus::Empty, backend)
        }
    }

    pub fn error(backend: BackendKind, error: SieveError) -> Self {
        Self {
            error: Some(error),
            ..Self::base(FilterStatus::Error, backend)
        }
    }

    pub fn cancelled(backend: BackendKind) -> Self {
        Self {
            error: Some(SieveError::cancelled()),
            ..Self::base(FilterStatus::Cancelled, backend)
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn with_step(mut self, step: u32, cache_hit: bool) -> Self {
        self.step = step;
        self.cache_hit = cache_hit;
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.status, FilterStatus::Success | FilterStatus::Empty)
    }

    pub fn ids(&self) -> Option<&FeatureIdSet> {
        self.matched.ids()
    }
}

/// Everything one filter request needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRequest {
    pub target: DatasetDescriptor,
    pub spec: FilterSpec,
    #[serde(default)]
    pub auxiliary: Vec<DatasetDescriptor>,
}

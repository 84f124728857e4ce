//! Feature readers for the in-process fallback backend.
//!
//! A [`FeatureReader`] yields every feature of a dataset as id, WKT geometry
//! and attribute map. Readers are looked up per dataset id first, then by
//! provider and file extension:
//!
//! | Reader | Datasets |
//! |--------|----------|
//! | [`MemoryReader`] | registered explicitly, e.g. by tests or an editing session |
//! | [`GeoJsonReader`] | `File` datasets ending in `.geojson` / `.json` |
//! | [`SqliteWktReader`] | SpatiaLite datasets whose geometry column holds WKT |

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use geo_types::{
    Coord, Geometry, GeometryCollection, LineString, MultiLineString, MultiPoint, MultiPolygon,
    Point, Polygon,
};
use geosieve_common::{DatasetDescriptor, FeatureId, ProviderKind};
use geosieve_error::{ErrorCode, Result, SieveError};
use geosieve_geometry::to_wkt;
use geosieve_sql::sanitize::quote_ident;
use geosieve_sql::Attributes;
use parking_lot::RwLock;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: FeatureId,
    /// WKT; `None` for features without geometry.
    pub geometry: Option<String>,
    pub attributes: Attributes,
}

impl Feature {
    pub fn new(id: impl Into<FeatureId>, geometry: Option<&str>) -> Self {
        Self {
            id: id.into(),
            geometry: geometry.map(str::to_string),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }
}

/// Reads all features of a dataset. Called from a blocking thread.
pub trait FeatureReader: Send + Sync {
    fn read_features(&self, dataset: &DatasetDescriptor) -> Result<Vec<Feature>>;
}

/// Features held in memory, keyed by dataset id.
#[derive(Default)]
pub struct MemoryReader {
    datasets: RwLock<HashMap<String, Vec<Feature>>>,
}

impl MemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, dataset_id: impl Into<String>, features: Vec<Feature>) {
        self.datasets.write().insert(dataset_id.into(), features);
    }
}

impl FeatureReader for MemoryReader {
    fn read_features(&self, dataset: &DatasetDescriptor) -> Result<Vec<Feature>> {
        self.datasets
            .read()
            .get(&dataset.id)
            .cloned()
            .ok_or_else(|| {
                SieveError::new(
                    ErrorCode::UnsupportedDataset,
                    format!("No in-memory features for dataset '{}'", dataset.id),
                )
            })
    }
}

/// GeoJSON `FeatureCollection` files.
///
/// The feature id is the GeoJSON `id` member, or the primary-key property
/// when the dataset declares one. Features with neither get their 1-based
/// position.
pub struct GeoJsonReader;

impl FeatureReader for GeoJsonReader {
    fn read_features(&self, dataset: &DatasetDescriptor) -> Result<Vec<Feature>> {
        let text = std::fs::read_to_string(&dataset.source).map_err(|e| {
            SieveError::from(e).with_hint(format!("Cannot read '{}'", dataset.source))
        })?;
        let doc: Value = serde_json::from_str(&text)?;
        let features = doc
            .get("features")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                SieveError::new(
                    ErrorCode::SerializationFailed,
                    format!("'{}' is not a GeoJSON FeatureCollection", dataset.source),
                )
            })?;

        let key = dataset.primary_key.as_ref().map(|k| k.column.as_str());
        let mut out = Vec::with_capacity(features.len());
        for (index, feature) in features.iter().enumerate() {
            let attributes = match feature.get("properties") {
                Some(Value::Object(map)) => map.clone(),
                _ => Attributes::new(),
            };
            let id = key
                .and_then(|k| attributes.get(k))
                .or_else(|| feature.get("id"))
                .and_then(json_feature_id)
                .unwrap_or(FeatureId::Int(index as i64 + 1));
            let geometry = match feature.get("geometry") {
                Some(Value::Null) | None => None,
                Some(g) => match geojson_geometry(g) {
                    Some(geom) => Some(to_wkt(&geom)),
                    // Kept as unreadable text so evaluation reports and skips it.
                    None => Some(g.to_string()),
                },
            };
            out.push(Feature {
                id,
                geometry,
                attributes,
            });
        }
        debug!(target: "fallback", dataset = %dataset.id, features = out.len(), "Read GeoJSON");
        Ok(out)
    }
}

fn json_feature_id(value: &Value) -> Option<FeatureId> {
    match value {
        Value::Number(n) => n.as_i64().map(FeatureId::Int),
        Value::String(s) => Some(FeatureId::Text(s.clone())),
        _ => None,
    }
}

fn position(value: &Value) -> Option<Coord<f64>> {
    let coords = value.as_array()?;
    Some(Coord {
        x: coords.first()?.as_f64()?,
        y: coords.get(1)?.as_f64()?,
    })
}

fn line(value: &Value) -> Option<LineString<f64>> {
    value
        .as_array()?
        .iter()
        .map(position)
        .collect::<Option<Vec<_>>>()
        .map(LineString::new)
}

fn polygon(value: &Value) -> Option<Polygon<f64>> {
    let mut rings = value
        .as_array()?
        .iter()
        .map(line)
        .collect::<Option<Vec<_>>>()?
        .into_iter();
    let exterior = rings.next()?;
    Some(Polygon::new(exterior, rings.collect()))
}

fn each<T>(value: &Value, f: impl Fn(&Value) -> Option<T>) -> Option<Vec<T>> {
    value.as_array()?.iter().map(f).collect()
}

/// GeoJSON geometry object to `geo-types`.
pub fn geojson_geometry(value: &Value) -> Option<Geometry<f64>> {
    let kind = value.get("type")?.as_str()?;
    if kind == "GeometryCollection" {
        let members = each(value.get("geometries")?, geojson_geometry)?;
        return Some(Geometry::GeometryCollection(GeometryCollection(members)));
    }
    let coords = value.get("coordinates")?;
    Some(match kind {
        "Point" => Geometry::Point(Point(position(coords)?)),
        "LineString" => Geometry::LineString(line(coords)?),
        "Polygon" => Geometry::Polygon(polygon(coords)?),
        "MultiPoint" => Geometry::MultiPoint(MultiPoint(
            each(coords, position)?.into_iter().map(Point).collect(),
        )),
        "MultiLineString" => Geometry::MultiLineString(MultiLineString(each(coords, line)?)),
        "MultiPolygon" => Geometry::MultiPolygon(MultiPolygon(each(coords, polygon)?)),
        _ => return None,
    })
}

/// SQLite tables whose geometry column holds WKT text. Binary geometries
/// are returned as `None`.
pub struct SqliteWktReader;

impl FeatureReader for SqliteWktReader {
    fn read_features(&self, dataset: &DatasetDescriptor) -> Result<Vec<Feature>> {
        let conn = Connection::open_with_flags(
            &dataset.source,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
        )?;
        let key = dataset
            .primary_key
            .as_ref()
            .map(|k| k.column.as_str())
            .unwrap_or("rowid");
        let sql = format!(
            "SELECT {} AS \"__geosieve_id\", * FROM {}",
            quote_ident(key)?,
            quote_ident(&dataset.table)?
        );
        let mut stmt = conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let id = match row.get_ref(0)? {
                ValueRef::Integer(i) => FeatureId::Int(i),
                ValueRef::Text(t) => FeatureId::Text(String::from_utf8_lossy(t).into_owned()),
                _ => continue,
            };
            let mut feature = Feature {
                id,
                geometry: None,
                attributes: Attributes::new(),
            };
            for (index, name) in columns.iter().enumerate().skip(1) {
                let value = row.get_ref(index)?;
                if name == &dataset.geometry_column {
                    if let ValueRef::Text(t) = value {
                        feature.geometry = Some(String::from_utf8_lossy(t).into_owned());
                    }
                    continue;
                }
                feature.attributes.insert(name.clone(), sql_value(value));
            }
            out.push(feature);
        }
        debug!(target: "fallback", dataset = %dataset.id, features = out.len(), "Read SQLite table");
        Ok(out)
    }
}

fn sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(_) => Value::Null,
    }
}

/// Resolves the reader for a dataset.
#[derive(Default)]
pub struct ReaderRegistry {
    by_dataset: RwLock<HashMap<String, Arc<dyn FeatureReader>>>,
}

impl ReaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `reader` for the dataset with this id, ahead of any default.
    pub fn register(&self, dataset_id: impl Into<String>, reader: Arc<dyn FeatureReader>) {
        self.by_dataset.write().insert(dataset_id.into(), reader);
    }

    pub fn resolve(&self, dataset: &DatasetDescriptor) -> Option<Arc<dyn FeatureReader>> {
        if let Some(reader) = self.by_dataset.read().get(&dataset.id) {
            return Some(reader.clone());
        }
        let extension = Path::new(&dataset.source)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match (dataset.provider, extension.as_deref()) {
            (ProviderKind::File, Some("geojson" | "json")) => Some(Arc::new(GeoJsonReader)),
            (ProviderKind::Spatialite, _) => Some(Arc::new(SqliteWktReader)),
            (ProviderKind::File, Some("sqlite" | "db")) => Some(Arc::new(SqliteWktReader)),
            _ => None,
        }
    }
}

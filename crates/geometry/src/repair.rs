//! GeometryRepair.
//!
//! Spatial engines answer "no match" rather than failing when handed a
//! self-intersecting or unclosed polygon, so every source geometry is
//! normalized here before any predicate sees it. Repair is unconditional;
//! already-valid input comes back equivalent.
//!
//! A geometry that repairs to nothing (a sliver polygon, a ring of one
//! repeated point) is [`Repaired::Empty`], which callers report as an empty
//! result. Only geometries that cannot be processed at all (non-finite
//! coordinates, unparseable text) are errors.

use geo::{BooleanOps, CoordsIter, RemoveRepeatedPoints};
use geo_types::{Geometry, GeometryCollection, LineString, MultiPoint, MultiPolygon, Point, Polygon};
use geosieve_error::{ErrorCode, ErrorContext, Result, SieveError};

use crate::wkt_io::{is_empty, parse_wkt};

#[derive(Debug, Clone, PartialEq)]
pub enum Repaired {
    Valid(Geometry<f64>),
    /// Repair succeeded but nothing is left.
    Empty,
}

impl Repaired {
    pub fn is_empty(&self) -> bool {
        matches!(self, Repaired::Empty)
    }

    pub fn into_geometry(self) -> Option<Geometry<f64>> {
        match self {
            Repaired::Valid(g) => Some(g),
            Repaired::Empty => None,
        }
    }

    fn from_geometry(geom: Geometry<f64>) -> Self {
        if is_empty(&geom) {
            Repaired::Empty
        } else {
            Repaired::Valid(geom)
        }
    }
}

/// Parse and repair a WKT source geometry.
pub fn repair_wkt(text: &str) -> Result<Repaired> {
    repair(parse_wkt(text)?)
}

pub fn repair(geom: Geometry<f64>) -> Result<Repaired> {
    if !geom
        .coords_iter()
        .all(|c| c.x.is_finite() && c.y.is_finite())
    {
        return Err(SieveError::new(
            ErrorCode::GeometryRepairFailed,
            "Geometry has non-finite coordinates",
        )
        .with_context(ErrorContext::Geometry {
            index: None,
            reason: "non-finite coordinate".to_string(),
        }));
    }
    if is_empty(&geom) {
        return Ok(Repaired::Empty);
    }

    let repaired = match geom {
        Geometry::Point(p) => Geometry::Point(p),
        Geometry::MultiPoint(mp) => repair_points(mp),
        Geometry::Line(l) => repair_line(LineString::from(vec![l.start, l.end])),
        Geometry::LineString(ls) => repair_line(ls),
        Geometry::MultiLineString(mls) => {
            let parts: Vec<Geometry<f64>> = mls.0.into_iter().map(repair_line).collect();
            collect_parts(parts)
        }
        Geometry::Polygon(p) => repair_polygons(vec![p]),
        Geometry::Rect(r) => repair_polygons(vec![r.to_polygon()]),
        Geometry::Triangle(t) => repair_polygons(vec![t.to_polygon()]),
        Geometry::MultiPolygon(mp) => repair_polygons(mp.0),
        Geometry::GeometryCollection(gc) => {
            let mut parts = Vec::with_capacity(gc.0.len());
            for child in gc.0 {
                if let Repaired::Valid(g) = repair(child)? {
                    parts.push(g);
                }
            }
            collect_parts(parts)
        }
    };
    Ok(Repaired::from_geometry(repaired))
}

fn repair_points(mp: MultiPoint<f64>) -> Geometry<f64> {
    let mut points: Vec<Point<f64>> = Vec::with_capacity(mp.0.len());
    for p in mp.0 {
        if !points.contains(&p) {
            points.push(p);
        }
    }
    match points.len() {
        1 => Geometry::Point(points[0]),
        _ => Geometry::MultiPoint(MultiPoint::new(points)),
    }
}

fn repair_line(ls: LineString<f64>) -> Geometry<f64> {
    let ls = ls.remove_repeated_points();
    match ls.0.len() {
        0 => Geometry::GeometryCollection(GeometryCollection(Vec::new())),
        1 => Geometry::Point(Point::from(ls.0[0])),
        _ => Geometry::LineString(ls),
    }
}

/// Drop repeated vertices and rings with fewer than three distinct vertices.
fn clean_ring(ring: &LineString<f64>) -> Option<LineString<f64>> {
    let ring = ring.remove_repeated_points();
    let distinct = if ring.is_closed() && ring.0.len() > 1 {
        ring.0.len() - 1
    } else {
        ring.0.len()
    };
    (distinct >= 3).then_some(ring)
}

/// Rebuild polygons from cleaned rings, then union them. The union resolves
/// self-intersections, overlapping parts and wrong ring orientation.
fn repair_polygons(polygons: Vec<Polygon<f64>>) -> Geometry<f64> {
    let cleaned: Vec<Polygon<f64>> = polygons
        .iter()
        .filter_map(|p| {
            let exterior = clean_ring(p.exterior())?;
            let interiors = p.interiors().iter().filter_map(clean_ring).collect();
            Some(Polygon::new(exterior, interiors))
        })
        .collect();
    if cleaned.is_empty() {
        return Geometry::GeometryCollection(GeometryCollection(Vec::new()));
    }

    let normalized = MultiPolygon::new(cleaned).union(&MultiPolygon::<f64>::new(Vec::new()));
    let mut parts = normalized.0;
    match parts.len() {
        0 => Geometry::GeometryCollection(GeometryCollection(Vec::new())),
        1 => Geometry::Polygon(parts.remove(0)),
        _ => Geometry::MultiPolygon(MultiPolygon::new(parts)),
    }
}

fn collect_parts(mut parts: Vec<Geometry<f64>>) -> Geometry<f64> {
    parts.retain(|g| !is_empty(g));
    match parts.len() {
        1 => parts.remove(0),
        _ => Geometry::GeometryCollection(GeometryCollection(parts)),
    }
}

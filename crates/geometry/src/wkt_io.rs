use std::str::FromStr;

use geo_types::{Geometry, GeometryCollection};
use geosieve_error::{ErrorCode, ErrorContext, Result, SieveError};
use wkt::ToWkt;

/// Split an optional EWKT `SRID=n;` prefix from the geometry text.
pub fn split_srid(text: &str) -> (Option<i32>, &str) {
    let trimmed = text.trim();
    let upper_prefix = trimmed.get(..5).map(|p| p.eq_ignore_ascii_case("SRID="));
    if upper_prefix == Some(true) {
        if let Some((srid, rest)) = trimmed[5..].split_once(';') {
            return (srid.trim().parse().ok(), rest.trim());
        }
    }
    (None, trimmed)
}

/// Parse WKT (or EWKT) into a geometry. `... EMPTY` parses to an empty
/// collection.
pub fn parse_wkt(text: &str) -> Result<Geometry<f64>> {
    let (_, body) = split_srid(text);
    if body.to_ascii_uppercase().ends_with("EMPTY") {
        return Ok(Geometry::GeometryCollection(GeometryCollection(Vec::new())));
    }
    wkt::Wkt::<f64>::from_str(body)
        .map_err(|e| invalid(body, format!("WKT parse error: {:?}", e)))
        .and_then(|w| {
            w.try_into()
                .map_err(|e: wkt::conversion::Error| invalid(body, format!("{:?}", e)))
        })
}

pub fn to_wkt(geom: &Geometry<f64>) -> String {
    if is_empty(geom) {
        return "GEOMETRYCOLLECTION EMPTY".to_string();
    }
    geom.wkt_string()
}

/// Whether the geometry has no coordinates at all.
pub fn is_empty(geom: &Geometry<f64>) -> bool {
    match geom {
        Geometry::Point(_) | Geometry::Line(_) | Geometry::Rect(_) | Geometry::Triangle(_) => false,
        Geometry::LineString(ls) => ls.0.is_empty(),
        Geometry::Polygon(p) => p.exterior().0.is_empty(),
        Geometry::MultiPoint(mp) => mp.0.is_empty(),
        Geometry::MultiLineString(mls) => mls.0.iter().all(|ls| ls.0.is_empty()),
        Geometry::MultiPolygon(mp) => mp.0.iter().all(|p| p.exterior().0.is_empty()),
        Geometry::GeometryCollection(gc) => gc.0.iter().all(is_empty),
    }
}

fn invalid(text: &str, reason: String) -> SieveError {
    let snippet: String = text.chars().take(48).collect();
    SieveError::new(
        ErrorCode::InvalidGeometry,
        format!("Cannot parse geometry '{}': {}", snippet, reason),
    )
    .with_context(ErrorContext::Geometry {
        index: None,
        reason,
    })
}

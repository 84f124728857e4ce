//! SpatiaLite-compatible SQL functions implemented in-process.
//!
//! When the SpatiaLite extension cannot be loaded, the embedded backend
//! registers these on its connection instead. Geometries travel between the
//! functions as WKT text, so they only work on tables whose geometry column
//! holds WKT. Return conventions follow SpatiaLite: predicates yield `1`, `0`,
//! or `-1` when an argument is not a readable geometry; constructors yield
//! `NULL`.

use std::sync::Arc;

use geo_types::Geometry;
use geosieve_common::SpatialPredicate;
use geosieve_geometry::wkt_io::is_empty;
use geosieve_geometry::{buffer_geometry, evaluate, parse_wkt, repair, to_wkt, Repaired};
use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::ValueRef;
use rusqlite::Connection;

const EMPTY_WKT: &str = "GEOMETRYCOLLECTION EMPTY";

fn flags() -> FunctionFlags {
    FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC
}

fn geometry_arg(value: ValueRef<'_>) -> Option<Geometry<f64>> {
    match value {
        ValueRef::Text(bytes) => std::str::from_utf8(bytes).ok().and_then(|t| parse_wkt(t).ok()),
        _ => None,
    }
}

fn repaired_wkt(repaired: Repaired) -> String {
    match repaired {
        Repaired::Valid(geom) => to_wkt(&geom),
        Repaired::Empty => EMPTY_WKT.to_string(),
    }
}

fn geom_from_text(ctx: &Context<'_>) -> rusqlite::Result<Option<String>> {
    Ok(geometry_arg(ctx.get_raw(0)).map(|g| to_wkt(&g)))
}

fn make_valid(ctx: &Context<'_>) -> rusqlite::Result<Option<String>> {
    Ok(geometry_arg(ctx.get_raw(0))
        .and_then(|g| repair(g).ok())
        .map(repaired_wkt))
}

fn buffer(ctx: &Context<'_>) -> rusqlite::Result<Option<String>> {
    let Some(geom) = geometry_arg(ctx.get_raw(0)) else {
        return Ok(None);
    };
    let distance = match ctx.get_raw(1) {
        ValueRef::Integer(i) => i as f64,
        ValueRef::Real(f) => f,
        _ => return Ok(None),
    };
    if !distance.is_finite() {
        return Ok(None);
    }
    Ok(Some(repaired_wkt(buffer_geometry(&geom, distance))))
}

fn is_empty_fn(ctx: &Context<'_>) -> rusqlite::Result<i64> {
    Ok(match geometry_arg(ctx.get_raw(0)) {
        Some(geom) => i64::from(is_empty(&geom)),
        None => -1,
    })
}

fn register_predicate(conn: &Connection, name: &str, predicate: SpatialPredicate) -> rusqlite::Result<()> {
    conn.create_scalar_function(name, 2, flags(), move |ctx| {
        // The source argument is usually constant across rows; SQLite keeps
        // the parsed geometry around for it.
        let source: Arc<Option<Geometry<f64>>> =
            ctx.get_or_create_aux(1, |v| Ok::<_, std::convert::Infallible>(geometry_arg(v)))?;
        let candidate = geometry_arg(ctx.get_raw(0));
        Ok(match (candidate, source.as_ref()) {
            (Some(candidate), Some(source)) => i64::from(evaluate(predicate, &candidate, source)),
            _ => -1_i64,
        })
    })
}

/// Register `GeomFromText`, `MakeValid`, `Buffer`, `IsEmpty`, `Transform` and
/// the eight predicates on `conn`.
pub fn register_spatial_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function("GeomFromText", 1, flags(), geom_from_text)?;
    conn.create_scalar_function("GeomFromText", 2, flags(), geom_from_text)?;
    conn.create_scalar_function("MakeValid", 1, flags(), make_valid)?;
    conn.create_scalar_function("Buffer", 2, flags(), buffer)?;
    conn.create_scalar_function("Buffer", 3, flags(), buffer)?;
    conn.create_scalar_function("IsEmpty", 1, flags(), is_empty_fn)?;
    conn.create_scalar_function("Transform", 2, flags(), |_ctx| -> rusqlite::Result<Option<String>> {
        Err(rusqlite::Error::UserFunctionError(
            "Transform needs the SpatiaLite extension".into(),
        ))
    })?;

    for predicate in SpatialPredicate::ALL {
        let name = match predicate {
            SpatialPredicate::Intersects => "Intersects",
            SpatialPredicate::Contains => "Contains",
            SpatialPredicate::Within => "Within",
            SpatialPredicate::Crosses => "Crosses",
            SpatialPredicate::Overlaps => "Overlaps",
            SpatialPredicate::Touches => "Touches",
            SpatialPredicate::Disjoint => "Disjoint",
            SpatialPredicate::Equals => "Equals",
        };
        register_predicate(conn, name, predicate)?;
    }
    Ok(())
}

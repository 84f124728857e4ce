use geo::Buffer;
use geo_types::Geometry;

use crate::repair::Repaired;

/// Buffer a repaired geometry by a signed distance. Negative distances erode
/// polygons and remove points and lines entirely; an eroded-away result is
/// [`Repaired::Empty`].
pub fn buffer_geometry(geom: &Geometry<f64>, distance: f64) -> Repaired {
    if distance == 0.0 {
        return Repaired::Valid(geom.clone());
    }
    let buffered = geom.buffer(distance);
    if buffered.0.is_empty() {
        tracing::debug!(target: "fallback", distance, "Buffer eroded geometry to nothing");
        return Repaired::Empty;
    }
    Repaired::Valid(Geometry::MultiPolygon(buffered))
}

use geo::{BoundingRect, Relate};
use geo_types::Geometry;
use geosieve_common::SpatialPredicate;

/// Evaluate `predicate(candidate, source)`, with the same argument order the
/// generated SQL uses: the target feature first, the source geometry second.
pub fn evaluate(predicate: SpatialPredicate, candidate: &Geometry<f64>, source: &Geometry<f64>) -> bool {
    if predicate != SpatialPredicate::Disjoint && !bbox_overlaps(candidate, source) {
        return false;
    }
    let matrix = candidate.relate(source);
    match predicate {
        SpatialPredicate::Intersects => matrix.is_intersects(),
        SpatialPredicate::Contains => matrix.is_contains(),
        SpatialPredicate::Within => matrix.is_within(),
        SpatialPredicate::Crosses => matrix.is_crosses(),
        SpatialPredicate::Overlaps => matrix.is_overlaps(),
        SpatialPredicate::Touches => matrix.is_touches(),
        SpatialPredicate::Disjoint => matrix.is_disjoint(),
        SpatialPredicate::Equals => matrix.is_equal_topo(),
    }
}

/// True when any predicate holds against any source geometry.
pub fn evaluate_any<'a, P>(predicates: P, candidate: &Geometry<f64>, sources: &[Geometry<f64>]) -> bool
where
    P: IntoIterator<Item = &'a SpatialPredicate> + Clone,
{
    sources.iter().any(|source| {
        predicates
            .clone()
            .into_iter()
            .any(|p| evaluate(*p, candidate, source))
    })
}

fn bbox_overlaps(a: &Geometry<f64>, b: &Geometry<f64>) -> bool {
    match (a.bounding_rect(), b.bounding_rect()) {
        (Some(ra), Some(rb)) => {
            ra.min().x <= rb.max().x
                && ra.max().x >= rb.min().x
                && ra.min().y <= rb.max().y
                && ra.max().y >= rb.min().y
        }
        _ => false,
    }
}

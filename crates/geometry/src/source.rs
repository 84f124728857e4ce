use geo_types::Geometry;
use geosieve_error::{ErrorContext, SieveError};

use crate::buffer::buffer_geometry;
use crate::repair::{repair_wkt, Repaired};

/// Literal source geometries after repair and buffering.
#[derive(Debug, Default)]
pub struct PreparedSource {
    /// WKT of the literals that are still usable, in input order.
    pub wkts: Vec<String>,
    /// Repaired (and buffered) geometries, parallel to `wkts`.
    pub geometries: Vec<Geometry<f64>>,
    /// Literals that could not be parsed or repaired.
    pub skipped: Vec<SieveError>,
    /// Literals that repaired or buffered to nothing.
    pub eroded: usize,
}

impl PreparedSource {
    pub fn is_empty(&self) -> bool {
        self.geometries.is_empty()
    }

    /// Nothing usable because every literal failed, as opposed to being
    /// legitimately eroded away.
    pub fn all_failed(&self) -> bool {
        self.geometries.is_empty() && self.eroded == 0 && !self.skipped.is_empty()
    }
}

/// Repair every literal and apply a constant buffer. Failures are collected
/// per literal rather than aborting.
pub fn prepare_literals(wkts: &[String], buffer: Option<f64>) -> PreparedSource {
    let mut prepared = PreparedSource::default();
    for (index, wkt) in wkts.iter().enumerate() {
        let repaired = match repair_wkt(wkt) {
            Ok(r) => r,
            Err(e) => {
                let reason = e.message.clone();
                prepared
                    .skipped
                    .push(e.with_context(ErrorContext::Geometry {
                        index: Some(index),
                        reason,
                    }));
                continue;
            }
        };
        let result = match (repaired, buffer) {
            (Repaired::Valid(g), Some(d)) => buffer_geometry(&g, d),
            (other, _) => other,
        };
        match result {
            Repaired::Valid(g) => {
                prepared.wkts.push(wkt.clone());
                prepared.geometries.push(g);
            }
            Repaired::Empty => prepared.eroded += 1,
        }
    }
    prepared
}

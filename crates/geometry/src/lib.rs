//! In-process geometry support for the filter engine.
//!
//! - WKT parsing and writing (`wkt_io`)
//! - GeometryRepair (`repair`): the normalization every source geometry goes
//!   through before it reaches a predicate
//! - Signed buffering (`buffer`)
//! - Evaluation of the eight spatial predicates (`predicate`)
//! - Preparation of literal source geometries (`source`)
//! - Content hashing of source geometries for the step cache (`hash`)

pub mod buffer;
pub mod hash;
pub mod predicate;
pub mod repair;
pub mod source;
pub mod wkt_io;

pub use buffer::buffer_geometry;
pub use hash::source_hash;
pub use predicate::{evaluate, evaluate_any};
pub use repair::{repair, repair_wkt, Repaired};
pub use source::{prepare_literals, PreparedSource};
pub use wkt_io::{parse_wkt, to_wkt};

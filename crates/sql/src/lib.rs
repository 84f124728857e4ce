//! SQL side of the filter engine.
//!
//! This crate turns a `FilterSpec` into filter text a spatial database can
//! apply to a dataset:
//! - **Dialects**: PostGIS and SpatiaLite function naming (`dialects`).
//! - **Spatial clauses**: repaired, optionally buffered source geometries
//!   tested against the target geometry column (`spatial`).
//! - **Filter text algebra**: combining, classifying and key-membership
//!   filters (`filter`).
//! - **Attribute conditions**: parsing and in-process evaluation
//!   (`condition`), used by the fallback backend and to fail fast on
//!   malformed conditions before they reach a database.
pub mod condition;
pub mod dialects;
pub mod error;
pub mod filter;
pub mod sanitize;
pub mod spatial;

pub use condition::{validate_expression, Attributes, AttrValue, Condition};
pub use dialects::SqlDialect;
pub use error::SqlGenError;
pub use filter::{
    classify_filter, combine_filter, key_membership, key_subquery, retained_attribute,
    FilterClass, FilterClassifier, MATCH_NOTHING,
};
pub use spatial::SpatialClauseBuilder;

//! Filter backends for geosieve.
//!
//! A backend turns a [`FilterSpec`](geosieve_common::FilterSpec) into a filter
//! text for one dataset. Three implementations exist, in order of preference:
//!
//! | Backend | Module | Stores |
//! |---------|--------|--------|
//! | Relational | [`backends::sql::postgres`] | PostGIS over a pooled `tokio-postgres` client |
//! | Embedded | [`backends::sql::sqlite`] | SpatiaLite / GeoPackage files through `rusqlite` |
//! | Fallback | [`backends::fallback`] | Anything a [`readers::FeatureReader`] can read |
//!
//! [`selector::BackendSelector`] builds the ordered chain of backends to try
//! for a dataset.

pub mod backends;
pub mod readers;
pub mod selector;

pub use backends::{Backend, BackendPort};
pub use readers::{Feature, FeatureReader, ReaderRegistry};
pub use selector::{BackendSelector, Capabilities};

//! Backends that push the filter down to a spatial database.
//!
//! - [`postgres`]: PostGIS through pooled `tokio-postgres` connections, with
//!   precomputed materialized views for large datasets.
//! - [`sqlite`]: SpatiaLite and GeoPackage files through `rusqlite`, with the
//!   step cache and staging tables for large id sets.
//! - [`sqlite_functions`]: in-process replacements for the SpatiaLite
//!   functions, used when the extension cannot be loaded.

pub mod common;
pub mod postgres;
pub mod sqlite;
pub mod sqlite_functions;

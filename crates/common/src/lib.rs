//! Common utilities, types, and configurations shared across geosieve crates.
//!
//! This crate contains the leaf building blocks of the filter engine:
//! - **Data model**: datasets, filter requests and results (`models`).
//! - **Configuration**: Strongly typed application configuration (`config`).
//! - **Resilience**: Circuit breakers (`circuit_breaker`), the connection pool
//!   (`pool`) and lock retry (`retry`).
//! - **Step cache**: Feature-id sets of prior filter steps (`step_cache`).
//! - **Cancellation**: Cooperative request cancellation (`cancel`).
//! - **Telemetry / logging**: Subscriber setup, warning collection and log
//!   scrubbing (`telemetry`, `warnings`, `scrubber`).
pub mod cancel;
pub mod circuit_breaker;
pub mod config;
pub mod models;
pub mod pool;
pub mod retry;
pub mod scrubber;
pub mod step_cache;
pub mod telemetry;
pub mod warnings;

pub use crate::cancel::CancelToken;
pub use crate::models::{
    BackendKind, BufferDistance, BufferSpec, CombineOperator, DatasetDescriptor, FeatureId,
    FeatureIdSet, FilterRequest, FilterResult, FilterSpec, FilterStatus, Matched, PrimaryKey,
    ProviderKind, SourceGeometry, SpatialPredicate,
};

//! geosieve runtime: the filter engine orchestrator.
//!
//! This crate ties the backends together into one request path that the
//! layer-management and UI layers call into.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │ FilterEngine │  submit / execute / reset / shutdown
//! └──────┬───────┘
//!        │
//! ┌──────┴─────────┐
//! │ BackendSelector│  Relational → Embedded → Fallback
//! └──────┬─────────┘
//!        │
//!   ┌────┴─────┐
//!   │ Backends │ (PostGIS, SpatiaLite/GeoPackage, in-process)
//!   └──────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use geosieve_common::config::AppConfig;
//! use geosieve_connectors::ReaderRegistry;
//! use geosieve_runtime::engine::FilterEngine;
//!
//! let engine = FilterEngine::new(AppConfig::default(), Arc::new(ReaderRegistry::new()));
//! # let _ = engine;
//! ```

pub mod engine;

pub use engine::{EngineStats, FilterEngine, FilterHandle};

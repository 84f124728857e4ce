//! geosieve entry point.
//!
//! Runs a single filter request from the command line:
//! - Configuration loading (file plus `GEOSIEVE__*` overrides)
//! - Telemetry initialization
//! - Request execution and JSON output of the `FilterResult`
use std::sync::Arc;

use anyhow::Context;
use geosieve_common::config::AppConfig;
use geosieve_common::{FilterRequest, FilterStatus};
use geosieve_connectors::ReaderRegistry;
use geosieve_runtime::engine::FilterEngine;

const USAGE: &str = "usage: geosieve <config> <request.json>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let (Some(config_path), Some(request_path)) = (args.next(), args.next()) else {
        anyhow::bail!(USAGE);
    };

    let config = AppConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load configuration from '{}'", config_path))?;
    geosieve_common::telemetry::init_tracing(&config.telemetry)?;
    tracing::info!(config = %config_path, "Tracing initialized");

    let raw = tokio::fs::read_to_string(&request_path)
        .await
        .with_context(|| format!("Failed to read request file '{}'", request_path))?;
    let request: FilterRequest =
        serde_json::from_str(&raw).context("Failed to parse filter request")?;

    let engine = FilterEngine::new(config, Arc::new(ReaderRegistry::new()));
    let handle = engine.submit(request);

    // Ctrl-C cancels the request; the backends still clean up before the
    // result comes back.
    let token = handle.cancel_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling filter request");
            token.cancel();
        }
    });

    let result = handle.join().await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    engine.shutdown().await;

    if result.status == FilterStatus::Error {
        std::process::exit(1);
    }
    Ok(())
}

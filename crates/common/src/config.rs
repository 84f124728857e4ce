use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use validator::Validate;

// Default constants
pub const DEFAULT_VIEW_THRESHOLD: u64 = 10_000;
pub const DEFAULT_VIEW_PREFIX: &str = "geosieve_mv_";
pub const DEFAULT_STAGE_PREFIX: &str = "geosieve_stage_";

pub const DEFAULT_POOL_MIN_SIZE: usize = 1;
pub const DEFAULT_POOL_MAX_SIZE: usize = 10;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_COOLDOWN_MS: u64 = 30_000;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;
pub const DEFAULT_MAX_DELAY_MS: u64 = 5000;

pub const DEFAULT_INLINE_ID_LIMIT: usize = 5000;
pub const DEFAULT_CANCEL_CHECK_INTERVAL: usize = 256;

pub const DEFAULT_CACHE_MAX_ENTRIES: u64 = 1024;
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Deserialize, Default, Clone, Validate)]
pub struct AppConfig {
    #[serde(default)]
    #[validate(nested)]
    pub relational: RelationalSettings,
    #[serde(default)]
    #[validate(nested)]
    pub pool: PoolSettings,
    #[serde(default)]
    #[validate(nested)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    #[validate(nested)]
    pub lock_retry: RetrySettings,
    #[serde(default)]
    #[validate(nested)]
    pub embedded: EmbeddedSettings,
    #[serde(default)]
    #[validate(nested)]
    pub fallback: FallbackSettings,
    #[serde(default)]
    pub cache: StepCacheSettings,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct RelationalSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Feature-count estimate at which the precomputed-view strategy is used.
    #[serde(default = "default_view_threshold")]
    #[validate(range(min = 1))]
    pub view_threshold: u64,
    #[serde(default = "default_view_prefix")]
    #[validate(custom(function = "validate_prefix"))]
    pub view_prefix: String,
    /// Per-statement timeout in milliseconds. 0 disables it.
    #[serde(default)]
    pub statement_timeout_ms: u64,
}

impl Default for RelationalSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            view_threshold: DEFAULT_VIEW_THRESHOLD,
            view_prefix: default_view_prefix(),
            statement_timeout_ms: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Validate)]
#[validate(schema(function = "validate_pool_bounds"))]
pub struct PoolSettings {
    #[serde(default = "default_pool_min_size")]
    pub min_size: usize,
    #[serde(default = "default_pool_max_size")]
    #[validate(range(min = 1))]
    pub max_size: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_acquire_timeout_ms")]
    #[validate(range(min = 1))]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_health_check_interval_secs")]
    #[validate(range(min = 1))]
    pub health_check_interval_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_POOL_MIN_SIZE,
            max_size: DEFAULT_POOL_MAX_SIZE,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            health_check_interval_secs: DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
        }
    }
}

impl PoolSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Validate)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    #[validate(range(min = 1))]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
        }
    }
}

impl BreakerSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Validate)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1))]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct EmbeddedSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Path of the SpatiaLite loadable extension. When unset, spatial SQL
    /// functions are provided in-process.
    #[serde(default)]
    pub spatialite_path: Option<String>,
    /// Above this many ids the membership filter goes through a staging table.
    #[serde(default = "default_inline_id_limit")]
    #[validate(range(min = 1))]
    pub inline_id_limit: usize,
    /// SQLite's own busy handler timeout. Kept at 0 so lock contention
    /// surfaces to the retry loop.
    #[serde(default)]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_stage_prefix")]
    #[validate(custom(function = "validate_prefix"))]
    pub stage_prefix: String,
}

impl Default for EmbeddedSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            spatialite_path: None,
            inline_id_limit: DEFAULT_INLINE_ID_LIMIT,
            busy_timeout_ms: 0,
            stage_prefix: default_stage_prefix(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Validate)]
pub struct FallbackSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of features evaluated between cancellation checks.
    #[serde(default = "default_cancel_check_interval")]
    #[validate(range(min = 1))]
    pub cancel_check_interval: usize,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cancel_check_interval: DEFAULT_CANCEL_CHECK_INTERVAL,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StepCacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for StepCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_view_threshold() -> u64 {
    DEFAULT_VIEW_THRESHOLD
}

fn default_view_prefix() -> String {
    DEFAULT_VIEW_PREFIX.to_string()
}

fn default_stage_prefix() -> String {
    DEFAULT_STAGE_PREFIX.to_string()
}

fn default_pool_min_size() -> usize {
    DEFAULT_POOL_MIN_SIZE
}

fn default_pool_max_size() -> usize {
    DEFAULT_POOL_MAX_SIZE
}

fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_acquire_timeout_ms() -> u64 {
    DEFAULT_ACQUIRE_TIMEOUT_MS
}

fn default_health_check_interval_secs() -> u64 {
    DEFAULT_HEALTH_CHECK_INTERVAL_SECS
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_cooldown_ms() -> u64 {
    DEFAULT_COOLDOWN_MS
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

fn default_inline_id_limit() -> usize {
    DEFAULT_INLINE_ID_LIMIT
}

fn default_cancel_check_interval() -> usize {
    DEFAULT_CANCEL_CHECK_INTERVAL
}

fn default_cache_max_entries() -> u64 {
    DEFAULT_CACHE_MAX_ENTRIES
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn validate_pool_bounds(pool: &PoolSettings) -> Result<(), validator::ValidationError> {
    if pool.min_size > pool.max_size {
        return Err(validator::ValidationError::new("min_size_exceeds_max_size"));
    }
    Ok(())
}

/// View and staging names are built from this prefix, so it must be a plain
/// lowercase identifier.
fn validate_prefix(prefix: &str) -> Result<(), validator::ValidationError> {
    let valid = !prefix.is_empty()
        && prefix.len() <= 32
        && prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !prefix.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(validator::ValidationError::new("invalid_prefix"))
    }
}

impl AppConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let builder = config::Config::builder();

        let builder = if std::path::Path::new(path).exists() {
            builder.add_source(config::File::with_name(path))
        } else {
            builder
        };

        // Map GEOSIEVE_POOL__MAX_SIZE to pool.max_size, etc.
        let builder = builder.add_source(
            config::Environment::with_prefix("GEOSIEVE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().context("Failed to build configuration")?;

        let app_config: AppConfig = cfg
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config
            .validate()
            .map_err(|e| anyhow::anyhow!("Configuration validation failed: {:?}", e))?;

        Ok(app_config)
    }
}

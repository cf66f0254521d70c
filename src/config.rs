use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::exchange::binance::{BINANCE_BASE_URL, MAX_CANDLES_PER_REQUEST};
use crate::model::TimeFrame;
use crate::sync::SyncSettings;

const DB_FILE_NAME: &str = "kline-pipeline.db";

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

fn default_data_dir() -> String {
    "./data".into()
}

fn default_base_url() -> String {
    BINANCE_BASE_URL.into()
}

fn default_symbol() -> String {
    "BTCUSDT".into()
}

fn default_interval() -> String {
    "1h".into()
}

/// 2017-08-17 04:00 UTC, first BTCUSDT kline on Binance.
fn default_listing_epoch_ms() -> i64 {
    1_502_942_400_000
}

fn default_page_limit() -> usize {
    MAX_CANDLES_PER_REQUEST
}

fn default_requests_per_second() -> u32 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_batch_size() -> usize {
    1000
}

fn default_schedule_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Accepted values: `"text"` | `"json"`
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

#[derive(Debug, Deserialize)]
pub struct MarketConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_listing_epoch_ms")]
    pub listing_epoch_ms: i64,
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            symbol: default_symbol(),
            interval: default_interval(),
            listing_epoch_ms: default_listing_epoch_ms(),
            page_limit: default_page_limit(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_schedule_secs")]
    pub schedule_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            schedule_secs: default_schedule_secs(),
        }
    }
}

impl AppConfig {
    pub fn db_path(&self) -> PathBuf {
        Path::new(&self.general.data_dir).join(DB_FILE_NAME)
    }

    /// Interval of the tracked series. Validated on load.
    pub fn timeframe(&self) -> TimeFrame {
        TimeFrame::from_str(&self.market.interval).unwrap_or(TimeFrame::Hour1)
    }

    pub fn schedule(&self) -> Duration {
        Duration::from_secs(self.pipeline.schedule_secs)
    }

    pub fn sync_settings(&self) -> Result<SyncSettings, Report<ConfigError>> {
        let listing_epoch = DateTime::<Utc>::from_timestamp_millis(self.market.listing_epoch_ms)
            .ok_or_else(|| invalid("market.listing_epoch_ms is out of range"))?;
        let requests_per_second = NonZeroU32::new(self.sync.requests_per_second)
            .ok_or_else(|| invalid("sync.requests_per_second must be positive"))?;
        Ok(SyncSettings {
            listing_epoch,
            requests_per_second,
            max_attempts: self.sync.max_attempts,
            retry_delay: Duration::from_millis(self.sync.retry_delay_ms),
        })
    }
}

/// Load and validate an `AppConfig` from a TOML file at `path`.
pub fn load(path: &Path) -> Result<AppConfig, Report<ConfigError>> {
    let content = std::fs::read_to_string(path)
        .change_context(ConfigError::ReadFile)
        .attach_with(|| format!("path: {}", path.display()))?;

    let config: AppConfig = toml::from_str(&content).change_context(ConfigError::Parse {
        reason: "invalid TOML syntax or schema mismatch".into(),
    })?;

    validate(&config)?;

    Ok(config)
}

fn invalid(field: &str) -> Report<ConfigError> {
    Report::new(ConfigError::Validation {
        field: field.to_owned(),
    })
}

fn validate(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    validate_market(&config.market)?;
    validate_counters(config)?;
    config.sync_settings()?;
    Ok(())
}

fn validate_market(market: &MarketConfig) -> Result<(), Report<ConfigError>> {
    if market.symbol.trim().is_empty() {
        return Err(invalid("market.symbol must not be empty"));
    }
    if TimeFrame::from_str(&market.interval).is_none() {
        return Err(invalid(&format!(
            "market.interval: unknown interval \"{}\"",
            market.interval
        )));
    }
    if !(1..=MAX_CANDLES_PER_REQUEST).contains(&market.page_limit) {
        return Err(invalid(&format!(
            "market.page_limit must be within 1..={MAX_CANDLES_PER_REQUEST}, got {}",
            market.page_limit
        )));
    }
    Ok(())
}

fn validate_counters(config: &AppConfig) -> Result<(), Report<ConfigError>> {
    if config.sync.requests_per_second == 0 {
        return Err(invalid("sync.requests_per_second must be positive"));
    }
    if config.sync.max_attempts == 0 {
        return Err(invalid("sync.max_attempts must be positive"));
    }
    if config.engine.batch_size == 0 {
        return Err(invalid("engine.batch_size must be positive"));
    }
    if config.pipeline.schedule_secs == 0 {
        return Err(invalid("pipeline.schedule_secs must be positive"));
    }
    Ok(())
}

pub mod sqlite;

use chrono::{DateTime, Utc};
use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::StorageError;
use crate::model::{Candle, IndicatorRecord};

/// Append-only store of candles keyed by open time.
///
/// Every list returned is in ascending open-time order unless noted.
pub trait CandleStore: Send + Sync {
    fn candle_exists(
        &self,
        open_time: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<bool, Report<StorageError>>>;

    /// Insert `candle` unless its open time is already stored. Returns whether
    /// a row was written; an existing row is never overwritten.
    fn save_candle(&self, candle: &Candle) -> BoxFuture<'_, Result<bool, Report<StorageError>>>;

    fn count_candles(&self) -> BoxFuture<'_, Result<u64, Report<StorageError>>>;

    fn max_candle_open_time(
        &self,
    ) -> BoxFuture<'_, Result<Option<DateTime<Utc>>, Report<StorageError>>>;

    fn min_candle_open_time(
        &self,
    ) -> BoxFuture<'_, Result<Option<DateTime<Utc>>, Report<StorageError>>>;

    /// All candles strictly after `time`.
    fn candles_after(
        &self,
        time: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<Candle>, Report<StorageError>>>;

    /// At most `limit` candles strictly after `time`.
    fn candles_after_limit(
        &self,
        time: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Candle>, Report<StorageError>>>;

    fn first_candles(&self, limit: usize)
    -> BoxFuture<'_, Result<Vec<Candle>, Report<StorageError>>>;

    /// The `limit` newest candles at or before `time`, most recent FIRST.
    fn last_candles(
        &self,
        before_inclusive: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Candle>, Report<StorageError>>>;

    fn delete_all_candles(&self) -> BoxFuture<'_, Result<u64, Report<StorageError>>>;
}

/// Store of derived indicator records, one per eligible candle.
pub trait IndicatorStore: Send + Sync {
    /// Insert or replace the record for its open time atomically.
    fn save_indicator(
        &self,
        record: &IndicatorRecord,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>>;

    fn max_indicator_open_time(
        &self,
    ) -> BoxFuture<'_, Result<Option<DateTime<Utc>>, Report<StorageError>>>;

    fn find_indicator(
        &self,
        open_time: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<IndicatorRecord>, Report<StorageError>>>;

    /// Set-based delete; records are never loaded.
    fn delete_all_indicators(&self) -> BoxFuture<'_, Result<u64, Report<StorageError>>>;

    fn count_indicators(&self) -> BoxFuture<'_, Result<u64, Report<StorageError>>>;
}

pub mod binance;

use chrono::{DateTime, Utc};
use error_stack::Report;
use futures::future::BoxFuture;

use crate::error::ExchangeError;
use crate::model::Candle;

/// Upstream source of closed candles for the configured symbol and interval.
///
/// Uses `BoxFuture` (from `futures` crate) instead of `async fn` in trait
/// to keep the trait object-safe (`dyn MarketDataSource`).
pub trait MarketDataSource: Send + Sync {
    fn name(&self) -> &str;

    /// Largest page the source returns for a single request.
    fn page_limit(&self) -> usize;

    /// Fetch one page of candles in ascending open-time order, starting at
    /// `since` (inclusive) or at the source's default when `None`.
    fn fetch_candles(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, Result<Vec<Candle>, Report<ExchangeError>>>;
}

pub mod atr;
pub mod bollinger;
pub mod ma;
pub mod rsi;
pub mod volume;

use rust_decimal::Decimal;

use crate::model::Candle;

/// A technical analysis indicator evaluated at the newest candle of a window.
///
/// Candles must be in ascending chronological order (oldest first). A window
/// shorter than [`Indicator::required_candles`] yields `None`: missing
/// history is an expected state, not an error.
pub trait Indicator: Send + Sync {
    type Output;

    fn name(&self) -> &str;

    /// Minimum number of candles required to produce a value.
    fn required_candles(&self) -> usize;

    fn calculate(&self, candles: &[Candle]) -> Option<Self::Output>;
}

/// The newest `n` candles of a chronological window, or `None` if shorter.
pub fn tail(candles: &[Candle], n: usize) -> Option<&[Candle]> {
    candles.len().checked_sub(n).map(|start| &candles[start..])
}

/// Extract close prices from a slice of candles.
pub fn close_prices(candles: &[Candle]) -> Vec<Decimal> {
    candles.iter().map(|c| c.close).collect()
}

/// Extract volumes from a slice of candles.
pub fn volumes(candles: &[Candle]) -> Vec<Decimal> {
    candles.iter().map(|c| c.volume).collect()
}

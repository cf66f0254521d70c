use error_stack::{Report, bail};
use rust_decimal::Decimal;

use crate::error::IndicatorError;
use crate::indicator::{Indicator, close_prices, tail};
use crate::math;
use crate::model::Candle;

/// Simple Moving Average of closes.
pub struct Sma {
    period: usize,
}

impl Sma {
    pub fn new(period: usize) -> Result<Self, Report<IndicatorError>> {
        if period == 0 {
            bail!(IndicatorError::InvalidParameter {
                name: "period must be > 0".into(),
            });
        }
        Ok(Self { period })
    }

    /// Unrounded mean of the newest `period` prices (internal helper).
    pub fn mean_of(&self, prices: &[Decimal]) -> Option<Decimal> {
        let start = prices.len().checked_sub(self.period)?;
        math::mean(&prices[start..])
    }
}

impl Indicator for Sma {
    type Output = Decimal;

    fn name(&self) -> &str {
        "sma"
    }

    fn required_candles(&self) -> usize {
        self.period
    }

    fn calculate(&self, candles: &[Candle]) -> Option<Decimal> {
        self.mean_of(&close_prices(candles)).map(math::to_price_scale)
    }
}

/// Exponential Moving Average, evaluated one step at a time.
///
/// The recurrence is `close * k + previous * (1 - k)` with
/// `k = 2 / (period + 1)`. Callers walking a series must feed back the value
/// produced for the preceding candle; recomputing a fresh seed mid-series
/// yields a different trajectory.
pub struct Ema {
    period: usize,
    k: Decimal,
}

impl Ema {
    pub fn new(period: usize) -> Result<Self, Report<IndicatorError>> {
        if period == 0 {
            bail!(IndicatorError::InvalidParameter {
                name: "period must be > 0".into(),
            });
        }
        let Some(k) = math::div(Decimal::TWO, Decimal::from(period + 1)) else {
            bail!(IndicatorError::InvalidParameter {
                name: "period too large".into(),
            });
        };
        Ok(Self { period, k })
    }

    /// EMA at the newest candle of `candles`.
    ///
    /// Without `previous`, the seed is the SMA of the newest `period` closes.
    pub fn next(&self, candles: &[Candle], previous: Option<Decimal>) -> Option<Decimal> {
        let window = tail(candles, self.period)?;
        let close = window.last()?.close;
        let seed = match previous {
            Some(prev) => prev,
            None => math::mean(&close_prices(window))?,
        };
        let one_minus_k = math::sub(Decimal::ONE, self.k)?;
        let value = math::add(math::mul(close, self.k)?, math::mul(seed, one_minus_k)?)?;
        Some(math::to_price_scale(value))
    }
}

impl Indicator for Ema {
    type Output = Decimal;

    fn name(&self) -> &str {
        "ema"
    }

    fn required_candles(&self) -> usize {
        self.period
    }

    fn calculate(&self, candles: &[Candle]) -> Option<Decimal> {
        self.next(candles, None)
    }
}

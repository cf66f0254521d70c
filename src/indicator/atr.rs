use error_stack::{Report, bail};
use rust_decimal::Decimal;

use crate::error::IndicatorError;
use crate::indicator::{Indicator, tail};
use crate::math;
use crate::model::Candle;

/// Average True Range as a simple mean of the last `period` true ranges.
pub struct Atr {
    period: usize,
}

impl Atr {
    pub fn new(period: usize) -> Result<Self, Report<IndicatorError>> {
        if period == 0 {
            bail!(IndicatorError::InvalidParameter {
                name: "period must be > 0".into(),
            });
        }
        Ok(Self { period })
    }
}

impl Indicator for Atr {
    type Output = Decimal;

    fn name(&self) -> &str {
        "atr"
    }

    fn required_candles(&self) -> usize {
        self.period + 1
    }

    fn calculate(&self, candles: &[Candle]) -> Option<Decimal> {
        let window = tail(candles, self.required_candles())?;
        let ranges: Vec<Decimal> = window
            .windows(2)
            .map(|w| true_range(&w[1], w[0].close))
            .collect::<Option<_>>()?;
        math::mean(&ranges).map(math::to_price_scale)
    }
}

/// `max(high - low, |high - prev_close|, |low - prev_close|)`
fn true_range(candle: &Candle, prev_close: Decimal) -> Option<Decimal> {
    let span = math::sub(candle.high, candle.low)?;
    let up = math::sub(candle.high, prev_close)?.abs();
    let down = math::sub(candle.low, prev_close)?.abs();
    Some(span.max(up).max(down))
}

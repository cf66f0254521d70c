use error_stack::{Report, bail};
use rust_decimal::Decimal;

use crate::error::IndicatorError;
use crate::indicator::{Indicator, close_prices, tail};
use crate::math;
use crate::model::Candle;

/// RSI over the simple (unsmoothed) average of the last `period` changes.
pub struct Rsi {
    period: usize,
}

impl Rsi {
    pub fn new(period: usize) -> Result<Self, Report<IndicatorError>> {
        if period == 0 {
            bail!(IndicatorError::InvalidParameter {
                name: "period must be > 0".into(),
            });
        }
        Ok(Self { period })
    }
}

impl Indicator for Rsi {
    type Output = Decimal;

    fn name(&self) -> &str {
        "rsi"
    }

    fn required_candles(&self) -> usize {
        self.period + 1
    }

    fn calculate(&self, candles: &[Candle]) -> Option<Decimal> {
        let prices = close_prices(tail(candles, self.required_candles())?);
        let deltas: Vec<Decimal> = prices
            .windows(2)
            .map(|w| math::sub(w[1], w[0]))
            .collect::<Option<_>>()?;

        let gains: Vec<Decimal> = deltas.iter().map(|d| (*d).max(Decimal::ZERO)).collect();
        let losses: Vec<Decimal> = deltas.iter().map(|d| (-*d).max(Decimal::ZERO)).collect();
        let avg_gain = math::mean(&gains)?;
        let avg_loss = math::mean(&losses)?;

        rsi_value(avg_gain, avg_loss).map(math::to_percent_scale)
    }
}

fn rsi_value(avg_gain: Decimal, avg_loss: Decimal) -> Option<Decimal> {
    if avg_loss.is_zero() {
        return Some(Decimal::ONE_HUNDRED);
    }
    let rs = math::div(avg_gain, avg_loss)?;
    let ratio = math::div(Decimal::ONE_HUNDRED, math::add(Decimal::ONE, rs)?)?;
    math::sub(Decimal::ONE_HUNDRED, ratio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::flat_candle;
    use rust_decimal_macros::dec;

    fn candles_from_closes(closes: &[Decimal]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| flat_candle(i as i64, c))
            .collect()
    }

    #[test]
    fn rsi_insufficient_data() {
        let rsi = Rsi::new(14).unwrap();
        assert_eq!(rsi.calculate(&candles_from_closes(&[dec!(1); 14])), None);
    }

    #[test]
    fn rsi_period_zero_invalid() {
        assert!(Rsi::new(0).is_err());
    }

    #[test]
    fn rsi_strictly_rising_series_is_100() {
        let rsi = Rsi::new(14).unwrap();
        let closes: Vec<Decimal> = (1..=15).map(Decimal::from).collect();
        let value = rsi.calculate(&candles_from_closes(&closes)).unwrap();
        assert_eq!(value.to_string(), "100.0000");
    }

    #[test]
    fn rsi_all_losses_returns_0() {
        let rsi = Rsi::new(3).unwrap();
        let candles = candles_from_closes(&[dec!(4), dec!(3), dec!(2), dec!(1)]);
        assert_eq!(rsi.calculate(&candles).unwrap().to_string(), "0.0000");
    }

    #[test]
    fn rsi_known_value() {
        let rsi = Rsi::new(4).unwrap();
        // deltas: +2, -1, +2, -1 -> avg_gain 1, avg_loss 0.5, rs 2
        let candles = candles_from_closes(&[dec!(10), dec!(12), dec!(11), dec!(13), dec!(12)]);
        assert_eq!(rsi.calculate(&candles).unwrap().to_string(), "66.6667");
    }

    #[test]
    fn rsi_ignores_history_beyond_period() {
        let rsi = Rsi::new(2).unwrap();
        // a large early drop must not count: last two deltas are gains
        let candles = candles_from_closes(&[dec!(100), dec!(1), dec!(2), dec!(3)]);
        assert_eq!(rsi.calculate(&candles).unwrap().to_string(), "100.0000");
    }
}

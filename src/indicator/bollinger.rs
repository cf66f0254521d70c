use error_stack::{Report, bail};
use rust_decimal::Decimal;

use crate::error::IndicatorError;
use crate::indicator::ma::Sma;
use crate::indicator::{Indicator, close_prices, tail};
use crate::math;
use crate::model::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bands {
    pub upper: Decimal,
    pub middle: Decimal,
    pub lower: Decimal,
}

/// Bollinger Bands around the SMA using the population standard deviation.
pub struct BollingerBands {
    sma: Sma,
    period: usize,
    std_dev_multiplier: Decimal,
}

impl BollingerBands {
    pub fn new(period: usize, std_dev_multiplier: Decimal) -> Result<Self, Report<IndicatorError>> {
        if std_dev_multiplier <= Decimal::ZERO {
            bail!(IndicatorError::InvalidParameter {
                name: "std_dev_multiplier must be > 0".into(),
            });
        }
        Ok(Self {
            sma: Sma::new(period)?,
            period,
            std_dev_multiplier,
        })
    }
}

impl Indicator for BollingerBands {
    type Output = Bands;

    fn name(&self) -> &str {
        "bollinger"
    }

    fn required_candles(&self) -> usize {
        self.period
    }

    fn calculate(&self, candles: &[Candle]) -> Option<Bands> {
        let prices = close_prices(tail(candles, self.period)?);
        let middle = self.sma.mean_of(&prices)?;

        let squares: Vec<Decimal> = prices
            .iter()
            .map(|&p| {
                let d = math::sub(p, middle)?;
                math::mul(d, d)
            })
            .collect::<Option<_>>()?;
        let std_dev = math::sqrt(math::mean(&squares)?)?;
        let width = math::mul(std_dev, self.std_dev_multiplier)?;

        Some(Bands {
            upper: math::to_price_scale(math::add(middle, width)?),
            middle: math::to_price_scale(middle),
            lower: math::to_price_scale(math::sub(middle, width)?),
        })
    }
}

use error_stack::{Report, bail};
use rust_decimal::Decimal;

use crate::error::IndicatorError;
use crate::indicator::{Indicator, tail, volumes};
use crate::math;
use crate::model::Candle;

/// Volume Moving Average: simple average of trading volume over a period.
pub struct VolumeMA {
    period: usize,
}

impl VolumeMA {
    pub fn new(period: usize) -> Result<Self, Report<IndicatorError>> {
        if period == 0 {
            bail!(IndicatorError::InvalidParameter {
                name: "period must be > 0".into(),
            });
        }
        Ok(Self { period })
    }
}

impl Indicator for VolumeMA {
    type Output = Decimal;

    fn name(&self) -> &str {
        "volume_ma"
    }

    fn required_candles(&self) -> usize {
        self.period
    }

    fn calculate(&self, candles: &[Candle]) -> Option<Decimal> {
        let vols = volumes(tail(candles, self.period)?);
        math::mean(&vols).map(math::to_price_scale)
    }
}

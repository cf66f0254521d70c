use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Candle timeframe supported by the pipeline.
///
/// String representations match the config file format (e.g. `"1m"`, `"1h"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeFrame {
    Min1,
    Min3,
    Min5,
    Min15,
    Min30,
    Hour1,
    Hour4,
    Day1,
}

impl TimeFrame {
    /// Parse a config-format string into a `TimeFrame`.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Self::Min1),
            "3m" => Some(Self::Min3),
            "5m" => Some(Self::Min5),
            "15m" => Some(Self::Min15),
            "30m" => Some(Self::Min30),
            "1h" => Some(Self::Hour1),
            "4h" => Some(Self::Hour4),
            "1d" => Some(Self::Day1),
            _ => None,
        }
    }

    /// Return the config-format string representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Min1 => "1m",
            Self::Min3 => "3m",
            Self::Min5 => "5m",
            Self::Min15 => "15m",
            Self::Min30 => "30m",
            Self::Hour1 => "1h",
            Self::Hour4 => "4h",
            Self::Day1 => "1d",
        }
    }

    /// Binance kline interval strings happen to match the config format.
    pub fn binance_interval(self) -> &'static str {
        self.as_str()
    }

    pub fn duration(self) -> Duration {
        match self {
            Self::Min1 => Duration::minutes(1),
            Self::Min3 => Duration::minutes(3),
            Self::Min5 => Duration::minutes(5),
            Self::Min15 => Duration::minutes(15),
            Self::Min30 => Duration::minutes(30),
            Self::Hour1 => Duration::hours(1),
            Self::Hour4 => Duration::hours(4),
            Self::Day1 => Duration::days(1),
        }
    }

    /// Close time of the candle opening at `open_time`: one millisecond
    /// before the next interval starts.
    pub fn close_time(self, open_time: DateTime<Utc>) -> DateTime<Utc> {
        open_time + self.duration() - Duration::milliseconds(1)
    }
}

impl fmt::Display for TimeFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One closed OHLCV interval. `open_time` is the natural key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: DateTime<Utc>,
}

/// Indicator values derived for the candle with the same `open_time`.
///
/// A `None` field means the lookback for that indicator was not available
/// when the record was computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndicatorRecord {
    pub open_time: DateTime<Utc>,
    pub ema50: Option<Decimal>,
    pub ema200: Option<Decimal>,
    pub rsi14: Option<Decimal>,
    pub atr14: Option<Decimal>,
    pub bb_upper: Option<Decimal>,
    pub bb_middle: Option<Decimal>,
    pub bb_lower: Option<Decimal>,
    pub avg_volume20: Option<Decimal>,
}

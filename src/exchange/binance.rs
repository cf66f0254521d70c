use std::str::FromStr;

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use crate::error::ExchangeError;
use crate::exchange::MarketDataSource;
use crate::math;
use crate::model::{Candle, TimeFrame};

pub const BINANCE_BASE_URL: &str = "https://api.binance.com";
pub const MAX_CANDLES_PER_REQUEST: usize = 1000;

/// REST klines client for one symbol and interval.
///
/// Carries no rate limiter of its own; callers pace requests.
pub struct BinanceKlines {
    client: reqwest::Client,
    base_url: String,
    symbol: String,
    timeframe: TimeFrame,
    page_limit: usize,
}

impl BinanceKlines {
    pub fn new(base_url: &str, symbol: &str, timeframe: TimeFrame, page_limit: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            symbol: symbol.to_owned(),
            timeframe,
            page_limit: page_limit.clamp(1, MAX_CANDLES_PER_REQUEST),
        }
    }
}

impl MarketDataSource for BinanceKlines {
    fn name(&self) -> &str {
        "binance"
    }

    fn page_limit(&self) -> usize {
        self.page_limit
    }

    fn fetch_candles(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, Result<Vec<Candle>, Report<ExchangeError>>> {
        Box::pin(async move {
            let url = format!("{}/api/v3/klines", self.base_url);
            let limit_str = self.page_limit.to_string();
            let mut params = vec![
                ("symbol", self.symbol.clone()),
                ("interval", self.timeframe.binance_interval().to_owned()),
                ("limit", limit_str),
            ];
            if let Some(since) = since {
                params.push(("startTime", since.timestamp_millis().to_string()));
            }

            let response = self
                .client
                .get(&url)
                .query(&params)
                .send()
                .await
                .change_context(ExchangeError::Request {
                    exchange: "binance".into(),
                })?;

            if !response.status().is_success() {
                return Err(Report::new(ExchangeError::Request {
                    exchange: "binance".into(),
                })
                .attach(format!("HTTP status: {}", response.status())));
            }

            let raw: Vec<BinanceKlineRow> =
                response
                    .json()
                    .await
                    .change_context(ExchangeError::ResponseParse {
                        exchange: "binance".into(),
                    })?;

            debug!(
                symbol = %self.symbol,
                timeframe = %self.timeframe,
                since = ?since,
                fetched = raw.len(),
                "binance kline page fetched"
            );

            raw.into_iter()
                .map(|row| row.into_candle(self.timeframe))
                .collect()
        })
    }
}

// ── REST response types ───────────────────────────────────────────────────────

/// Binance kline row: 12-element array
/// [open_time, open, high, low, close, volume, close_time, ...]
#[derive(Debug, Deserialize)]
struct BinanceKlineRow(
    i64,                                   // 0: open_time (ms)
    String,                                // 1: open
    String,                                // 2: high
    String,                                // 3: low
    String,                                // 4: close
    String,                                // 5: volume
    #[allow(dead_code)] i64,               // 6: close_time
    #[allow(dead_code)] String,            // 7: quote asset volume
    #[allow(dead_code)] i64,               // 8: number of trades
    #[allow(dead_code)] String,            // 9: taker buy base volume
    #[allow(dead_code)] String,            // 10: taker buy quote volume
    #[allow(dead_code)] serde_json::Value, // 11: ignore
);

impl BinanceKlineRow {
    fn into_candle(self, timeframe: TimeFrame) -> Result<Candle, Report<ExchangeError>> {
        let parse = |s: &str| -> Result<Decimal, Report<ExchangeError>> {
            Decimal::from_str(s)
                .map(math::to_price_scale)
                .change_context(ExchangeError::ResponseParse {
                    exchange: "binance".into(),
                })
                .attach_with(|| format!("decimal: {s}"))
        };

        let open_time = DateTime::from_timestamp_millis(self.0).ok_or_else(|| {
            Report::new(ExchangeError::ResponseParse {
                exchange: "binance".into(),
            })
            .attach(format!("open_time: {}", self.0))
        })?;

        Ok(Candle {
            open_time,
            open: parse(&self.1)?,
            high: parse(&self.2)?,
            low: parse(&self.3)?,
            close: parse(&self.4)?,
            volume: parse(&self.5)?,
            close_time: timeframe.close_time(open_time),
        })
    }
}

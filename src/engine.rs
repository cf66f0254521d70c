//! Incremental indicator computation over the stored candle series.
//!
//! The engine walks candles in open-time order and persists one
//! [`IndicatorRecord`] per candle that has a full lookback window. EMA values
//! are a recurrence, so the previous EMA pair is threaded from record to
//! record. Between batches, and at the start of every run, that pair is read
//! back from the newest persisted record, which makes a restarted run produce
//! exactly what an uninterrupted one would have.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, trace, warn};

use crate::error::{EngineError, IndicatorError, StorageError};
use crate::indicator::Indicator;
use crate::indicator::atr::Atr;
use crate::indicator::bollinger::BollingerBands;
use crate::indicator::ma::Ema;
use crate::indicator::rsi::Rsi;
use crate::indicator::volume::VolumeMA;
use crate::model::{Candle, IndicatorRecord};
use crate::single_flight::SingleFlight;
use crate::storage::{CandleStore, IndicatorStore};

pub const EMA_FAST_PERIOD: usize = 50;
pub const EMA_SLOW_PERIOD: usize = 200;
pub const RSI_PERIOD: usize = 14;
pub const ATR_PERIOD: usize = 14;
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_MULTIPLIER: Decimal = dec!(2);
pub const VOLUME_PERIOD: usize = 20;

/// Trailing history needed before a candle is eligible.
pub const LOOKBACK_WINDOW: usize = EMA_SLOW_PERIOD;
/// Candles loaded per computation: the lookback plus the candle itself.
pub const WINDOW_SIZE: usize = LOOKBACK_WINDOW + 1;

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Counters for one engine run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CalcStats {
    pub processed: u64,
    pub saved: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalcOutcome {
    Completed(CalcStats),
    /// Another calculation holds the latch; nothing was written.
    AlreadyRunning,
    /// Catch-up found no prior record to continue from.
    NoBaseline,
}

/// Previous EMA pair carried into the next candle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct EmaState {
    ema50: Option<Decimal>,
    ema200: Option<Decimal>,
}

impl From<&IndicatorRecord> for EmaState {
    fn from(record: &IndicatorRecord) -> Self {
        Self {
            ema50: record.ema50,
            ema200: record.ema200,
        }
    }
}

struct IndicatorSet {
    ema50: Ema,
    ema200: Ema,
    rsi14: Rsi,
    atr14: Atr,
    bollinger: BollingerBands,
    volume20: VolumeMA,
}

impl IndicatorSet {
    fn new() -> Result<Self, Report<IndicatorError>> {
        Ok(Self {
            ema50: Ema::new(EMA_FAST_PERIOD)?,
            ema200: Ema::new(EMA_SLOW_PERIOD)?,
            rsi14: Rsi::new(RSI_PERIOD)?,
            atr14: Atr::new(ATR_PERIOD)?,
            bollinger: BollingerBands::new(BOLLINGER_PERIOD, BOLLINGER_MULTIPLIER)?,
            volume20: VolumeMA::new(VOLUME_PERIOD)?,
        })
    }

    /// `None` when either EMA cannot be produced, since the recurrence
    /// could not continue from such a record.
    fn compute(&self, window: &[Candle], state: EmaState) -> Option<IndicatorRecord> {
        let candle = window.last()?;
        let bands = self.bollinger.calculate(window);
        Some(IndicatorRecord {
            open_time: candle.open_time,
            ema50: Some(self.ema50.next(window, state.ema50)?),
            ema200: Some(self.ema200.next(window, state.ema200)?),
            rsi14: self.rsi14.calculate(window),
            atr14: self.atr14.calculate(window),
            bb_upper: bands.map(|b| b.upper),
            bb_middle: bands.map(|b| b.middle),
            bb_lower: bands.map(|b| b.lower),
            avg_volume20: self.volume20.calculate(window),
        })
    }
}

enum CandleResult {
    Saved(IndicatorRecord),
    ShortWindow(usize),
    NotComputable,
}

pub struct IndicatorEngine {
    candles: Arc<dyn CandleStore>,
    indicators: Arc<dyn IndicatorStore>,
    flight: SingleFlight,
    batch_size: usize,
    set: IndicatorSet,
}

impl IndicatorEngine {
    pub fn new(
        candles: Arc<dyn CandleStore>,
        indicators: Arc<dyn IndicatorStore>,
        batch_size: usize,
    ) -> Result<Self, Report<IndicatorError>> {
        Ok(Self {
            candles,
            indicators,
            flight: SingleFlight::new(),
            batch_size: batch_size.max(1),
            set: IndicatorSet::new()?,
        })
    }

    pub fn is_in_progress(&self) -> bool {
        self.flight.is_active()
    }

    pub fn flight(&self) -> &SingleFlight {
        &self.flight
    }

    /// Catch-up: compute every candle newer than the last record.
    ///
    /// Does nothing when no record exists yet; the first pass over history
    /// goes through [`Self::resume_calculation`] or [`Self::recalculate_all`].
    pub async fn calculate_new_indicators(&self) -> Result<CalcOutcome, Report<EngineError>> {
        let Some(_guard) = self.flight.try_acquire() else {
            info!("indicator calculation already in progress");
            return Ok(CalcOutcome::AlreadyRunning);
        };

        let (last, mut state) = self.continuation().await?;
        let Some(last) = last else {
            info!("no indicator baseline, run resume or rebuild first");
            return Ok(CalcOutcome::NoBaseline);
        };

        let pending = self
            .candles
            .candles_after(last)
            .await
            .change_context(EngineError::Storage)?;

        let mut stats = CalcStats::default();
        for candle in &pending {
            self.process_candle(candle, &mut state, &mut stats).await;
        }

        info!(
            processed = stats.processed,
            saved = stats.saved,
            failed = stats.failed,
            "indicator catch-up complete"
        );
        Ok(CalcOutcome::Completed(stats))
    }

    /// Continue from the last record (or the first candle) in bounded batches.
    pub async fn resume_calculation(&self) -> Result<CalcOutcome, Report<EngineError>> {
        let Some(_guard) = self.flight.try_acquire() else {
            info!("indicator calculation already in progress");
            return Ok(CalcOutcome::AlreadyRunning);
        };

        let stats = self.run_batches().await?;
        info!(
            processed = stats.processed,
            saved = stats.saved,
            skipped = stats.skipped,
            failed = stats.failed,
            "indicator resume complete"
        );
        Ok(CalcOutcome::Completed(stats))
    }

    /// Delete every record, then compute the whole series from scratch.
    pub async fn recalculate_all(&self) -> Result<CalcOutcome, Report<EngineError>> {
        let Some(_guard) = self.flight.try_acquire() else {
            info!("indicator calculation already in progress");
            return Ok(CalcOutcome::AlreadyRunning);
        };

        let removed = self
            .indicators
            .delete_all_indicators()
            .await
            .change_context(EngineError::Storage)?;
        info!(removed, "indicator records cleared for rebuild");

        let stats = self.run_batches().await?;
        info!(
            processed = stats.processed,
            saved = stats.saved,
            skipped = stats.skipped,
            failed = stats.failed,
            "indicator rebuild complete"
        );
        Ok(CalcOutcome::Completed(stats))
    }

    async fn run_batches(&self) -> Result<CalcStats, Report<EngineError>> {
        let mut stats = CalcStats::default();
        let (mut cursor, mut state) = self.continuation().await?;

        loop {
            let batch = match cursor {
                Some(after) => self.candles.candles_after_limit(after, self.batch_size).await,
                None => self.candles.first_candles(self.batch_size).await,
            }
            .change_context(EngineError::Storage)?;

            let Some(last) = batch.last() else {
                break;
            };
            cursor = Some(last.open_time);

            for candle in &batch {
                self.process_candle(candle, &mut state, &mut stats).await;
            }

            // Reseed from storage, not memory, so every batch boundary is a
            // valid restart point.
            state = self.continuation().await?.1;
            debug!(
                batch = batch.len(),
                through = %last.open_time,
                saved = stats.saved,
                "indicator batch done"
            );

            if batch.len() < self.batch_size {
                break;
            }
        }

        Ok(stats)
    }

    /// Open time and EMA pair of the newest persisted record.
    async fn continuation(
        &self,
    ) -> Result<(Option<DateTime<Utc>>, EmaState), Report<EngineError>> {
        let Some(last) = self
            .indicators
            .max_indicator_open_time()
            .await
            .change_context(EngineError::Storage)?
        else {
            return Ok((None, EmaState::default()));
        };

        let record = self
            .indicators
            .find_indicator(last)
            .await
            .change_context(EngineError::Storage)?;
        Ok((Some(last), record.as_ref().map(EmaState::from).unwrap_or_default()))
    }

    async fn process_candle(&self, candle: &Candle, state: &mut EmaState, stats: &mut CalcStats) {
        stats.processed += 1;
        match self.compute_and_save(candle, *state).await {
            Ok(CandleResult::Saved(record)) => {
                *state = EmaState::from(&record);
                stats.saved += 1;
            }
            Ok(CandleResult::ShortWindow(available)) => {
                trace!(open_time = %candle.open_time, available, "lookback incomplete, skipping");
                stats.skipped += 1;
            }
            Ok(CandleResult::NotComputable) => {
                warn!(open_time = %candle.open_time, "indicator values not computable");
                stats.failed += 1;
            }
            Err(e) => {
                warn!(open_time = %candle.open_time, error = ?e, "indicator computation failed");
                stats.failed += 1;
            }
        }
    }

    async fn compute_and_save(
        &self,
        candle: &Candle,
        state: EmaState,
    ) -> Result<CandleResult, Report<StorageError>> {
        let mut window = self
            .candles
            .last_candles(candle.open_time, WINDOW_SIZE)
            .await?;
        if window.len() < WINDOW_SIZE {
            return Ok(CandleResult::ShortWindow(window.len()));
        }
        window.reverse();

        let Some(record) = self.set.compute(&window, state) else {
            return Ok(CandleResult::NotComputable);
        };
        self.indicators.save_indicator(&record).await?;
        Ok(CandleResult::Saved(record))
    }
}

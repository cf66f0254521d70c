use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::exchange::MarketDataSource;
use crate::model::Candle;
use crate::single_flight::SingleFlight;
use crate::storage::CandleStore;

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// First open time requested by an initial load.
    pub listing_epoch: DateTime<Utc>,
    pub requests_per_second: NonZeroU32,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub pages: u64,
    pub fetched: u64,
    pub saved: u64,
    pub duplicates: u64,
    /// Candles whose interval had not closed yet; left for a later sync.
    pub unclosed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncStats),
    AlreadyRunning,
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Pulls candles from the market-data source into the candle store.
///
/// Only closed candles are stored. The source may return the interval that
/// is still forming; it is skipped and fetched again once it has closed.
pub struct CandleSynchronizer {
    source: Arc<dyn MarketDataSource>,
    store: Arc<dyn CandleStore>,
    limiter: DefaultDirectRateLimiter,
    settings: SyncSettings,
    flight: SingleFlight,
    cancel: CancellationToken,
    clock: Clock,
}

impl CandleSynchronizer {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        store: Arc<dyn CandleStore>,
        settings: SyncSettings,
        cancel: CancellationToken,
    ) -> Self {
        // Evenly spaced permits with no burst: any one-second window sees at
        // most `requests_per_second` requests.
        let rps = settings.requests_per_second;
        let quota = Quota::with_period(Duration::from_secs(1) / rps.get())
            .map(|q| q.allow_burst(nonzero!(1u32)))
            .unwrap_or_else(|| Quota::per_second(rps));
        Self {
            source,
            store,
            limiter: RateLimiter::direct(quota),
            settings,
            flight: SingleFlight::new(),
            cancel,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_clock(
        mut self,
        clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static,
    ) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn is_in_progress(&self) -> bool {
        self.flight.is_active()
    }

    pub fn flight(&self) -> &SingleFlight {
        &self.flight
    }

    /// Page forward from the listing epoch until the source runs dry.
    pub async fn initial_load(&self) -> Result<SyncOutcome, Report<SyncError>> {
        let Some(_guard) = self.flight.try_acquire() else {
            info!("candle sync already in progress");
            return Ok(SyncOutcome::AlreadyRunning);
        };

        let page_limit = self.source.page_limit();
        let mut since = self.settings.listing_epoch;
        let mut stats = SyncStats::default();

        info!(source = self.source.name(), since = %since, "initial candle load started");
        loop {
            let page = self.fetch_page(Some(since)).await;
            let Some(last) = page.last() else {
                break;
            };
            let next = last.open_time + chrono::Duration::milliseconds(1);
            // Counted before unclosed candles are dropped.
            let full = page.len() >= page_limit;

            self.save_page(page, &mut stats).await?;

            if !full || next <= since || self.cancel.is_cancelled() {
                break;
            }
            since = next;
        }

        info!(
            pages = stats.pages,
            fetched = stats.fetched,
            saved = stats.saved,
            duplicates = stats.duplicates,
            "initial candle load complete"
        );
        Ok(SyncOutcome::Completed(stats))
    }

    /// Fetch a single page following the newest stored candle.
    pub async fn update_latest(&self) -> Result<SyncOutcome, Report<SyncError>> {
        let Some(_guard) = self.flight.try_acquire() else {
            info!("candle sync already in progress");
            return Ok(SyncOutcome::AlreadyRunning);
        };

        let since = self
            .store
            .max_candle_open_time()
            .await
            .change_context(SyncError::Storage)?
            .map(|max| max + chrono::Duration::milliseconds(1))
            .unwrap_or(self.settings.listing_epoch);

        let mut stats = SyncStats::default();
        let page = self.fetch_page(Some(since)).await;
        if !page.is_empty() {
            self.save_page(page, &mut stats).await?;
        }

        info!(
            since = %since,
            fetched = stats.fetched,
            saved = stats.saved,
            unclosed = stats.unclosed,
            "latest candles synced"
        );
        Ok(SyncOutcome::Completed(stats))
    }

    /// One page with bounded retries. Failures and empty pages are retried;
    /// once attempts run out the page is empty, meaning "nothing right now".
    async fn fetch_page(&self, since: Option<DateTime<Utc>>) -> Vec<Candle> {
        let attempts = self.settings.max_attempts.max(1);
        for attempt in 1..=attempts {
            self.limiter.until_ready().await;
            let last_attempt = attempt == attempts;

            match self.source.fetch_candles(since).await {
                Ok(page) if !page.is_empty() || last_attempt => return page,
                Ok(_) => debug!(attempt, since = ?since, "empty candle page, retrying"),
                Err(e) => warn!(attempt, since = ?since, error = ?e, "candle fetch failed"),
            }

            if last_attempt {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("candle fetch retry interrupted");
                    return Vec::new();
                }
                _ = sleep(self.settings.retry_delay) => {}
            }
        }
        Vec::new()
    }

    async fn save_page(
        &self,
        mut page: Vec<Candle>,
        stats: &mut SyncStats,
    ) -> Result<(), Report<SyncError>> {
        page.sort_by_key(|c| c.open_time);
        page.dedup_by_key(|c| c.open_time);
        stats.pages += 1;
        stats.fetched += page.len() as u64;

        let now = (self.clock)();
        for candle in &page {
            if candle.close_time >= now {
                debug!(open_time = %candle.open_time, "candle not closed yet, skipping");
                stats.unclosed += 1;
                continue;
            }
            let exists = self
                .store
                .candle_exists(candle.open_time)
                .await
                .change_context(SyncError::Storage)?;
            let inserted = !exists
                && self
                    .store
                    .save_candle(candle)
                    .await
                    .change_context(SyncError::Storage)?;
            if inserted {
                stats.saved += 1;
            } else {
                stats.duplicates += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ExchangeError;
    use crate::model::fixtures::{candle, epoch, wavy_series};
    use crate::storage::sqlite::SqliteStorage;
    use futures::future::BoxFuture;
    use rust_decimal::Decimal;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Instant;

    /// Serves pages out of a fixed series; the first `failures` calls error.
    pub(crate) struct SeriesSource {
        series: Vec<Candle>,
        page_limit: usize,
        failures: Mutex<u32>,
        calls: Mutex<Vec<(Option<DateTime<Utc>>, Instant)>>,
    }

    impl SeriesSource {
        pub(crate) fn new(series: Vec<Candle>, page_limit: usize) -> Self {
            Self {
                series,
                page_limit,
                failures: Mutex::new(0),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing(self, failures: u32) -> Self {
            *self.failures.lock().unwrap() = failures;
            self
        }

        fn calls(&self) -> Vec<(Option<DateTime<Utc>>, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl MarketDataSource for SeriesSource {
        fn name(&self) -> &str {
            "series"
        }

        fn page_limit(&self) -> usize {
            self.page_limit
        }

        fn fetch_candles(
            &self,
            since: Option<DateTime<Utc>>,
        ) -> BoxFuture<'_, Result<Vec<Candle>, Report<ExchangeError>>> {
            self.calls.lock().unwrap().push((since, Instant::now()));
            let failed = {
                let mut failures = self.failures.lock().unwrap();
                let failed = *failures > 0;
                *failures = failures.saturating_sub(1);
                failed
            };
            let page: Vec<Candle> = self
                .series
                .iter()
                .filter(|c| since.is_none_or(|s| c.open_time >= s))
                .take(self.page_limit)
                .cloned()
                .collect();
            Box::pin(async move {
                if failed {
                    return Err(Report::new(ExchangeError::Request {
                        exchange: "series".into(),
                    }));
                }
                Ok(page)
            })
        }
    }

    pub(crate) fn settings(requests_per_second: u32) -> SyncSettings {
        SyncSettings {
            listing_epoch: epoch(),
            requests_per_second: NonZeroU32::new(requests_per_second).unwrap(),
            max_attempts: 3,
            retry_delay: Duration::from_millis(1),
        }
    }

    fn synchronizer(
        source: &Arc<SeriesSource>,
        storage: &Arc<SqliteStorage>,
        settings: SyncSettings,
    ) -> CandleSynchronizer {
        CandleSynchronizer::new(
            source.clone(),
            storage.clone(),
            settings,
            CancellationToken::new(),
        )
    }

    fn stats(outcome: SyncOutcome) -> SyncStats {
        match outcome {
            SyncOutcome::Completed(stats) => stats,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn initial_load_pages_until_short_page() {
        let source = Arc::new(SeriesSource::new(wavy_series(25), 10));
        let storage = Arc::new(SqliteStorage::in_memory().await);
        let sync = synchronizer(&source, &storage, settings(1000));

        let stats = stats(sync.initial_load().await.unwrap());
        assert_eq!(stats.pages, 3);
        assert_eq!(stats.saved, 25);
        assert_eq!(storage.count_candles().await.unwrap(), 25);

        let starts: Vec<_> = source.calls().into_iter().map(|(since, _)| since).collect();
        assert_eq!(starts.len(), 3);
        assert_eq!(starts[0], Some(epoch()));
        // each page starts just after the previous page's last open time
        assert_eq!(
            starts[1],
            Some(candle(9, Decimal::ZERO).open_time + chrono::Duration::milliseconds(1))
        );
    }

    #[tokio::test]
    async fn initial_load_stops_on_empty_page_after_retries() {
        let source = Arc::new(SeriesSource::new(wavy_series(20), 10));
        let storage = Arc::new(SqliteStorage::in_memory().await);
        let sync = synchronizer(&source, &storage, settings(1000));

        let stats = stats(sync.initial_load().await.unwrap());
        assert_eq!(stats.saved, 20);
        // two full pages, then the empty page is tried three times
        assert_eq!(source.calls().len(), 5);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let source = Arc::new(SeriesSource::new(wavy_series(5), 10).failing(2));
        let storage = Arc::new(SqliteStorage::in_memory().await);
        let sync = synchronizer(&source, &storage, settings(1000));

        let stats = stats(sync.update_latest().await.unwrap());
        assert_eq!(stats.saved, 5);
        assert_eq!(source.calls().len(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_yield_no_data_not_an_error() {
        let source = Arc::new(SeriesSource::new(wavy_series(5), 10).failing(10));
        let storage = Arc::new(SqliteStorage::in_memory().await);
        let sync = synchronizer(&source, &storage, settings(1000));

        let stats = stats(sync.update_latest().await.unwrap());
        assert_eq!(stats, SyncStats::default());
        assert_eq!(source.calls().len(), 3);
        assert_eq!(storage.count_candles().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn update_latest_starts_after_newest_stored_candle() {
        let series = wavy_series(20);
        let source = Arc::new(SeriesSource::new(series.clone(), 1000));
        let storage = Arc::new(SqliteStorage::in_memory().await);
        for c in &series[..16] {
            storage.save_candle(c).await.unwrap();
        }
        let sync = synchronizer(&source, &storage, settings(1000));

        let stats = stats(sync.update_latest().await.unwrap());
        assert_eq!(stats.saved, 4);
        assert_eq!(stats.duplicates, 0);
        assert_eq!(
            source.calls()[0].0,
            Some(series[15].open_time + chrono::Duration::milliseconds(1))
        );
    }

    #[tokio::test]
    async fn update_latest_on_empty_store_starts_at_listing_epoch() {
        let source = Arc::new(SeriesSource::new(wavy_series(3), 1000));
        let storage = Arc::new(SqliteStorage::in_memory().await);
        let sync = synchronizer(&source, &storage, settings(1000));

        sync.update_latest().await.unwrap();
        assert_eq!(source.calls()[0].0, Some(epoch()));
        assert_eq!(storage.count_candles().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn existing_candles_are_never_overwritten() {
        let series = wavy_series(4);
        let storage = Arc::new(SqliteStorage::in_memory().await);
        let original = Candle {
            close: Decimal::from(999),
            ..series[1].clone()
        };
        storage.save_candle(&original).await.unwrap();

        let source = Arc::new(SeriesSource::new(series.clone(), 1000));
        let sync = synchronizer(&source, &storage, settings(1000));
        let stats = stats(sync.initial_load().await.unwrap());

        assert_eq!(stats.saved, 3);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(storage.count_candles().await.unwrap(), 4);
        let stored = storage.first_candles(2).await.unwrap();
        assert_eq!(stored[1].close, Decimal::from(999));
    }

    /// Clock that tests move forward by hand.
    fn manual_clock(start: DateTime<Utc>) -> (Arc<AtomicI64>, impl Fn() -> DateTime<Utc>) {
        let millis = Arc::new(AtomicI64::new(start.timestamp_millis()));
        let reader = millis.clone();
        let clock = move || {
            DateTime::from_timestamp_millis(reader.load(Ordering::SeqCst)).unwrap()
        };
        (millis, clock)
    }

    #[tokio::test]
    async fn forming_candle_is_left_until_it_closes() {
        let series = wavy_series(5);
        let source = Arc::new(SeriesSource::new(series.clone(), 1000));
        let storage = Arc::new(SqliteStorage::in_memory().await);
        // halfway through the fifth hourly candle
        let (now, clock) = manual_clock(series[4].open_time + chrono::Duration::minutes(30));
        let sync = synchronizer(&source, &storage, settings(1000)).with_clock(clock);

        let first = stats(sync.update_latest().await.unwrap());
        assert_eq!(first.fetched, 5);
        assert_eq!(first.saved, 4);
        assert_eq!(first.unclosed, 1);
        assert_eq!(first.duplicates, 0);
        assert_eq!(
            storage.max_candle_open_time().await.unwrap(),
            Some(series[3].open_time)
        );

        now.store(
            (series[4].close_time + chrono::Duration::milliseconds(1)).timestamp_millis(),
            Ordering::SeqCst,
        );
        let second = stats(sync.update_latest().await.unwrap());
        assert_eq!(second.saved, 1);
        assert_eq!(second.unclosed, 0);
        assert_eq!(
            source.calls()[1].0,
            Some(series[3].open_time + chrono::Duration::milliseconds(1))
        );
        assert_eq!(storage.count_candles().await.unwrap(), 5);
        assert_eq!(
            storage.max_candle_open_time().await.unwrap(),
            Some(series[4].open_time)
        );
    }

    #[tokio::test]
    async fn unclosed_candle_still_counts_toward_a_full_page() {
        let series = wavy_series(4);
        let source = Arc::new(SeriesSource::new(series.clone(), 2));
        let storage = Arc::new(SqliteStorage::in_memory().await);
        let (_, clock) = manual_clock(series[3].open_time + chrono::Duration::minutes(1));
        let sync = synchronizer(&source, &storage, settings(1000)).with_clock(clock);

        let stats = stats(sync.initial_load().await.unwrap());
        assert_eq!(stats.saved, 3);
        assert_eq!(stats.unclosed, 1);
        assert_eq!(storage.count_candles().await.unwrap(), 3);
        // two full pages, then three tries of the empty one past the series end
        assert_eq!(source.calls().len(), 5);
    }

    #[tokio::test]
    async fn concurrent_sync_is_rejected() {
        let source = Arc::new(SeriesSource::new(wavy_series(3), 1000));
        let storage = Arc::new(SqliteStorage::in_memory().await);
        let sync = synchronizer(&source, &storage, settings(1000));

        let _held = sync.flight().try_acquire().unwrap();
        assert!(sync.is_in_progress());
        assert_eq!(sync.initial_load().await.unwrap(), SyncOutcome::AlreadyRunning);
        assert_eq!(sync.update_latest().await.unwrap(), SyncOutcome::AlreadyRunning);
        assert!(source.calls().is_empty());
    }

    #[tokio::test]
    async fn request_rate_stays_under_cap() {
        let cap = 20;
        // one candle per page: 25 pages plus three tries of the final empty one
        let source = Arc::new(SeriesSource::new(wavy_series(25), 1));
        let storage = Arc::new(SqliteStorage::in_memory().await);
        let sync = synchronizer(&source, &storage, settings(cap));

        sync.initial_load().await.unwrap();

        let times: Vec<Instant> = source.calls().into_iter().map(|(_, t)| t).collect();
        assert_eq!(times.len(), 28);
        for pair in times.windows(cap as usize + 1) {
            let span = pair[cap as usize].duration_since(pair[0]);
            assert!(
                span >= Duration::from_millis(980),
                "{} requests within {span:?}",
                cap + 1
            );
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_retry_sleep() {
        let source = Arc::new(SeriesSource::new(wavy_series(3), 1000).failing(10));
        let storage = Arc::new(SqliteStorage::in_memory().await);
        let cancel = CancellationToken::new();
        let sync = CandleSynchronizer::new(
            source.clone(),
            storage.clone(),
            SyncSettings {
                retry_delay: Duration::from_secs(60),
                ..settings(1000)
            },
            cancel.clone(),
        );
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(5), sync.update_latest())
            .await
            .expect("retry sleep was not interrupted")
            .unwrap();
        assert_eq!(stats(outcome).saved, 0);
        assert_eq!(source.calls().len(), 1);
    }
}

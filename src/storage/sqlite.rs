use chrono::{DateTime, Utc};
use error_stack::{Report, ResultExt};
use futures::future::BoxFuture;
use rust_decimal::Decimal;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode},
};
use std::path::Path;
use std::str::FromStr;

use crate::error::StorageError;
use crate::model::{Candle, IndicatorRecord};
use crate::storage::{CandleStore, IndicatorStore};

type CandleRow = (i64, String, String, String, String, String, i64);

type IndicatorRow = (
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

const CANDLE_COLUMNS: &str = "open_time, open, high, low, close, volume, close_time";

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self, Report<StorageError>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .change_context(StorageError::Migration)
                .attach_with(|| format!("cannot create data directory: {}", parent.display()))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .change_context(StorageError::Migration)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(opts)
            .await
            .change_context(StorageError::Migration)
            .attach_with(|| format!("database path: {}", path.display()))?;

        Self::migrate(pool).await
    }

    /// Single-connection in-memory database, used by tests across the crate.
    #[cfg(test)]
    pub async fn in_memory() -> Self {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .foreign_keys(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .unwrap();
        Self::migrate(pool).await.unwrap()
    }

    async fn migrate(pool: SqlitePool) -> Result<Self, Report<StorageError>> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .change_context(StorageError::Migration)?;
        Ok(Self { pool })
    }

    async fn fetch_candles(
        &self,
        sql: &str,
        binds: &[i64],
    ) -> Result<Vec<Candle>, Report<StorageError>> {
        let mut query = sqlx::query_as::<_, CandleRow>(sql);
        for b in binds {
            query = query.bind(*b);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .change_context(StorageError::Query)
            .attach_with(|| sql.to_owned())?;

        rows.into_iter().map(map_candle_row).collect()
    }

    async fn scalar_time(&self, sql: &str) -> Result<Option<DateTime<Utc>>, Report<StorageError>> {
        let (ms,): (Option<i64>,) = sqlx::query_as(sql)
            .fetch_one(&self.pool)
            .await
            .change_context(StorageError::Query)?;
        ms.map(|ms| parse_millis(ms, "open_time")).transpose()
    }

    async fn count(&self, sql: &str) -> Result<u64, Report<StorageError>> {
        let (n,): (i64,) = sqlx::query_as(sql)
            .fetch_one(&self.pool)
            .await
            .change_context(StorageError::Query)?;
        Ok(n.max(0) as u64)
    }

    async fn delete_all(&self, sql: &str) -> Result<u64, Report<StorageError>> {
        let result = sqlx::query(sql)
            .execute(&self.pool)
            .await
            .change_context(StorageError::Delete)
            .attach_with(|| sql.to_owned())?;
        Ok(result.rows_affected())
    }
}

impl CandleStore for SqliteStorage {
    fn candle_exists(
        &self,
        open_time: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<bool, Report<StorageError>>> {
        Box::pin(async move {
            let row: Option<(i64,)> =
                sqlx::query_as("SELECT open_time FROM candles WHERE open_time = ? LIMIT 1")
                    .bind(open_time.timestamp_millis())
                    .fetch_optional(&self.pool)
                    .await
                    .change_context(StorageError::Query)?;
            Ok(row.is_some())
        })
    }

    fn save_candle(&self, candle: &Candle) -> BoxFuture<'_, Result<bool, Report<StorageError>>> {
        let c = candle.clone();
        Box::pin(async move {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO candles \
                 (open_time, open, high, low, close, volume, close_time) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(c.open_time.timestamp_millis())
            .bind(c.open.to_string())
            .bind(c.high.to_string())
            .bind(c.low.to_string())
            .bind(c.close.to_string())
            .bind(c.volume.to_string())
            .bind(c.close_time.timestamp_millis())
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)
            .attach_with(|| format!("open_time: {}", c.open_time))?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn count_candles(&self) -> BoxFuture<'_, Result<u64, Report<StorageError>>> {
        Box::pin(self.count("SELECT COUNT(*) FROM candles"))
    }

    fn max_candle_open_time(
        &self,
    ) -> BoxFuture<'_, Result<Option<DateTime<Utc>>, Report<StorageError>>> {
        Box::pin(self.scalar_time("SELECT MAX(open_time) FROM candles"))
    }

    fn min_candle_open_time(
        &self,
    ) -> BoxFuture<'_, Result<Option<DateTime<Utc>>, Report<StorageError>>> {
        Box::pin(self.scalar_time("SELECT MIN(open_time) FROM candles"))
    }

    fn candles_after(
        &self,
        time: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<Candle>, Report<StorageError>>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {CANDLE_COLUMNS} FROM candles WHERE open_time > ? ORDER BY open_time ASC"
            );
            self.fetch_candles(&sql, &[time.timestamp_millis()]).await
        })
    }

    fn candles_after_limit(
        &self,
        time: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Candle>, Report<StorageError>>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {CANDLE_COLUMNS} FROM candles WHERE open_time > ? \
                 ORDER BY open_time ASC LIMIT ?"
            );
            self.fetch_candles(&sql, &[time.timestamp_millis(), limit as i64])
                .await
        })
    }

    fn first_candles(
        &self,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Candle>, Report<StorageError>>> {
        Box::pin(async move {
            let sql =
                format!("SELECT {CANDLE_COLUMNS} FROM candles ORDER BY open_time ASC LIMIT ?");
            self.fetch_candles(&sql, &[limit as i64]).await
        })
    }

    fn last_candles(
        &self,
        before_inclusive: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<Candle>, Report<StorageError>>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {CANDLE_COLUMNS} FROM candles WHERE open_time <= ? \
                 ORDER BY open_time DESC LIMIT ?"
            );
            self.fetch_candles(&sql, &[before_inclusive.timestamp_millis(), limit as i64])
                .await
        })
    }

    fn delete_all_candles(&self) -> BoxFuture<'_, Result<u64, Report<StorageError>>> {
        Box::pin(self.delete_all("DELETE FROM candles"))
    }
}

impl IndicatorStore for SqliteStorage {
    fn save_indicator(
        &self,
        record: &IndicatorRecord,
    ) -> BoxFuture<'_, Result<(), Report<StorageError>>> {
        let r = record.clone();
        Box::pin(async move {
            let text = |v: Option<Decimal>| v.map(|d| d.to_string());
            sqlx::query(
                "INSERT INTO indicators \
                 (open_time, ema50, ema200, rsi14, atr14, \
                 bb_upper, bb_middle, bb_lower, avg_volume20) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(open_time) DO UPDATE SET \
                 ema50 = excluded.ema50, ema200 = excluded.ema200, rsi14 = excluded.rsi14, \
                 atr14 = excluded.atr14, bb_upper = excluded.bb_upper, \
                 bb_middle = excluded.bb_middle, bb_lower = excluded.bb_lower, \
                 avg_volume20 = excluded.avg_volume20",
            )
            .bind(r.open_time.timestamp_millis())
            .bind(text(r.ema50))
            .bind(text(r.ema200))
            .bind(text(r.rsi14))
            .bind(text(r.atr14))
            .bind(text(r.bb_upper))
            .bind(text(r.bb_middle))
            .bind(text(r.bb_lower))
            .bind(text(r.avg_volume20))
            .execute(&self.pool)
            .await
            .change_context(StorageError::Insert)
            .attach_with(|| format!("open_time: {}", r.open_time))?;
            Ok(())
        })
    }

    fn max_indicator_open_time(
        &self,
    ) -> BoxFuture<'_, Result<Option<DateTime<Utc>>, Report<StorageError>>> {
        Box::pin(self.scalar_time("SELECT MAX(open_time) FROM indicators"))
    }

    fn find_indicator(
        &self,
        open_time: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Option<IndicatorRecord>, Report<StorageError>>> {
        Box::pin(async move {
            let row: Option<IndicatorRow> = sqlx::query_as(
                "SELECT open_time, ema50, ema200, rsi14, atr14, bb_upper, bb_middle, bb_lower, \
                 avg_volume20 FROM indicators WHERE open_time = ?",
            )
            .bind(open_time.timestamp_millis())
            .fetch_optional(&self.pool)
            .await
            .change_context(StorageError::Query)?;

            row.map(map_indicator_row).transpose()
        })
    }

    fn delete_all_indicators(&self) -> BoxFuture<'_, Result<u64, Report<StorageError>>> {
        Box::pin(self.delete_all("DELETE FROM indicators"))
    }

    fn count_indicators(&self) -> BoxFuture<'_, Result<u64, Report<StorageError>>> {
        Box::pin(self.count("SELECT COUNT(*) FROM indicators"))
    }
}

fn map_candle_row(
    (open_time, open, high, low, close, volume, close_time): CandleRow,
) -> Result<Candle, Report<StorageError>> {
    Ok(Candle {
        open_time: parse_millis(open_time, "open_time")?,
        open: parse_decimal(&open, "open")?,
        high: parse_decimal(&high, "high")?,
        low: parse_decimal(&low, "low")?,
        close: parse_decimal(&close, "close")?,
        volume: parse_decimal(&volume, "volume")?,
        close_time: parse_millis(close_time, "close_time")?,
    })
}

fn map_indicator_row(row: IndicatorRow) -> Result<IndicatorRecord, Report<StorageError>> {
    let (open_time, ema50, ema200, rsi14, atr14, bb_upper, bb_middle, bb_lower, avg_volume20) = row;
    let opt = |value: Option<String>, column: &str| {
        value.map(|v| parse_decimal(&v, column)).transpose()
    };
    Ok(IndicatorRecord {
        open_time: parse_millis(open_time, "open_time")?,
        ema50: opt(ema50, "ema50")?,
        ema200: opt(ema200, "ema200")?,
        rsi14: opt(rsi14, "rsi14")?,
        atr14: opt(atr14, "atr14")?,
        bb_upper: opt(bb_upper, "bb_upper")?,
        bb_middle: opt(bb_middle, "bb_middle")?,
        bb_lower: opt(bb_lower, "bb_lower")?,
        avg_volume20: opt(avg_volume20, "avg_volume20")?,
    })
}

fn parse_decimal(value: &str, column: &str) -> Result<Decimal, Report<StorageError>> {
    Decimal::from_str(value)
        .change_context(StorageError::Decode {
            column: column.to_owned(),
        })
        .attach_with(|| format!("value: {value}"))
}

fn parse_millis(ms: i64, column: &str) -> Result<DateTime<Utc>, Report<StorageError>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| {
        Report::new(StorageError::Decode {
            column: column.to_owned(),
        })
        .attach(format!("millis: {ms}"))
    })
}

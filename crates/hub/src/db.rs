use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::future::Future;
use std::str::FromStr;
use time::OffsetDateTime;

use crate::reading::{Quantity, Reading};

/// Persistence seam for emitted readings.  Writes run on a detached task,
/// so implementations must be cheap to clone and safe to share.
pub trait ReadingStore: Clone + Send + Sync + 'static {
    fn write(&self, reading: &Reading) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// One stored point of a measurement series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub value: f64,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/growbox/growbox.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);

        // Every in-memory connection is its own database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Writes
    // ----------------------------

    /// Store every present measurement of `reading` under one timestamp.
    /// Returns the number of rows written.
    pub async fn insert_reading(&self, reading: &Reading) -> Result<usize> {
        let ts = reading.ts.unix_timestamp();
        let mut tx = self.pool.begin().await.context("insert_reading: begin failed")?;
        let mut rows = 0;

        for (quantity, value) in reading.measurements() {
            sqlx::query("INSERT INTO measurements (ts, measurement, value) VALUES (?, ?, ?)")
                .bind(ts)
                .bind(quantity.name())
                .bind(value)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("insert_reading failed for {quantity}"))?;
            rows += 1;
        }

        tx.commit().await.context("insert_reading: commit failed")?;
        Ok(rows)
    }

    // ----------------------------
    // Queries
    // ----------------------------

    /// Up to `limit` newest points of one measurement at or after `since`,
    /// returned oldest first.
    pub async fn history(
        &self,
        quantity: Quantity,
        since: Option<OffsetDateTime>,
        limit: i64,
    ) -> Result<Vec<Measurement>> {
        let since = since.map(|t| t.unix_timestamp()).unwrap_or(i64::MIN);
        let rows = sqlx::query(
            r#"
            SELECT ts, value FROM (
              SELECT id, ts, value
              FROM measurements
              WHERE measurement = ? AND ts >= ?
              ORDER BY ts DESC, id DESC
              LIMIT ?
            )
            ORDER BY ts ASC, id ASC
            "#,
        )
        .bind(quantity.name())
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("history failed")?;

        rows.iter().map(measurement_from_row).collect()
    }

    pub async fn latest(&self, quantity: Quantity) -> Result<Option<Measurement>> {
        let row = sqlx::query(
            r#"
            SELECT ts, value
            FROM measurements
            WHERE measurement = ?
            ORDER BY ts DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(quantity.name())
        .fetch_optional(&self.pool)
        .await
        .context("latest failed")?;

        row.as_ref().map(measurement_from_row).transpose()
    }
}

fn measurement_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Measurement> {
    let ts: i64 = row.try_get("ts")?;
    let value: f64 = row.try_get("value")?;
    Ok(Measurement {
        ts: OffsetDateTime::from_unix_timestamp(ts).context("stored timestamp out of range")?,
        value,
    })
}

impl ReadingStore for Db {
    async fn write(&self, reading: &Reading) -> Result<()> {
        let rows = self.insert_reading(reading).await?;
        tracing::debug!(rows, "reading persisted");
        Ok(())
    }
}

/// No store configured: readings are dropped.
impl<P: ReadingStore> ReadingStore for Option<P> {
    async fn write(&self, reading: &Reading) -> Result<()> {
        match self {
            Some(store) => store.write(reading).await,
            None => Ok(()),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    async fn memory_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn reading_at(ts: OffsetDateTime, temp: f64) -> Reading {
        let mut r = Reading::empty(ts);
        r.env_temp = Some(temp);
        r.water_ph = Some(6.1);
        r
    }

    #[tokio::test]
    async fn insert_writes_one_row_per_present_measurement() {
        let db = memory_db().await;
        let rows = db
            .insert_reading(&reading_at(datetime!(2024-05-01 12:00 UTC), 22.5))
            .await
            .unwrap();
        assert_eq!(rows, 2);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM measurements")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn empty_reading_writes_nothing() {
        let db = memory_db().await;
        let rows = db
            .insert_reading(&Reading::empty(OffsetDateTime::now_utc()))
            .await
            .unwrap();
        assert_eq!(rows, 0);
        assert!(db.latest(Quantity::EnvTemp).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_returns_newest_point() {
        let db = memory_db().await;
        db.insert_reading(&reading_at(datetime!(2024-05-01 12:00 UTC), 21.0))
            .await
            .unwrap();
        db.insert_reading(&reading_at(datetime!(2024-05-01 12:15 UTC), 23.0))
            .await
            .unwrap();

        let latest = db.latest(Quantity::EnvTemp).await.unwrap().unwrap();
        assert_eq!(latest.value, 23.0);
        assert_eq!(latest.ts, datetime!(2024-05-01 12:15 UTC));
    }

    #[tokio::test]
    async fn history_filters_by_since_and_limit_oldest_first() {
        let db = memory_db().await;
        for (i, temp) in [20.0, 21.0, 22.0, 23.0].into_iter().enumerate() {
            let ts = datetime!(2024-05-01 12:00 UTC) + time::Duration::minutes(15 * i as i64);
            db.insert_reading(&reading_at(ts, temp)).await.unwrap();
        }

        let all = db.history(Quantity::EnvTemp, None, 100).await.unwrap();
        let values: Vec<f64> = all.iter().map(|m| m.value).collect();
        assert_eq!(values, vec![20.0, 21.0, 22.0, 23.0]);

        let since = db
            .history(Quantity::EnvTemp, Some(datetime!(2024-05-01 12:30 UTC)), 100)
            .await
            .unwrap();
        assert_eq!(since.len(), 2);
        assert_eq!(since[0].value, 22.0);

        let newest_two = db.history(Quantity::EnvTemp, None, 2).await.unwrap();
        let values: Vec<f64> = newest_two.iter().map(|m| m.value).collect();
        assert_eq!(values, vec![22.0, 23.0]);
    }

    #[tokio::test]
    async fn history_is_per_measurement() {
        let db = memory_db().await;
        db.insert_reading(&reading_at(datetime!(2024-05-01 12:00 UTC), 21.0))
            .await
            .unwrap();
        assert!(db
            .history(Quantity::WaterEc, None, 10)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(db.history(Quantity::WaterPh, None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn store_trait_persists_reading() {
        let db = memory_db().await;
        ReadingStore::write(&db, &reading_at(datetime!(2024-05-01 12:00 UTC), 19.5))
            .await
            .unwrap();
        assert_eq!(db.latest(Quantity::EnvTemp).await.unwrap().unwrap().value, 19.5);
    }

    #[tokio::test]
    async fn optional_store_writes_through_or_drops() {
        let db = memory_db().await;
        let reading = reading_at(datetime!(2024-05-01 12:00 UTC), 20.5);

        ReadingStore::write(&Some(db.clone()), &reading).await.unwrap();
        assert_eq!(db.latest(Quantity::EnvTemp).await.unwrap().unwrap().value, 20.5);

        ReadingStore::write(&None::<Db>, &reading).await.unwrap();
        assert_eq!(db.history(Quantity::EnvTemp, None, 10).await.unwrap().len(), 1);
    }
}

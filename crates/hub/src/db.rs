use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{FromRow, Pool, Row, Sqlite};
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
    op_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PumpStatus {
    On,
    Off,
}

impl PumpStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }

    /// Case-insensitive, whitespace-tolerant parse of "ON"/"OFF".
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("ON") {
            Some(Self::On)
        } else if s.eq_ignore_ascii_case("OFF") {
            Some(Self::Off)
        } else {
            None
        }
    }
}

/// A decoded telemetry sample that has not been persisted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub device_id: String,
    pub ph: f64,
    pub soil_percent: i64,
    pub soil_adc: i64,
    pub pump_status: PumpStatus,
}

/// A persisted telemetry sample. `id` and `captured_at` are assigned by
/// the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub id: i64,
    pub device_id: String,
    pub ph: f64,
    pub soil_percent: i64,
    pub soil_adc: i64,
    pub pump_status: PumpStatus,
    /// Unix seconds.
    pub captured_at: i64,
}

impl<'r> FromRow<'r, SqliteRow> for Reading {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("pump_status")?;
        let pump_status = PumpStatus::parse(&status).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "pump_status".to_string(),
            source: format!("unknown pump_status '{status}'").into(),
        })?;

        Ok(Self {
            id: row.try_get("id")?,
            device_id: row.try_get("device_id")?,
            ph: row.try_get("ph")?,
            soil_percent: row.try_get("soil_percent")?,
            soil_adc: row.try_get("soil_adc")?,
            pump_status,
            captured_at: row.try_get("captured_at")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/smartfarm/smartfarm.db"
    /// - "sqlite::memory:" (tests)
    #[cfg(test)]
    pub async fn connect(db_url: &str) -> Result<Self> {
        Self::connect_with(db_url, 5, Duration::from_secs(5)).await
    }

    pub async fn connect_with(
        db_url: &str,
        max_connections: u32,
        op_timeout: Duration,
    ) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(op_timeout)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool, op_timeout })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(res) => res.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }

    // ----------------------------
    // Readings
    // ----------------------------

    /// Persist one reading and return its store-assigned id.
    pub async fn insert_reading(&self, r: &NewReading) -> Result<i64, StoreError> {
        let result = self
            .bounded(
                sqlx::query(
                    r#"
                    INSERT INTO sensor_logs (device_id, ph, soil_percent, soil_adc, pump_status)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(r.device_id.as_str())
                .bind(r.ph)
                .bind(r.soil_percent)
                .bind(r.soil_adc)
                .bind(r.pump_status.as_str())
                .execute(&self.pool),
            )
            .await?;

        Ok(result.last_insert_rowid())
    }

    /// Newest reading by id, if any.
    pub async fn latest_reading(&self) -> Result<Option<Reading>, StoreError> {
        self.bounded(
            sqlx::query_as::<_, Reading>(
                r#"
                SELECT id, device_id, ph, soil_percent, soil_adc, pump_status, captured_at
                FROM sensor_logs
                ORDER BY id DESC
                LIMIT 1
                "#,
            )
            .fetch_optional(&self.pool),
        )
        .await
    }

    /// Up to `limit` readings, newest first.
    pub async fn recent_readings(&self, limit: i64) -> Result<Vec<Reading>, StoreError> {
        self.bounded(
            sqlx::query_as::<_, Reading>(
                r#"
                SELECT id, device_id, ph, soil_percent, soil_adc, pump_status, captured_at
                FROM sensor_logs
                ORDER BY id DESC
                LIMIT ?
                "#,
            )
            .bind(limit)
            .fetch_all(&self.pool),
        )
        .await
    }

    pub async fn delete_reading(&self, id: i64) -> Result<DeleteOutcome, StoreError> {
        let result = self
            .bounded(
                sqlx::query("DELETE FROM sensor_logs WHERE id = ?")
                    .bind(id)
                    .execute(&self.pool),
            )
            .await?;

        Ok(if result.rows_affected() == 0 {
            DeleteOutcome::NotFound
        } else {
            DeleteOutcome::Deleted
        })
    }

    pub async fn count_readings(&self) -> Result<i64, StoreError> {
        self.bounded(
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sensor_logs")
                .fetch_one(&self.pool),
        )
        .await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn sample(soil_percent: i64) -> NewReading {
        NewReading {
            device_id: "ESP32".into(),
            ph: 6.5,
            soil_percent,
            soil_adc: 2100,
            pump_status: PumpStatus::Off,
        }
    }

    // -- PumpStatus ----------------------------------------------------------

    #[test]
    fn pump_status_parse_is_case_insensitive() {
        assert_eq!(PumpStatus::parse("on"), Some(PumpStatus::On));
        assert_eq!(PumpStatus::parse(" Off\n"), Some(PumpStatus::Off));
        assert_eq!(PumpStatus::parse("toggle"), None);
        assert_eq!(PumpStatus::parse(""), None);
    }

    #[test]
    fn pump_status_serializes_uppercase() {
        assert_eq!(serde_json::to_value(PumpStatus::On).unwrap(), "ON");
        assert_eq!(serde_json::to_value(PumpStatus::Off).unwrap(), "OFF");
    }

    // -- Insert / latest -------------------------------------------------------

    #[tokio::test]
    async fn latest_on_empty_store_is_none() {
        let db = test_db().await;
        assert!(db.latest_reading().await.unwrap().is_none());
        assert_eq!(db.count_readings().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn insert_assigns_increasing_ids_and_timestamp() {
        let db = test_db().await;
        let a = db.insert_reading(&sample(40)).await.unwrap();
        let b = db.insert_reading(&sample(41)).await.unwrap();
        assert!(b > a);

        let latest = db.latest_reading().await.unwrap().unwrap();
        assert_eq!(latest.id, b);
        assert_eq!(latest.soil_percent, 41);
        assert_eq!(latest.pump_status, PumpStatus::Off);
        assert!(latest.captured_at > 1_704_067_200, "captured_at not assigned");
    }

    #[tokio::test]
    async fn latest_is_idempotent_without_new_inserts() {
        let db = test_db().await;
        db.insert_reading(&sample(55)).await.unwrap();

        let first = db.latest_reading().await.unwrap();
        let second = db.latest_reading().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn duplicate_payloads_are_stored_twice() {
        let db = test_db().await;
        db.insert_reading(&sample(30)).await.unwrap();
        db.insert_reading(&sample(30)).await.unwrap();
        assert_eq!(db.count_readings().await.unwrap(), 2);
    }

    // -- Range -----------------------------------------------------------------

    #[tokio::test]
    async fn recent_readings_newest_first_and_limited() {
        let db = test_db().await;
        for pct in [10, 20, 30, 40] {
            db.insert_reading(&sample(pct)).await.unwrap();
        }

        let rows = db.recent_readings(3).await.unwrap();
        let pcts: Vec<i64> = rows.iter().map(|r| r.soil_percent).collect();
        assert_eq!(pcts, vec![40, 30, 20]);
    }

    // -- Delete ----------------------------------------------------------------

    #[tokio::test]
    async fn delete_existing_then_missing() {
        let db = test_db().await;
        let id = db.insert_reading(&sample(25)).await.unwrap();

        assert_eq!(db.delete_reading(id).await.unwrap(), DeleteOutcome::Deleted);
        assert_eq!(db.delete_reading(id).await.unwrap(), DeleteOutcome::NotFound);
        assert!(db.latest_reading().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ids_are_not_reused_after_delete() {
        let db = test_db().await;
        let first = db.insert_reading(&sample(25)).await.unwrap();
        db.delete_reading(first).await.unwrap();
        let second = db.insert_reading(&sample(26)).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn closed_pool_surfaces_store_error() {
        let db = test_db().await;
        db.pool().close().await;
        let err = db.insert_reading(&sample(25)).await.unwrap_err();
        assert!(matches!(err, StoreError::Database(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn stalled_operation_times_out() {
        let timeout = Duration::from_millis(50);
        let db = Db::connect_with("sqlite::memory:", 1, timeout).await.unwrap();

        let err = db
            .bounded(std::future::pending::<Result<(), sqlx::Error>>())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout(d) if d == timeout), "got {err:?}");
    }

    #[tokio::test]
    async fn completed_operation_is_not_cut_short() {
        let db = Db::connect_with("sqlite::memory:", 1, Duration::from_millis(50))
            .await
            .unwrap();
        let v = db.bounded(async { Ok::<_, sqlx::Error>(7) }).await.unwrap();
        assert_eq!(v, 7);
    }
}

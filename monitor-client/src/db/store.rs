use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use time::OffsetDateTime;

use crate::domain::counter::{estimate_current_kw, CounterPolicy};
use crate::domain::{Meter, MeterSettings, MeterUpdate, Reading};
use crate::ts::{from_unix_ms, unix_ms};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("meter '{0}' has never been seen")]
    MeterNotFound(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Result of an insert-if-absent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Duplicate,
}

/// Durable store for meters and their raw readings, backed by SQLite.
///
/// Writes use atomic `INSERT .. ON CONFLICT DO NOTHING` statements, so the
/// live collector and a concurrent bulk import can never double-store or
/// diverge on the same `(meter_id, timestamp)` key. WAL mode lets the
/// dashboard's read queries run alongside the collector's writes.
#[derive(Clone)]
pub struct ReadingStore {
    pool: SqlitePool,
}

impl ReadingStore {
    /// Open (creating if necessary) the on-disk database.
    pub async fn open(path: impl AsRef<Path>, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(15));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Close the connection pool. Later operations fail with
    /// [`StoreError::Database`].
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// In-memory store for tests. A single pooled connection keeps the
    /// database alive for the pool's lifetime.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS meters (
                meter_id      TEXT PRIMARY KEY,
                label         TEXT,
                active        INTEGER NOT NULL DEFAULT 1,
                created_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS raw_readings (
                meter_id       TEXT NOT NULL REFERENCES meters(meter_id),
                ts_ms          INTEGER NOT NULL,
                cumulative_raw INTEGER NOT NULL,
                PRIMARY KEY (meter_id, ts_ms)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS meter_settings (
                meter_id      TEXT PRIMARY KEY REFERENCES meters(meter_id),
                green_max_kw  REAL,
                yellow_max_kw REAL,
                red_max_kw    REAL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Store one reading, creating the meter row on first contact.
    ///
    /// Re-delivery of an already-stored `(meter_id, timestamp)` is a
    /// `Duplicate` no-op; the first stored value wins.
    pub async fn upsert_reading(&self, reading: &Reading) -> Result<UpsertOutcome, StoreError> {
        sqlx::query(
            "INSERT INTO meters (meter_id, label, active, created_at_ms) VALUES (?, NULL, 1, ?) \
             ON CONFLICT(meter_id) DO NOTHING",
        )
        .bind(&reading.meter_id)
        .bind(unix_ms(OffsetDateTime::now_utc()))
        .execute(&self.pool)
        .await?;

        let result = sqlx::query(
            "INSERT INTO raw_readings (meter_id, ts_ms, cumulative_raw) VALUES (?, ?, ?) \
             ON CONFLICT(meter_id, ts_ms) DO NOTHING",
        )
        .bind(&reading.meter_id)
        .bind(unix_ms(reading.timestamp))
        .bind(reading.cumulative_raw)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 0 {
            UpsertOutcome::Duplicate
        } else {
            UpsertOutcome::Inserted
        })
    }

    /// Readings in `[from, to]` ascending, preceded by at most one anchor
    /// reading strictly before `from` (needed for the first bucket delta).
    pub async fn query_range(
        &self,
        meter_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<Reading>, StoreError> {
        let rows: Vec<ReadingRow> = sqlx::query_as(
            r#"
            SELECT meter_id, ts_ms, cumulative_raw FROM (
                SELECT meter_id, ts_ms, cumulative_raw FROM raw_readings
                WHERE meter_id = ?1 AND ts_ms < ?2
                ORDER BY ts_ms DESC LIMIT 1
            )
            UNION ALL
            SELECT meter_id, ts_ms, cumulative_raw FROM raw_readings
            WHERE meter_id = ?1 AND ts_ms >= ?2 AND ts_ms <= ?3
            ORDER BY ts_ms
            "#,
        )
        .bind(meter_id)
        .bind(unix_ms(from))
        .bind(unix_ms(to))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Reading::from).collect())
    }

    /// Every known meter with derived `last_seen` and power estimate.
    pub async fn list_meters(
        &self,
        units_per_kwh: f64,
        policy: &CounterPolicy,
    ) -> Result<Vec<Meter>, StoreError> {
        let rows: Vec<MeterRow> = sqlx::query_as(&format!("{METER_SELECT} ORDER BY m.meter_id"))
            .fetch_all(&self.pool)
            .await?;

        let mut meters = Vec::with_capacity(rows.len());
        for row in rows {
            meters.push(self.into_meter(row, units_per_kwh, policy).await?);
        }
        Ok(meters)
    }

    /// Partially update label/active/settings for an already-seen meter.
    pub async fn set_meter_fields(
        &self,
        meter_id: &str,
        update: &MeterUpdate,
        units_per_kwh: f64,
        policy: &CounterPolicy,
    ) -> Result<Meter, StoreError> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM meters WHERE meter_id = ?")
            .bind(meter_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::MeterNotFound(meter_id.to_string()));
        }

        if let Some(label) = &update.label {
            let trimmed = label.trim();
            let value = (!trimmed.is_empty()).then(|| trimmed.to_string());
            sqlx::query("UPDATE meters SET label = ? WHERE meter_id = ?")
                .bind(value)
                .bind(meter_id)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(active) = update.active {
            sqlx::query("UPDATE meters SET active = ? WHERE meter_id = ?")
                .bind(active)
                .bind(meter_id)
                .execute(&mut *tx)
                .await?;
        }

        if update.touches_settings() {
            sqlx::query(
                "INSERT INTO meter_settings (meter_id) VALUES (?) ON CONFLICT(meter_id) DO NOTHING",
            )
            .bind(meter_id)
            .execute(&mut *tx)
            .await?;

            for (column, value) in [
                ("green_max_kw", update.green_max_kw),
                ("yellow_max_kw", update.yellow_max_kw),
                ("red_max_kw", update.red_max_kw),
            ] {
                if let Some(kw) = value {
                    sqlx::query(&format!(
                        "UPDATE meter_settings SET {column} = ? WHERE meter_id = ?"
                    ))
                    .bind(kw)
                    .bind(meter_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;

        self.fetch_meter(meter_id, units_per_kwh, policy)
            .await?
            .ok_or_else(|| StoreError::MeterNotFound(meter_id.to_string()))
    }

    /// IDs of the meters currently flagged active (the default usage-query
    /// population).
    pub async fn active_meter_ids(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT meter_id FROM meters WHERE active = 1 ORDER BY meter_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Raw readings for a set of meters over a range, ordered by meter then
    /// timestamp, for the backup-schema export.
    pub async fn export_range(
        &self,
        meter_ids: &[String],
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<Reading>, StoreError> {
        if meter_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT meter_id, ts_ms, cumulative_raw FROM raw_readings WHERE ts_ms >= ",
        );
        builder.push_bind(unix_ms(from));
        builder.push(" AND ts_ms <= ");
        builder.push_bind(unix_ms(to));
        builder.push(" AND meter_id IN (");
        let mut ids = builder.separated(", ");
        for id in meter_ids {
            ids.push_bind(id);
        }
        builder.push(") ORDER BY meter_id, ts_ms");

        let rows: Vec<ReadingRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Reading::from).collect())
    }

    /// Total stored reading count; used by idempotence checks.
    pub async fn total_readings(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM raw_readings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn fetch_meter(
        &self,
        meter_id: &str,
        units_per_kwh: f64,
        policy: &CounterPolicy,
    ) -> Result<Option<Meter>, StoreError> {
        let row: Option<MeterRow> = sqlx::query_as(&format!("{METER_SELECT} WHERE m.meter_id = ?"))
            .bind(meter_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.into_meter(row, units_per_kwh, policy).await?)),
            None => Ok(None),
        }
    }

    async fn into_meter(
        &self,
        row: MeterRow,
        units_per_kwh: f64,
        policy: &CounterPolicy,
    ) -> Result<Meter, StoreError> {
        let latest = self.latest_two(&row.meter_id).await?;
        let current_estimated_kw = estimate_current_kw(&latest, units_per_kwh, policy);

        let settings = row.settings_meter_id.is_some().then(|| MeterSettings {
            green_max_kw: row.green_max_kw,
            yellow_max_kw: row.yellow_max_kw,
            red_max_kw: row.red_max_kw,
        });

        Ok(Meter {
            meter_id: row.meter_id,
            label: row.label,
            active: row.active,
            last_seen: row.last_seen_ms.map(from_unix_ms),
            current_estimated_kw,
            settings,
        })
    }

    /// The two newest readings of a meter, ascending.
    async fn latest_two(&self, meter_id: &str) -> Result<Vec<Reading>, StoreError> {
        let rows: Vec<ReadingRow> = sqlx::query_as(
            "SELECT meter_id, ts_ms, cumulative_raw FROM raw_readings \
             WHERE meter_id = ? ORDER BY ts_ms DESC LIMIT 2",
        )
        .bind(meter_id)
        .fetch_all(&self.pool)
        .await?;

        let mut readings: Vec<Reading> = rows.into_iter().map(Reading::from).collect();
        readings.reverse();
        Ok(readings)
    }
}

const METER_SELECT: &str = r#"
    SELECT m.meter_id, m.label, m.active,
           s.meter_id AS settings_meter_id,
           s.green_max_kw, s.yellow_max_kw, s.red_max_kw,
           (SELECT MAX(r.ts_ms) FROM raw_readings r WHERE r.meter_id = m.meter_id) AS last_seen_ms
    FROM meters m
    LEFT JOIN meter_settings s ON s.meter_id = m.meter_id
"#;

#[derive(sqlx::FromRow)]
struct ReadingRow {
    meter_id: String,
    ts_ms: i64,
    cumulative_raw: i64,
}

impl From<ReadingRow> for Reading {
    fn from(row: ReadingRow) -> Self {
        Reading {
            meter_id: row.meter_id,
            timestamp: from_unix_ms(row.ts_ms),
            cumulative_raw: row.cumulative_raw,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MeterRow {
    meter_id: String,
    label: Option<String>,
    active: bool,
    settings_meter_id: Option<String>,
    green_max_kw: Option<f64>,
    yellow_max_kw: Option<f64>,
    red_max_kw: Option<f64>,
    last_seen_ms: Option<i64>,
}

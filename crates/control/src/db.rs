use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;

use crate::model::{
    water_used, CloseLog, IrrigationLog, IrrigationSystem, LogStatus, NewLog, StopReason,
    SystemStatus,
};
use crate::store::{Store, StoreError};

const SYSTEM_COLUMNS: &str = "system_id, field_id, zone_id, kind, status, is_active, flow_rate, \
                              last_activated, last_maintenance_date, total_water_used";

const LOG_COLUMNS: &str = "id, system_id, field_id, start_time, end_time, duration_minutes, \
                           water_amount, status, trigger_type, triggered_by, stop_reason";

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/irrigation/irrigation.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to ":memory:" is its own database, so keep exactly
        // one alive for the lifetime of the pool.
        let pool_options = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
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
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict(db.message().to_string())
            }
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_) => StoreError::Corrupt(e.to_string()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

// ----------------------------
// Row mapping
// ----------------------------

fn parse_text<T: FromStr<Err = String>>(row: &SqliteRow, column: &str) -> Result<T, StoreError> {
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

fn system_from_row(row: &SqliteRow) -> Result<IrrigationSystem, StoreError> {
    Ok(IrrigationSystem {
        system_id: row.try_get("system_id")?,
        field_id: row.try_get("field_id")?,
        zone_id: row.try_get("zone_id")?,
        kind: parse_text(row, "kind")?,
        status: parse_text(row, "status")?,
        is_active: row.try_get("is_active")?,
        flow_rate: row.try_get("flow_rate")?,
        last_activated: row.try_get("last_activated")?,
        last_maintenance_date: row.try_get("last_maintenance_date")?,
        total_water_used: row.try_get("total_water_used")?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<IrrigationLog, StoreError> {
    let duration: Option<i64> = row.try_get("duration_minutes")?;
    let duration_minutes = duration
        .map(u32::try_from)
        .transpose()
        .map_err(|e| StoreError::Corrupt(format!("duration_minutes: {e}")))?;

    let stop_reason: Option<String> = row.try_get("stop_reason")?;
    let stop_reason: Option<StopReason> = stop_reason
        .map(|r| r.parse())
        .transpose()
        .map_err(|e: String| StoreError::Corrupt(format!("stop_reason: {e}")))?;

    Ok(IrrigationLog {
        id: row.try_get("id")?,
        system_id: row.try_get("system_id")?,
        field_id: row.try_get("field_id")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        duration_minutes,
        water_amount: row.try_get("water_amount")?,
        status: parse_text(row, "status")?,
        trigger_type: parse_text(row, "trigger_type")?,
        triggered_by: row.try_get("triggered_by")?,
        stop_reason,
    })
}

#[async_trait]
impl Store for Db {
    // ----------------------------
    // Systems
    // ----------------------------

    async fn insert_system(&self, s: &IrrigationSystem) -> Result<(), StoreError> {
        sqlx::query(&format!(
            "INSERT INTO irrigation_systems ({SYSTEM_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&s.system_id)
        .bind(&s.field_id)
        .bind(&s.zone_id)
        .bind(s.kind.as_str())
        .bind(s.status.as_str())
        .bind(s.is_active)
        .bind(s.flow_rate)
        .bind(s.last_activated)
        .bind(s.last_maintenance_date)
        .bind(s.total_water_used)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_system(&self, s: &IrrigationSystem) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            INSERT INTO irrigation_systems ({SYSTEM_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(system_id) DO UPDATE SET
              field_id=excluded.field_id,
              zone_id=excluded.zone_id,
              kind=excluded.kind,
              is_active=excluded.is_active,
              flow_rate=excluded.flow_rate
            "#
        ))
        .bind(&s.system_id)
        .bind(&s.field_id)
        .bind(&s.zone_id)
        .bind(s.kind.as_str())
        .bind(s.status.as_str())
        .bind(s.is_active)
        .bind(s.flow_rate)
        .bind(s.last_activated)
        .bind(s.last_maintenance_date)
        .bind(s.total_water_used)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_system(&self, system_id: &str) -> Result<Option<IrrigationSystem>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SYSTEM_COLUMNS} FROM irrigation_systems WHERE system_id = ?"
        ))
        .bind(system_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(system_from_row).transpose()
    }

    async fn list_systems(&self) -> Result<Vec<IrrigationSystem>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SYSTEM_COLUMNS} FROM irrigation_systems ORDER BY system_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(system_from_row).collect()
    }

    async fn systems_for_field(&self, field_id: &str) -> Result<Vec<IrrigationSystem>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SYSTEM_COLUMNS} FROM irrigation_systems WHERE field_id = ? ORDER BY system_id"
        ))
        .bind(field_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(system_from_row).collect()
    }

    async fn compare_and_set_status(
        &self,
        system_id: &str,
        expected: SystemStatus,
        desired: SystemStatus,
        last_activated: Option<i64>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE irrigation_systems
            SET status = ?, last_activated = ?
            WHERE system_id = ? AND status = ?
            "#,
        )
        .bind(desired.as_str())
        .bind(last_activated)
        .bind(system_id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // ----------------------------
    // Session logs
    // ----------------------------

    async fn open_log(&self, log: &NewLog) -> Result<IrrigationLog, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO irrigation_logs
              (system_id, field_id, start_time, duration_minutes, water_amount, status,
               trigger_type, triggered_by)
            VALUES (?, ?, ?, ?, 0, ?, ?, ?)
            RETURNING {LOG_COLUMNS}
            "#
        ))
        .bind(&log.system_id)
        .bind(&log.field_id)
        .bind(log.start_time)
        .bind(log.duration_minutes.map(i64::from))
        .bind(LogStatus::Running.as_str())
        .bind(log.trigger_type.as_str())
        .bind(&log.triggered_by)
        .fetch_one(&self.pool)
        .await?;
        log_from_row(&row)
    }

    async fn close_running_log(&self, close: &CloseLog) -> Result<Option<IrrigationLog>, StoreError> {
        let expected = close.expected.map(|t| t.0);
        let mut tx = self.pool.begin().await?;

        // Claiming the row is the conditional update itself; a second closer
        // finds no running row and gets None.
        let row = sqlx::query(&format!(
            r#"
            UPDATE irrigation_logs
            SET status = ?,
                end_time = CASE
                  WHEN duration_minutes IS NULL THEN ?
                  ELSE MIN(?, start_time + duration_minutes * 60000)
                END,
                stop_reason = ?
            WHERE system_id = ? AND status = ? AND (? IS NULL OR id = ?)
            RETURNING {LOG_COLUMNS}
            "#
        ))
        .bind(LogStatus::Completed.as_str())
        .bind(close.end_time)
        .bind(close.end_time)
        .bind(close.reason.as_str())
        .bind(&close.system_id)
        .bind(LogStatus::Running.as_str())
        .bind(expected)
        .bind(expected)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut log = log_from_row(&row)?;
        let end_time = log.end_time.unwrap_or(close.end_time);
        log.water_amount = water_used(log.start_time, end_time, close.flow_rate);

        sqlx::query("UPDATE irrigation_logs SET water_amount = ? WHERE id = ?")
            .bind(log.water_amount)
            .bind(log.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE irrigation_systems SET total_water_used = total_water_used + ? WHERE system_id = ?",
        )
        .bind(log.water_amount)
        .bind(&close.system_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(log))
    }

    async fn running_log(&self, system_id: &str) -> Result<Option<IrrigationLog>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM irrigation_logs WHERE system_id = ? AND status = ?"
        ))
        .bind(system_id)
        .bind(LogStatus::Running.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(log_from_row).transpose()
    }

    async fn recent_logs_for_field(
        &self,
        field_id: &str,
        limit: u32,
    ) -> Result<Vec<IrrigationLog>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {LOG_COLUMNS}
            FROM irrigation_logs
            WHERE field_id = ?
            ORDER BY start_time DESC, id DESC
            LIMIT ?
            "#
        ))
        .bind(field_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(log_from_row).collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

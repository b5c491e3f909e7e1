//! SQLite storage backend implementation
//!
//! Implements both [`AlarmRepository`] and [`MeasurementStore`] on one
//! database file.
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Readers are not blocked by the evaluation loop's writes
//! - **Connection pooling**: 5 connections
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! ## Fire/clear
//!
//! Both run check-then-act inside one transaction. A unique partial index on
//! open history entries backs the check, so a duplicated tick cannot leave two
//! open entries for one alarm.
//!
//! ## Limitations
//!
//! - **Concurrency**: one writer at a time, others wait on the busy timeout
//! - **Distributed**: Single-machine only

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::backend::{AlarmRepository, MeasurementStore};
use super::error::{StorageError, StorageResult};
use super::schema::{
    self, ALARM_COLUMNS, HISTORY_COLUMNS, OUTPUT_COLUMNS, duration_to_millis, timestamp_to_millis,
};
use crate::error::{AlarmError, AlarmResult};
use crate::model::{Alarm, AlarmHistory, Output, OutputChannel, OutputFilter, OutputHistory};
use crate::series::{Point, Series, SeriesQuery, Source, aggregate};

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Create a new SQLite backend
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Run migrations to create tables
    /// 3. Configure SQLite for WAL mode and a 30s busy timeout
    ///
    /// ## Example
    ///
    /// ```no_run
    /// # use telemetry_alarms::storage::sqlite::SqliteBackend;
    /// # async fn example() -> anyhow::Result<()> {
    /// let backend = SqliteBackend::new("./alarms.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;

        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    pub async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }

    async fn count(&self, sql: &str, id: Uuid) -> StorageResult<i64> {
        let row: (i64,) = sqlx::query_as(sql)
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

#[async_trait]
impl AlarmRepository for SqliteBackend {
    #[instrument(skip(self, alarm), fields(alarm_id = %alarm.id))]
    async fn create_alarm(&self, alarm: Alarm) -> AlarmResult<Alarm> {
        let filter_json = serde_json::to_string(&alarm.filter).map_err(StorageError::from)?;

        let result = sqlx::query(&format!(
            "INSERT INTO alarms ({ALARM_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(alarm.id.to_string())
        .bind(&alarm.owner)
        .bind(&alarm.name)
        .bind(&alarm.info)
        .bind(&alarm.message)
        .bind(&alarm.group)
        .bind(alarm.enabled)
        .bind(alarm.fired)
        .bind(filter_json)
        .bind(duration_to_millis(alarm.run_interval))
        .bind(timestamp_to_millis(&alarm.last_run))
        .bind(timestamp_to_millis(&alarm.created_at))
        .bind(timestamp_to_millis(&alarm.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(alarm),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(AlarmError::Conflict(alarm.id.to_string()))
            }
            Err(e) => Err(StorageError::from(e).into()),
        }
    }

    async fn get_alarm(&self, id: Uuid) -> AlarmResult<Alarm> {
        let row = sqlx::query(&format!("SELECT {ALARM_COLUMNS} FROM alarms WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::from)?
            .ok_or_else(|| AlarmError::NotFound(format!("alarm {id}")))?;

        Ok(schema::alarm_from_row(&row)?)
    }

    #[instrument(skip(self))]
    async fn find_due_alarms(
        &self,
        min_interval: Duration,
        now: DateTime<Utc>,
    ) -> AlarmResult<Vec<Alarm>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ALARM_COLUMNS}
            FROM alarms
            WHERE enabled = 1 AND last_run + MAX(run_interval_ms, ?) <= ?
            ORDER BY rowid ASC
            "#
        ))
        .bind(duration_to_millis(min_interval))
        .bind(timestamp_to_millis(&now))
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from)?;

        let alarms = rows
            .iter()
            .map(schema::alarm_from_row)
            .collect::<StorageResult<Vec<_>>>()?;

        debug!("{} alarms due", alarms.len());
        Ok(alarms)
    }

    #[instrument(skip(self, value))]
    async fn fire(&self, alarm_id: Uuid, value: &str, at: DateTime<Utc>) -> AlarmResult<AlarmHistory> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM alarms WHERE id = ?")
            .bind(alarm_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(StorageError::from)?;
        if exists.is_none() {
            return Err(AlarmError::NotFound(format!("alarm {alarm_id}")));
        }

        let (open,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM alarm_history WHERE alarm_id = ? AND cleared = 0")
                .bind(alarm_id.to_string())
                .fetch_one(&mut *tx)
                .await
                .map_err(StorageError::from)?;
        if open > 0 {
            return Err(AlarmError::Conflict(alarm_id.to_string()));
        }

        let entry = AlarmHistory::open(alarm_id, value, at);
        sqlx::query(&format!(
            "INSERT INTO alarm_history ({HISTORY_COLUMNS}) VALUES (?, ?, ?, 0, ?, NULL)"
        ))
        .bind(entry.id.to_string())
        .bind(alarm_id.to_string())
        .bind(&entry.value)
        .bind(timestamp_to_millis(&at))
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from)?;

        sqlx::query("UPDATE alarms SET fired = 1, updated_at = ? WHERE id = ?")
            .bind(timestamp_to_millis(&at))
            .bind(alarm_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from)?;

        tx.commit().await.map_err(StorageError::from)?;
        Ok(entry)
    }

    #[instrument(skip(self))]
    async fn clear(&self, alarm_id: Uuid, at: DateTime<Utc>) -> AlarmResult<AlarmHistory> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        let row = sqlx::query(&format!(
            "SELECT {HISTORY_COLUMNS} FROM alarm_history WHERE alarm_id = ? AND cleared = 0"
        ))
        .bind(alarm_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(StorageError::from)?
        .ok_or_else(|| AlarmError::NotFound(format!("open history entry for alarm {alarm_id}")))?;

        let mut entry = schema::history_from_row(&row)?;
        entry.cleared = true;
        entry.cleared_at = Some(at);

        sqlx::query("UPDATE alarm_history SET cleared = 1, cleared_at = ? WHERE id = ?")
            .bind(timestamp_to_millis(&at))
            .bind(entry.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from)?;

        sqlx::query("UPDATE alarms SET fired = 0, updated_at = ? WHERE id = ?")
            .bind(timestamp_to_millis(&at))
            .bind(alarm_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from)?;

        tx.commit().await.map_err(StorageError::from)?;
        Ok(entry)
    }

    async fn update_last_run(&self, alarm_id: Uuid, at: DateTime<Utc>) -> AlarmResult<()> {
        let result = sqlx::query("UPDATE alarms SET last_run = ? WHERE id = ?")
            .bind(timestamp_to_millis(&at))
            .bind(alarm_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;

        if result.rows_affected() == 0 {
            return Err(AlarmError::NotFound(format!("alarm {alarm_id}")));
        }
        Ok(())
    }

    async fn load_history(&self, alarm_id: Uuid, limit: usize) -> AlarmResult<Vec<AlarmHistory>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {HISTORY_COLUMNS}
            FROM alarm_history
            WHERE alarm_id = ?
            ORDER BY fired_at DESC
            LIMIT ?
            "#
        ))
        .bind(alarm_id.to_string())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from)?;

        Ok(rows
            .iter()
            .map(schema::history_from_row)
            .collect::<StorageResult<Vec<_>>>()?)
    }

    async fn history_size(&self, alarm_id: Uuid) -> AlarmResult<usize> {
        let count = self
            .count("SELECT COUNT(*) FROM alarm_history WHERE alarm_id = ?", alarm_id)
            .await?;
        Ok(count.max(0) as usize)
    }

    async fn create_channel(&self, channel: OutputChannel) -> AlarmResult<OutputChannel> {
        let config_json = serde_json::to_string(&channel.config).map_err(StorageError::from)?;

        sqlx::query("INSERT INTO output_channels (id, owner, name, config) VALUES (?, ?, ?, ?)")
            .bind(channel.id.to_string())
            .bind(&channel.owner)
            .bind(&channel.name)
            .bind(config_json)
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;

        Ok(channel)
    }

    #[instrument(skip(self, output), fields(output_id = %output.id, alarm_id = %output.alarm_id))]
    async fn create_output(&self, output: Output) -> AlarmResult<Output> {
        if self.count("SELECT COUNT(*) FROM alarms WHERE id = ?", output.alarm_id).await? == 0 {
            return Err(AlarmError::NotFound(format!("alarm {}", output.alarm_id)));
        }
        if self
            .count("SELECT COUNT(*) FROM output_channels WHERE id = ?", output.channel.id)
            .await?
            == 0
        {
            return Err(AlarmError::NotFound(format!(
                "output channel {}",
                output.channel.id
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO outputs (
                id, alarm_id, channel_id, name, fire_template, clear_template,
                error_template, enabled, on_fire, on_clear, on_error, last_pushed
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(output.id.to_string())
        .bind(output.alarm_id.to_string())
        .bind(output.channel.id.to_string())
        .bind(&output.name)
        .bind(&output.fire_template)
        .bind(&output.clear_template)
        .bind(&output.error_template)
        .bind(output.enabled)
        .bind(output.on_fire)
        .bind(output.on_clear)
        .bind(output.on_error)
        .bind(output.last_pushed.as_ref().map(timestamp_to_millis))
        .execute(&self.pool)
        .await
        .map_err(StorageError::from)?;

        Ok(output)
    }

    async fn find_outputs_for_alarm(
        &self,
        alarm_id: Uuid,
        filter: OutputFilter,
    ) -> AlarmResult<Vec<Output>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {OUTPUT_COLUMNS}
            FROM outputs o
            JOIN output_channels c ON c.id = o.channel_id
            WHERE o.alarm_id = ?
            ORDER BY o.rowid ASC
            "#
        ))
        .bind(alarm_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from)?;

        let outputs = rows
            .iter()
            .map(schema::output_from_row)
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(outputs
            .into_iter()
            .filter(|output| filter.matches(output))
            .collect())
    }

    #[instrument(skip(self, message))]
    async fn mark_output_pushed(
        &self,
        output_id: Uuid,
        success: bool,
        message: &str,
        at: DateTime<Utc>,
    ) -> AlarmResult<OutputHistory> {
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        let result = sqlx::query("UPDATE outputs SET last_pushed = ? WHERE id = ?")
            .bind(timestamp_to_millis(&at))
            .bind(output_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from)?;
        if result.rows_affected() == 0 {
            return Err(AlarmError::NotFound(format!("output {output_id}")));
        }

        sqlx::query(
            "INSERT INTO output_history (output_id, success, message, timestamp) VALUES (?, ?, ?, ?)",
        )
        .bind(output_id.to_string())
        .bind(success)
        .bind(message)
        .bind(timestamp_to_millis(&at))
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from)?;

        tx.commit().await.map_err(StorageError::from)?;

        Ok(OutputHistory {
            output_id,
            success,
            message: message.to_string(),
            timestamp: at,
        })
    }

    async fn output_history(&self, output_id: Uuid) -> AlarmResult<Vec<OutputHistory>> {
        let rows = sqlx::query(
            r#"
            SELECT output_id, success, message, timestamp
            FROM output_history
            WHERE output_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(output_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::from)?;

        Ok(rows
            .iter()
            .map(schema::output_history_from_row)
            .collect::<StorageResult<Vec<_>>>()?)
    }
}

#[async_trait]
impl MeasurementStore for SqliteBackend {
    #[instrument(skip(self, groups, measurements), fields(count = measurements.len()))]
    async fn write(
        &self,
        device: &str,
        groups: &[String],
        measurements: &BTreeMap<String, f64>,
        at: DateTime<Utc>,
    ) -> AlarmResult<()> {
        if measurements.is_empty() {
            return Ok(());
        }

        let groups = schema::encode_groups(groups);
        let timestamp = timestamp_to_millis(&at);
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        for (key, value) in measurements {
            sqlx::query(
                r#"
                INSERT INTO measurements (device, groups, key, timestamp, value)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT (device, key, timestamp) DO UPDATE SET
                    groups = excluded.groups,
                    value = excluded.value
                "#,
            )
            .bind(device)
            .bind(&groups)
            .bind(key)
            .bind(timestamp)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::from)?;
        }

        tx.commit().await.map_err(StorageError::from)?;
        Ok(())
    }

    #[instrument(skip(self, query), fields(source = %query.source, filters = query.filters.len()))]
    async fn query(&self, query: &SeriesQuery) -> AlarmResult<Vec<Series>> {
        let (source_clause, source_value) = match &query.source {
            Source::Device(device) => ("device = ?", device.clone()),
            Source::Group(group) => ("instr(groups, ?) > 0", schema::group_needle(group)),
        };

        let sql = format!(
            r#"
            SELECT timestamp, value
            FROM measurements
            WHERE key = ? AND {source_clause} AND timestamp >= ? AND timestamp <= ?
            ORDER BY timestamp ASC
            "#
        );

        let mut results = Vec::with_capacity(query.filters.len());
        for filter in &query.filters {
            let (from, to) = aggregate::raw_range(filter, query);
            let rows = sqlx::query(&sql)
                .bind(&filter.key)
                .bind(&source_value)
                .bind(timestamp_to_millis(&from))
                .bind(timestamp_to_millis(&to))
                .fetch_all(&self.pool)
                .await
                .map_err(StorageError::from)?;

            let raw = rows
                .iter()
                .map(|row| -> StorageResult<Point> {
                    let timestamp = schema::millis_to_timestamp(row.try_get("timestamp")?)?;
                    Ok(Point::new(timestamp, row.try_get("value")?))
                })
                .collect::<StorageResult<Series>>()?;

            results.push(aggregate::execute(filter, &raw, query)?);
        }

        debug!("query returned {} series", results.len());
        Ok(results)
    }
}

//! Row conversions for the SQLite backend
//!
//! ## Layout
//!
//! Scalar fields are typed columns. Structured fields that are only ever read
//! back whole are JSON text:
//! - `alarms.filter`: the parsed [`AlarmFilter`]
//! - `output_channels.config`: the tagged [`ChannelConfig`]
//!
//! Timestamps are Unix milliseconds; durations are milliseconds.

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use super::error::{StorageError, StorageResult};
use crate::model::{Alarm, AlarmFilter, AlarmHistory, Output, OutputChannel, OutputHistory};
use crate::notify::ChannelConfig;

pub const ALARM_COLUMNS: &str = "id, owner, name, info, message, group_id, enabled, fired, \
     filter, run_interval_ms, last_run, created_at, updated_at";

pub const HISTORY_COLUMNS: &str = "id, alarm_id, value, cleared, fired_at, cleared_at";

/// Output columns joined with their channel (`c.`)
pub const OUTPUT_COLUMNS: &str = "o.id, o.alarm_id, o.name, o.fire_template, o.clear_template, \
     o.error_template, o.enabled, o.on_fire, o.on_clear, o.on_error, o.last_pushed, \
     c.id AS channel_id, c.owner AS channel_owner, c.name AS channel_name, \
     c.config AS channel_config";

pub fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub fn millis_to_timestamp(millis: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        StorageError::SerializationError(format!("timestamp out of range: {millis}"))
    })
}

pub fn duration_to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Delimited group list matched with `instr(groups, ',g,')`
pub fn encode_groups(groups: &[String]) -> String {
    format!(",{},", groups.join(","))
}

pub fn group_needle(group: &str) -> String {
    format!(",{group},")
}

fn uuid(row: &SqliteRow, column: &str) -> StorageResult<Uuid> {
    let text: String = row.try_get(column)?;
    Uuid::parse_str(&text)
        .map_err(|e| StorageError::SerializationError(format!("invalid {column} '{text}': {e}")))
}

fn timestamp(row: &SqliteRow, column: &str) -> StorageResult<DateTime<Utc>> {
    millis_to_timestamp(row.try_get(column)?)
}

fn optional_timestamp(row: &SqliteRow, column: &str) -> StorageResult<Option<DateTime<Utc>>> {
    row.try_get::<Option<i64>, _>(column)?
        .map(millis_to_timestamp)
        .transpose()
}

/// Alarm without history
pub fn alarm_from_row(row: &SqliteRow) -> StorageResult<Alarm> {
    let filter_json: String = row.try_get("filter")?;
    let filter: AlarmFilter = serde_json::from_str(&filter_json)?;
    let interval_ms: i64 = row.try_get("run_interval_ms")?;

    Ok(Alarm {
        id: uuid(row, "id")?,
        owner: row.try_get("owner")?,
        name: row.try_get("name")?,
        info: row.try_get("info")?,
        message: row.try_get("message")?,
        group: row.try_get("group_id")?,
        enabled: row.try_get("enabled")?,
        fired: row.try_get("fired")?,
        filter,
        run_interval: Duration::from_millis(interval_ms.max(0) as u64),
        last_run: timestamp(row, "last_run")?,
        created_at: timestamp(row, "created_at")?,
        updated_at: timestamp(row, "updated_at")?,
        history: Vec::new(),
        compiled: OnceLock::new(),
    })
}

pub fn history_from_row(row: &SqliteRow) -> StorageResult<AlarmHistory> {
    Ok(AlarmHistory {
        id: uuid(row, "id")?,
        alarm_id: uuid(row, "alarm_id")?,
        value: row.try_get("value")?,
        cleared: row.try_get("cleared")?,
        fired_at: timestamp(row, "fired_at")?,
        cleared_at: optional_timestamp(row, "cleared_at")?,
    })
}

pub fn channel_from_row(row: &SqliteRow) -> StorageResult<OutputChannel> {
    let config_json: String = row.try_get("config")?;
    let config: ChannelConfig = serde_json::from_str(&config_json)?;

    Ok(OutputChannel {
        id: uuid(row, "id")?,
        owner: row.try_get("owner")?,
        name: row.try_get("name")?,
        config,
    })
}

/// Row selected with [`OUTPUT_COLUMNS`]
pub fn output_from_row(row: &SqliteRow) -> StorageResult<Output> {
    let config_json: String = row.try_get("channel_config")?;

    let channel = OutputChannel {
        id: uuid(row, "channel_id")?,
        owner: row.try_get("channel_owner")?,
        name: row.try_get("channel_name")?,
        config: serde_json::from_str(&config_json)?,
    };

    Ok(Output {
        id: uuid(row, "id")?,
        alarm_id: uuid(row, "alarm_id")?,
        name: row.try_get("name")?,
        fire_template: row.try_get("fire_template")?,
        clear_template: row.try_get("clear_template")?,
        error_template: row.try_get("error_template")?,
        channel,
        enabled: row.try_get("enabled")?,
        on_fire: row.try_get("on_fire")?,
        on_clear: row.try_get("on_clear")?,
        on_error: row.try_get("on_error")?,
        last_pushed: optional_timestamp(row, "last_pushed")?,
    })
}

pub fn output_history_from_row(row: &SqliteRow) -> StorageResult<OutputHistory> {
    Ok(OutputHistory {
        output_id: uuid(row, "output_id")?,
        success: row.try_get("success")?,
        message: row.try_get("message")?,
        timestamp: timestamp(row, "timestamp")?,
    })
}

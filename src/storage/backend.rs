//! Storage traits
//!
//! Alarm evaluation consumes two collaborators: an [`AlarmRepository`] owning
//! alarm, history and output records, and a [`MeasurementStore`] owning raw
//! time-series data. Both are shared across tasks and must be `Send + Sync`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AlarmResult;
use crate::model::{Alarm, AlarmHistory, Output, OutputChannel, OutputFilter, OutputHistory};
use crate::series::{Series, SeriesQuery};

/// Default page size of [`AlarmRepository::load_history`]
pub const HISTORY_PAGE: usize = 20;

/// Persistent alarm, history and output records
///
/// Alarms are returned without their history; use
/// [`load_history`](AlarmRepository::load_history).
///
/// ## Fire/clear guards
///
/// `fire` and `clear` are check-then-act on the open history entry:
///
/// - `fire` fails with `Conflict` if an open entry exists
/// - `clear` fails with `NotFound` if none exists
///
/// so a duplicated tick can never double-fire.
#[async_trait]
pub trait AlarmRepository: Send + Sync {
    async fn create_alarm(&self, alarm: Alarm) -> AlarmResult<Alarm>;

    async fn get_alarm(&self, id: Uuid) -> AlarmResult<Alarm>;

    /// Enabled alarms with `now >= last_run + max(run_interval, min_interval)`,
    /// in creation order
    async fn find_due_alarms(
        &self,
        min_interval: Duration,
        now: DateTime<Utc>,
    ) -> AlarmResult<Vec<Alarm>>;

    async fn fire(&self, alarm_id: Uuid, value: &str, at: DateTime<Utc>) -> AlarmResult<AlarmHistory>;

    async fn clear(&self, alarm_id: Uuid, at: DateTime<Utc>) -> AlarmResult<AlarmHistory>;

    async fn update_last_run(&self, alarm_id: Uuid, at: DateTime<Utc>) -> AlarmResult<()>;

    /// Newest first, at most `limit` entries
    async fn load_history(&self, alarm_id: Uuid, limit: usize) -> AlarmResult<Vec<AlarmHistory>>;

    async fn history_size(&self, alarm_id: Uuid) -> AlarmResult<usize>;

    async fn create_channel(&self, channel: OutputChannel) -> AlarmResult<OutputChannel>;

    /// Fails with `NotFound` unless the alarm and the channel exist
    async fn create_output(&self, output: Output) -> AlarmResult<Output>;

    async fn find_outputs_for_alarm(
        &self,
        alarm_id: Uuid,
        filter: OutputFilter,
    ) -> AlarmResult<Vec<Output>>;

    /// Record a push attempt and set the output's `last_pushed`
    async fn mark_output_pushed(
        &self,
        output_id: Uuid,
        success: bool,
        message: &str,
        at: DateTime<Utc>,
    ) -> AlarmResult<OutputHistory>;

    /// Oldest first
    async fn output_history(&self, output_id: Uuid) -> AlarmResult<Vec<OutputHistory>>;
}

/// Raw measurements and their grouped retrieval
#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// Store one value per measurement name for `device`, tagged with its groups
    async fn write(
        &self,
        device: &str,
        groups: &[String],
        measurements: &BTreeMap<String, f64>,
        at: DateTime<Utc>,
    ) -> AlarmResult<()>;

    /// One series per filter of `query`, in filter order
    async fn query(&self, query: &SeriesQuery) -> AlarmResult<Vec<Series>>;
}

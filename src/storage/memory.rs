//! In-memory storage backend (no persistence)
//!
//! Useful for tests and for running the engine without a database.
//!
//! ## Limitations
//!
//! - **No persistence**: all data lost on restart
//! - **Limited capacity**: each (device, measurement) keeps at most
//!   [`MAX_POINTS_PER_SERIES`] points, oldest evicted first

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::backend::{AlarmRepository, MeasurementStore};
use crate::error::{AlarmError, AlarmResult};
use crate::model::{Alarm, AlarmHistory, Output, OutputChannel, OutputFilter, OutputHistory};
use crate::series::{Point, Series, SeriesQuery, Source, aggregate};

/// Maximum points kept per device and measurement
pub const MAX_POINTS_PER_SERIES: usize = 10_000;

#[derive(Default)]
struct Records {
    /// Creation order
    alarms: Vec<Alarm>,
    channels: HashMap<Uuid, OutputChannel>,
    outputs: Vec<Output>,
    output_history: Vec<OutputHistory>,
}

impl Records {
    fn alarm_mut(&mut self, id: Uuid) -> AlarmResult<&mut Alarm> {
        self.alarms
            .iter_mut()
            .find(|alarm| alarm.id == id)
            .ok_or_else(|| AlarmError::NotFound(format!("alarm {id}")))
    }

    fn alarm(&self, id: Uuid) -> AlarmResult<&Alarm> {
        self.alarms
            .iter()
            .find(|alarm| alarm.id == id)
            .ok_or_else(|| AlarmError::NotFound(format!("alarm {id}")))
    }
}

#[derive(Default)]
struct Measurements {
    /// (device, measurement name) -> time-ordered points
    series: HashMap<(String, String), VecDeque<Point>>,

    /// Latest groups each device was written with
    groups: HashMap<String, Vec<String>>,
}

impl Measurements {
    fn matches(&self, device: &str, source: &Source) -> bool {
        match source {
            Source::Device(wanted) => device == wanted,
            Source::Group(group) => self
                .groups
                .get(device)
                .is_some_and(|groups| groups.contains(group)),
        }
    }

    fn raw(&self, source: &Source, key: &str) -> Series {
        let mut points: Series = self
            .series
            .iter()
            .filter(|((device, name), _)| name == key && self.matches(device, source))
            .flat_map(|(_, points)| points.iter().copied())
            .collect();
        points.sort_by_key(|point| point.timestamp);
        points
    }
}

/// In-memory backend implementing both storage traits
#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<Records>,
    measurements: RwLock<Measurements>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn without_history(alarm: &Alarm) -> Alarm {
    let mut alarm = alarm.clone();
    alarm.history.clear();
    alarm
}

#[async_trait]
impl AlarmRepository for MemoryBackend {
    async fn create_alarm(&self, alarm: Alarm) -> AlarmResult<Alarm> {
        let mut records = self.records.write().await;
        if records.alarms.iter().any(|existing| existing.id == alarm.id) {
            return Err(AlarmError::Conflict(alarm.id.to_string()));
        }
        records.alarms.push(alarm.clone());
        Ok(alarm)
    }

    async fn get_alarm(&self, id: Uuid) -> AlarmResult<Alarm> {
        let records = self.records.read().await;
        records.alarm(id).map(without_history)
    }

    async fn find_due_alarms(
        &self,
        min_interval: Duration,
        now: DateTime<Utc>,
    ) -> AlarmResult<Vec<Alarm>> {
        let records = self.records.read().await;
        Ok(records
            .alarms
            .iter()
            .filter(|alarm| alarm.is_due(now, min_interval))
            .map(without_history)
            .collect())
    }

    #[instrument(skip(self, value))]
    async fn fire(&self, alarm_id: Uuid, value: &str, at: DateTime<Utc>) -> AlarmResult<AlarmHistory> {
        let mut records = self.records.write().await;
        records.alarm_mut(alarm_id)?.fire(value, at)
    }

    #[instrument(skip(self))]
    async fn clear(&self, alarm_id: Uuid, at: DateTime<Utc>) -> AlarmResult<AlarmHistory> {
        let mut records = self.records.write().await;
        records.alarm_mut(alarm_id)?.clear(at)
    }

    async fn update_last_run(&self, alarm_id: Uuid, at: DateTime<Utc>) -> AlarmResult<()> {
        let mut records = self.records.write().await;
        records.alarm_mut(alarm_id)?.last_run = at;
        Ok(())
    }

    async fn load_history(&self, alarm_id: Uuid, limit: usize) -> AlarmResult<Vec<AlarmHistory>> {
        let records = self.records.read().await;
        let alarm = records.alarm(alarm_id)?;
        let mut history = alarm.history.clone();
        history.sort_by(|a, b| b.fired_at.cmp(&a.fired_at));
        history.truncate(limit);
        Ok(history)
    }

    async fn history_size(&self, alarm_id: Uuid) -> AlarmResult<usize> {
        let records = self.records.read().await;
        Ok(records.alarm(alarm_id)?.history.len())
    }

    async fn create_channel(&self, channel: OutputChannel) -> AlarmResult<OutputChannel> {
        let mut records = self.records.write().await;
        records.channels.insert(channel.id, channel.clone());
        Ok(channel)
    }

    async fn create_output(&self, output: Output) -> AlarmResult<Output> {
        let mut records = self.records.write().await;
        records.alarm(output.alarm_id)?;
        if !records.channels.contains_key(&output.channel.id) {
            return Err(AlarmError::NotFound(format!(
                "output channel {}",
                output.channel.id
            )));
        }
        records.outputs.push(output.clone());
        Ok(output)
    }

    async fn find_outputs_for_alarm(
        &self,
        alarm_id: Uuid,
        filter: OutputFilter,
    ) -> AlarmResult<Vec<Output>> {
        let records = self.records.read().await;
        Ok(records
            .outputs
            .iter()
            .filter(|output| output.alarm_id == alarm_id && filter.matches(output))
            .cloned()
            .collect())
    }

    async fn mark_output_pushed(
        &self,
        output_id: Uuid,
        success: bool,
        message: &str,
        at: DateTime<Utc>,
    ) -> AlarmResult<OutputHistory> {
        let mut records = self.records.write().await;
        let output = records
            .outputs
            .iter_mut()
            .find(|output| output.id == output_id)
            .ok_or_else(|| AlarmError::NotFound(format!("output {output_id}")))?;
        output.last_pushed = Some(at);

        let entry = OutputHistory {
            output_id,
            success,
            message: message.to_string(),
            timestamp: at,
        };
        records.output_history.push(entry.clone());
        Ok(entry)
    }

    async fn output_history(&self, output_id: Uuid) -> AlarmResult<Vec<OutputHistory>> {
        let records = self.records.read().await;
        Ok(records
            .output_history
            .iter()
            .filter(|entry| entry.output_id == output_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MeasurementStore for MemoryBackend {
    async fn write(
        &self,
        device: &str,
        groups: &[String],
        measurements: &BTreeMap<String, f64>,
        at: DateTime<Utc>,
    ) -> AlarmResult<()> {
        let mut store = self.measurements.write().await;
        store.groups.insert(device.to_string(), groups.to_vec());

        for (name, value) in measurements {
            let points = store
                .series
                .entry((device.to_string(), name.clone()))
                .or_default();

            // keep time order for late arrivals
            let index = points.partition_point(|point| point.timestamp <= at);
            points.insert(index, Point::new(at, *value));

            if points.len() > MAX_POINTS_PER_SERIES {
                points.pop_front();
            }
        }

        Ok(())
    }

    #[instrument(skip(self, query), fields(source = %query.source))]
    async fn query(&self, query: &SeriesQuery) -> AlarmResult<Vec<Series>> {
        let store = self.measurements.read().await;

        let results = query
            .filters
            .iter()
            .map(|filter| aggregate::execute(filter, &store.raw(&query.source, &filter.key), query))
            .collect::<AlarmResult<Vec<Series>>>()?;

        debug!(
            "in-memory query returned {} series for {}",
            results.len(),
            query.source
        );
        Ok(results)
    }
}

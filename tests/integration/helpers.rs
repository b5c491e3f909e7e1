//! Helper functions for integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use telemetry_alarms::dispatcher::NotificationDispatcher;
use telemetry_alarms::metrics::MemoryMetrics;
use telemetry_alarms::notify::ChannelConfig;
use telemetry_alarms::notify::webhook::WebhookConfig;
use telemetry_alarms::series::TimeSeriesReader;
use telemetry_alarms::series::retention::default_retentions;
use telemetry_alarms::storage::memory::MemoryBackend;
use telemetry_alarms::storage::{AlarmRepository, MeasurementStore};
use telemetry_alarms::{Alarm, AlarmRunner, NewAlarm, Output, OutputChannel};

pub const GROUP: &str = "greenhouse";

pub fn new_alarm(name: &str, filter: &str, trigger: usize) -> NewAlarm {
    NewAlarm {
        name: name.to_string(),
        info: String::new(),
        group: GROUP.to_string(),
        message: format!("{name} needs attention"),
        enabled: true,
        interval: 60,
        trigger,
        filter: filter.to_string(),
    }
}

pub struct Harness {
    pub backend: Arc<MemoryBackend>,
    pub metrics: Arc<MemoryMetrics>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new()),
            metrics: Arc::new(MemoryMetrics::new()),
        }
    }

    pub fn runner(&self) -> AlarmRunner {
        AlarmRunner::new(
            self.backend.clone(),
            TimeSeriesReader::new(self.backend.clone(), default_retentions()),
            NotificationDispatcher::new(self.backend.clone(), reqwest::Client::new()),
            self.metrics.clone(),
        )
    }

    pub async fn alarm(&self, name: &str, filter: &str, trigger: usize) -> Alarm {
        let alarm = new_alarm(name, filter, trigger).into_alarm("owner-1").unwrap();
        self.backend.create_alarm(alarm).await.unwrap()
    }

    pub async fn webhook_output(&self, alarm: &Alarm, name: &str, url: String) -> Output {
        let channel = OutputChannel::new(
            "owner-1",
            name,
            ChannelConfig::Webhook(WebhookConfig::new(url)),
        );
        self.backend.create_channel(channel.clone()).await.unwrap();

        let mut output = Output::new(alarm.id, name, channel);
        output.fire_template = "{{ alarm_name }} fired: {{ value }}".to_string();
        output.clear_template = "{{ alarm_name }} cleared".to_string();
        output.error_template = "{{ alarm_name }}: {{ error }}".to_string();
        self.backend.create_output(output).await.unwrap()
    }

    /// One point per minute for `key`, the last one a second ago
    pub async fn write_minutes(&self, key: &str, values: &[f64]) {
        let points: Vec<(i64, f64)> = values
            .iter()
            .enumerate()
            .map(|(i, value)| ((values.len() - 1 - i) as i64, *value))
            .collect();
        self.write_at(key, &points).await;
    }

    /// Points for `key` at `(minutes_ago, value)`, each a second before the minute mark
    pub async fn write_at(&self, key: &str, points: &[(i64, f64)]) {
        let now = Utc::now();
        for (minutes_ago, value) in points {
            let at = now - chrono::Duration::minutes(*minutes_ago) - chrono::Duration::seconds(1);
            self.backend
                .write(
                    "sensor-1",
                    &[GROUP.to_string()],
                    &BTreeMap::from([(key.to_string(), *value)]),
                    at,
                )
                .await
                .unwrap();
        }
    }
}

//! Scheduler loop behavior under a paused clock
//!
//! These tests verify that:
//! - A due alarm is evaluated once and then gated by its interval
//! - A panicking pass is recovered and the loop keeps running
//! - Stopping prevents further passes

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use telemetry_alarms::dispatcher::NotificationDispatcher;
use telemetry_alarms::metrics::{ALARM_EVALUATE, MemoryMetrics};
use telemetry_alarms::model::{OutputFilter, OutputHistory};
use telemetry_alarms::series::TimeSeriesReader;
use telemetry_alarms::series::retention::default_retentions;
use telemetry_alarms::storage::AlarmRepository;
use telemetry_alarms::storage::memory::MemoryBackend;
use telemetry_alarms::{
    Alarm, AlarmHistory, AlarmResult, AlarmRunner, AlarmScheduler, Output, OutputChannel,
};
use uuid::Uuid;

use crate::helpers::*;

/// Delegates to a memory backend, panicking on the first `panics` due-alarm lookups
struct FlakyRepository {
    inner: Arc<MemoryBackend>,
    panics: usize,
    lookups: AtomicUsize,
}

#[async_trait]
impl AlarmRepository for FlakyRepository {
    async fn create_alarm(&self, alarm: Alarm) -> AlarmResult<Alarm> {
        self.inner.create_alarm(alarm).await
    }

    async fn get_alarm(&self, id: Uuid) -> AlarmResult<Alarm> {
        self.inner.get_alarm(id).await
    }

    async fn find_due_alarms(
        &self,
        min_interval: Duration,
        now: DateTime<Utc>,
    ) -> AlarmResult<Vec<Alarm>> {
        let lookup = self.lookups.fetch_add(1, Ordering::SeqCst);
        if lookup < self.panics {
            panic!("lookup {lookup} exploded");
        }
        self.inner.find_due_alarms(min_interval, now).await
    }

    async fn fire(&self, alarm_id: Uuid, value: &str, at: DateTime<Utc>) -> AlarmResult<AlarmHistory> {
        self.inner.fire(alarm_id, value, at).await
    }

    async fn clear(&self, alarm_id: Uuid, at: DateTime<Utc>) -> AlarmResult<AlarmHistory> {
        self.inner.clear(alarm_id, at).await
    }

    async fn update_last_run(&self, alarm_id: Uuid, at: DateTime<Utc>) -> AlarmResult<()> {
        self.inner.update_last_run(alarm_id, at).await
    }

    async fn load_history(&self, alarm_id: Uuid, limit: usize) -> AlarmResult<Vec<AlarmHistory>> {
        self.inner.load_history(alarm_id, limit).await
    }

    async fn history_size(&self, alarm_id: Uuid) -> AlarmResult<usize> {
        self.inner.history_size(alarm_id).await
    }

    async fn create_channel(&self, channel: OutputChannel) -> AlarmResult<OutputChannel> {
        self.inner.create_channel(channel).await
    }

    async fn create_output(&self, output: Output) -> AlarmResult<Output> {
        self.inner.create_output(output).await
    }

    async fn find_outputs_for_alarm(
        &self,
        alarm_id: Uuid,
        filter: OutputFilter,
    ) -> AlarmResult<Vec<Output>> {
        self.inner.find_outputs_for_alarm(alarm_id, filter).await
    }

    async fn mark_output_pushed(
        &self,
        output_id: Uuid,
        success: bool,
        message: &str,
        at: DateTime<Utc>,
    ) -> AlarmResult<OutputHistory> {
        self.inner
            .mark_output_pushed(output_id, success, message, at)
            .await
    }

    async fn output_history(&self, output_id: Uuid) -> AlarmResult<Vec<OutputHistory>> {
        self.inner.output_history(output_id).await
    }
}

fn scheduler(
    repository: Arc<dyn AlarmRepository>,
    backend: Arc<MemoryBackend>,
    metrics: Arc<MemoryMetrics>,
    interval: Duration,
) -> AlarmScheduler {
    let runner = AlarmRunner::new(
        repository.clone(),
        TimeSeriesReader::new(backend, default_retentions()),
        NotificationDispatcher::new(repository, reqwest::Client::new()),
        metrics,
    );
    AlarmScheduler::new(runner, interval, Duration::from_secs(15)).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_due_alarm_is_gated_after_running() {
    let harness = Harness::new();
    let alarm = harness.alarm("hot", "mean(temperature) > 30", 3).await;
    harness
        .backend
        .update_last_run(alarm.id, Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();

    let scheduler = scheduler(
        harness.backend.clone(),
        harness.backend.clone(),
        harness.metrics.clone(),
        Duration::from_secs(15),
    );
    assert!(scheduler.start());

    // many ticks pass on the paused clock; the wall clock barely moves
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert!(scheduler.is_running());
    assert_eq!(harness.metrics.counter(ALARM_EVALUATE), 1);

    let reloaded = harness.backend.get_alarm(alarm.id).await.unwrap();
    assert!(reloaded.last_run > Utc::now() - chrono::Duration::minutes(1));

    assert!(scheduler.stop());
}

#[tokio::test(start_paused = true)]
async fn test_panicking_pass_is_recovered() {
    let harness = Harness::new();
    let alarm = harness.alarm("hot", "mean(temperature) > 30", 3).await;
    harness
        .backend
        .update_last_run(alarm.id, Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();

    let flaky = Arc::new(FlakyRepository {
        inner: harness.backend.clone(),
        panics: 2,
        lookups: AtomicUsize::new(0),
    });

    let scheduler = scheduler(
        flaky.clone(),
        harness.backend.clone(),
        harness.metrics.clone(),
        Duration::from_secs(5),
    );
    assert!(scheduler.start());

    // two panics with a 15s cooldown each, then a regular pass
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(scheduler.is_running());
    assert!(flaky.lookups.load(Ordering::SeqCst) > 2);
    assert_eq!(harness.metrics.counter(ALARM_EVALUATE), 1);

    scheduler.stop();
}

#[tokio::test(start_paused = true)]
async fn test_stop_prevents_further_passes() {
    let harness = Harness::new();
    let flaky = Arc::new(FlakyRepository {
        inner: harness.backend.clone(),
        panics: 0,
        lookups: AtomicUsize::new(0),
    });

    let scheduler = scheduler(
        flaky.clone(),
        harness.backend.clone(),
        harness.metrics.clone(),
        Duration::from_secs(5),
    );
    scheduler.start();
    tokio::time::sleep(Duration::from_secs(12)).await;
    let before = flaky.lookups.load(Ordering::SeqCst);
    assert!(before >= 2);

    assert!(scheduler.stop());
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(flaky.lookups.load(Ordering::SeqCst), before);
    assert!(!scheduler.is_running());
}

#[tokio::test]
async fn test_run_once_without_loop() {
    let harness = Harness::new();
    let alarm = harness.alarm("hot", "max(temperature) > 30", 2).await;
    harness
        .backend
        .update_last_run(alarm.id, Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    harness.write_minutes("temperature", &[31.0, 32.0]).await;

    let scheduler = scheduler(
        harness.backend.clone(),
        harness.backend.clone(),
        harness.metrics.clone(),
        Duration::from_secs(15),
    );

    let summary = scheduler.run_once().await.unwrap();
    assert_eq!(summary.outcomes, vec![(alarm.id, telemetry_alarms::RunOutcome::Fired)]);
    assert!(!scheduler.is_running());

    // freshly run, so not due again
    let summary = scheduler.run_once().await.unwrap();
    assert!(summary.is_empty());
}

#[tokio::test]
async fn test_unrepresentable_interval_does_not_block_other_alarms() {
    let harness = Harness::new();

    // stored alarms can carry intervals creation would reject
    let mut stuck = new_alarm("stuck", "max(temperature) > 30", 2)
        .into_alarm("owner-1")
        .unwrap();
    stuck.run_interval = Duration::from_secs(10_000_000_000_000);
    stuck.last_run = Utc::now() - chrono::Duration::hours(1);
    let stuck = harness.backend.create_alarm(stuck).await.unwrap();

    let hot = harness.alarm("hot", "max(temperature) > 30", 2).await;
    harness
        .backend
        .update_last_run(hot.id, Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    harness.write_minutes("temperature", &[31.0, 32.0]).await;

    let scheduler = scheduler(
        harness.backend.clone(),
        harness.backend.clone(),
        harness.metrics.clone(),
        Duration::from_secs(15),
    );

    let summary = scheduler.run_once().await.unwrap();
    assert_eq!(summary.outcomes, vec![(hot.id, telemetry_alarms::RunOutcome::Fired)]);
    assert!(!harness.backend.get_alarm(stuck.id).await.unwrap().fired);
}

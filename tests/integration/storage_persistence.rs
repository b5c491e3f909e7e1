//! Integration tests for SQLite persistence
//!
//! These tests verify that:
//! - An alarm fired by the runner survives reopening the database
//! - Measurements written through the store feed the evaluation
//! - Output push history is persisted

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use telemetry_alarms::dispatcher::NotificationDispatcher;
use telemetry_alarms::metrics::NoopMetrics;
use telemetry_alarms::series::TimeSeriesReader;
use telemetry_alarms::series::retention::default_retentions;
use telemetry_alarms::storage::sqlite::SqliteBackend;
use telemetry_alarms::storage::{AlarmRepository, HISTORY_PAGE, MeasurementStore};
use telemetry_alarms::{AlarmRunner, RunOutcome};
use tempfile::tempdir;

use crate::helpers::*;

fn runner(backend: Arc<SqliteBackend>) -> AlarmRunner {
    AlarmRunner::new(
        backend.clone(),
        TimeSeriesReader::new(backend.clone(), default_retentions()),
        NotificationDispatcher::new(backend, reqwest::Client::new()),
        Arc::new(NoopMetrics),
    )
}

async fn write_minutes(backend: &SqliteBackend, values: &[f64]) {
    let now = Utc::now();
    for (i, value) in values.iter().enumerate() {
        let minutes_ago = (values.len() - 1 - i) as i64;
        let at = now - chrono::Duration::minutes(minutes_ago) - chrono::Duration::seconds(1);
        backend
            .write(
                "sensor-1",
                &[GROUP.to_string(), "north-wing".to_string()],
                &BTreeMap::from([("humidity".to_string(), *value)]),
                at,
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_fired_alarm_survives_reopen() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("alarms.db");

    let alarm_id = {
        let backend = Arc::new(SqliteBackend::new(&db_path).await.unwrap());
        let alarm = new_alarm("damp", "max(humidity) >= 80", 3)
            .into_alarm("owner-1")
            .unwrap();
        let alarm = backend.create_alarm(alarm).await.unwrap();

        write_minutes(&backend, &[81.0, 85.0, 90.0]).await;
        let outcome = runner(backend.clone()).run_alarm(&alarm).await;
        assert_eq!(outcome, RunOutcome::Fired);

        backend.close().await.unwrap();
        alarm.id
    };

    let backend = SqliteBackend::new(&db_path).await.unwrap();
    let alarm = backend.get_alarm(alarm_id).await.unwrap();
    assert!(alarm.fired);
    assert!(alarm.expression().is_ok());

    let history = backend.load_history(alarm_id, HISTORY_PAGE).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].value, "max_humidity=90.00");
    assert!(!history[0].cleared);

    // freshly run alarms are not due
    let due = backend
        .find_due_alarms(std::time::Duration::from_secs(15), Utc::now())
        .await
        .unwrap();
    assert!(due.is_empty());
}

#[tokio::test]
async fn test_history_page_is_newest_first() {
    let temp_dir = tempdir().unwrap();
    let backend = SqliteBackend::new(temp_dir.path().join("alarms.db"))
        .await
        .unwrap();
    let alarm = backend
        .create_alarm(new_alarm("damp", "max(humidity) >= 80", 1).into_alarm("o").unwrap())
        .await
        .unwrap();

    let base = Utc::now() - chrono::Duration::hours(2);
    for i in 0..25 {
        let at = base + chrono::Duration::minutes(i);
        backend.fire(alarm.id, &format!("v{i}"), at).await.unwrap();
        backend
            .clear(alarm.id, at + chrono::Duration::seconds(30))
            .await
            .unwrap();
    }

    let page = backend.load_history(alarm.id, HISTORY_PAGE).await.unwrap();
    assert_eq!(page.len(), HISTORY_PAGE);
    assert_eq!(page[0].value, "v24");
    assert_eq!(page[HISTORY_PAGE - 1].value, "v5");
    assert_eq!(backend.history_size(alarm.id).await.unwrap(), 25);
}

//! End-to-end alarm evaluation over the in-memory backend
//!
//! These tests verify that:
//! - A condition held for the whole debounce window fires once
//! - A fired alarm clears when the condition stops holding
//! - A broken condition is reported through the error template
//! - Too little data is skipped without notifications
//! - Transformed filters fire from the same window as plain ones
//! - Keys are only compared within the same bucket

use telemetry_alarms::RunOutcome;
use telemetry_alarms::metrics::{
    ALARM_EVALUATE, ALARM_NOTIFICATION, ALARM_NOTIFICATION_ERROR, ALARM_NOTIFICATION_FIRED,
};
use telemetry_alarms::storage::{AlarmRepository, HISTORY_PAGE};
use wiremock::matchers::{body_string, body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_fire_and_clear_notify_outputs() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_string("hot fired: mean_temperature=37.00"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_string("hot cleared"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new();
    let runner = harness.runner();
    let alarm = harness.alarm("hot", "mean(temperature) > 30", 3).await;
    let output = harness
        .webhook_output(&alarm, "ops", format!("{}/hook", server.uri()))
        .await;

    harness.write_minutes("temperature", &[35.0, 36.0, 37.0]).await;
    let summary = runner.run_alarms(vec![alarm.clone()]).await;
    assert_eq!(summary.outcomes, vec![(alarm.id, RunOutcome::Fired)]);

    let fired = harness.backend.get_alarm(alarm.id).await.unwrap();
    assert!(fired.fired);

    // second pass in the same state does nothing
    let summary = runner.run_alarms(vec![fired.clone()]).await;
    assert_eq!(summary.outcomes, vec![(alarm.id, RunOutcome::Unchanged)]);

    // cold readings pull every bucket's mean below the threshold
    harness.write_minutes("temperature", &[-40.0, -40.0, -40.0]).await;
    let summary = runner.run_alarms(vec![fired]).await;
    assert_eq!(summary.outcomes, vec![(alarm.id, RunOutcome::Cleared)]);

    let history = harness
        .backend
        .load_history(alarm.id, HISTORY_PAGE)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].cleared);
    assert_eq!(history[0].value, "mean_temperature=37.00");

    let pushes = harness.backend.output_history(output.id).await.unwrap();
    assert_eq!(pushes.len(), 2);
    assert!(pushes.iter().all(|push| push.success));
    assert_eq!(harness.metrics.counter(ALARM_NOTIFICATION), 2);
}

#[tokio::test]
async fn test_single_dip_prevents_firing() {
    let harness = Harness::new();
    let alarm = harness.alarm("hot", "mean(temperature) > 30", 3).await;

    harness.write_minutes("temperature", &[35.0, 10.0, 37.0]).await;
    let outcome = harness.runner().run_alarm(&alarm).await;

    assert_eq!(outcome, RunOutcome::Unchanged);
    assert!(!harness.backend.get_alarm(alarm.id).await.unwrap().fired);
    assert_eq!(harness.metrics.counter(ALARM_NOTIFICATION_FIRED), 0);
}

#[tokio::test]
async fn test_broken_condition_sends_error_notification() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_string_contains("broken: failed to evaluate alarm state"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new();
    // arithmetic result where a boolean is required
    let alarm = harness.alarm("broken", "mean(temperature) + 1", 2).await;
    harness
        .webhook_output(&alarm, "ops", format!("{}/hook", server.uri()))
        .await;
    harness.write_minutes("temperature", &[20.0, 21.0]).await;

    let outcome = harness.runner().run_alarm(&alarm).await;

    assert_eq!(outcome, RunOutcome::Errored);
    assert_eq!(harness.metrics.counter(ALARM_NOTIFICATION_ERROR), 1);
    assert_eq!(harness.metrics.counter(ALARM_NOTIFICATION), 1);
    assert!(!harness.backend.get_alarm(alarm.id).await.unwrap().fired);
}

#[tokio::test]
async fn test_insufficient_data_is_silent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let harness = Harness::new();
    let alarm = harness.alarm("hot", "mean(temperature) > 30", 5).await;
    harness
        .webhook_output(&alarm, "ops", format!("{}/hook", server.uri()))
        .await;
    harness.write_minutes("temperature", &[35.0, 36.0]).await;

    let before = harness.backend.get_alarm(alarm.id).await.unwrap().last_run;
    let outcome = harness.runner().run_alarm(&alarm).await;

    assert_eq!(outcome, RunOutcome::Skipped);
    assert_eq!(harness.metrics.counter(ALARM_EVALUATE), 1);
    assert_eq!(harness.metrics.counter(ALARM_NOTIFICATION), 0);

    // last run still advances
    let after = harness.backend.get_alarm(alarm.id).await.unwrap().last_run;
    assert!(after >= before);
}

#[tokio::test]
async fn test_one_bad_alarm_does_not_stop_the_pass() {
    let harness = Harness::new();
    let broken = harness.alarm("broken", "mean(temperature) + 1", 2).await;
    let hot = harness.alarm("hot", "max(temperature) > 30", 2).await;
    harness.write_minutes("temperature", &[31.0, 32.0]).await;

    let summary = harness.runner().run_alarms(vec![broken.clone(), hot.clone()]).await;

    assert_eq!(
        summary.outcomes,
        vec![
            (broken.id, RunOutcome::Errored),
            (hot.id, RunOutcome::Fired)
        ]
    );
}

#[tokio::test]
async fn test_derivative_alarm_fires() {
    let harness = Harness::new();
    let alarm = harness
        .alarm("heating", "derivative(mean(temperature),60) > 4", 3)
        .await;

    let rising: Vec<f64> = (0..10).map(|i| 20.0 + 5.0 * i as f64).collect();
    harness.write_minutes("temperature", &rising).await;

    let outcome = harness.runner().run_alarm(&alarm).await;
    assert_eq!(outcome, RunOutcome::Fired);

    let history = harness
        .backend
        .load_history(alarm.id, HISTORY_PAGE)
        .await
        .unwrap();
    assert_eq!(history[0].value, "derivative_mean_temperature=5.00");
}

#[tokio::test]
async fn test_falling_derivative_does_not_fire() {
    let harness = Harness::new();
    let alarm = harness
        .alarm("heating", "derivative(mean(temperature),60) > 4", 3)
        .await;

    let falling: Vec<f64> = (0..10).map(|i| 80.0 - 5.0 * i as f64).collect();
    harness.write_minutes("temperature", &falling).await;

    assert_eq!(harness.runner().run_alarm(&alarm).await, RunOutcome::Unchanged);
}

#[tokio::test]
async fn test_moving_average_alarm_fires() {
    let harness = Harness::new();
    let alarm = harness
        .alarm("warm", "moving_average(mean(temperature),3) > 45", 3)
        .await;

    let rising: Vec<f64> = (0..10).map(|i| 20.0 + 5.0 * i as f64).collect();
    harness.write_minutes("temperature", &rising).await;

    let outcome = harness.runner().run_alarm(&alarm).await;
    assert_eq!(outcome, RunOutcome::Fired);

    let history = harness
        .backend
        .load_history(alarm.id, HISTORY_PAGE)
        .await
        .unwrap();
    assert_eq!(history[0].value, "moving_average_mean_temperature=60.00");
}

#[tokio::test]
async fn test_difference_alarm_fires() {
    let harness = Harness::new();
    let alarm = harness
        .alarm("steady", "difference(mean(temperature)) > -100000", 3)
        .await;
    harness
        .write_minutes("temperature", &[20.0, 21.0, 22.0, 23.0, 24.0])
        .await;

    assert_eq!(harness.runner().run_alarm(&alarm).await, RunOutcome::Fired);
}

#[tokio::test]
async fn test_missing_bucket_in_one_key_is_not_paired_across_minutes() {
    let harness = Harness::new();
    let alarm = harness
        .alarm("muggy", "mean(temperature) > 30 && mean(humidity) > 50", 3)
        .await;

    harness.write_minutes("temperature", &[35.0, 36.0, 37.0]).await;
    // humidity skips the middle minute
    harness.write_at("humidity", &[(2, 60.0), (0, 62.0)]).await;

    let outcome = harness.runner().run_alarm(&alarm).await;
    assert_eq!(outcome, RunOutcome::Skipped);
    assert!(!harness.backend.get_alarm(alarm.id).await.unwrap().fired);

    // once the gap is filled the window lines up and fires
    harness.write_at("humidity", &[(1, 61.0)]).await;
    assert_eq!(harness.runner().run_alarm(&alarm).await, RunOutcome::Fired);
}

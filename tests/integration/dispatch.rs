//! Per-output fault isolation during dispatch
//!
//! These tests verify that:
//! - A failing output does not keep later outputs from being attempted
//! - Every attempt is recorded with its outcome
//! - Disabled outputs are never pushed

use std::collections::BTreeMap;

use chrono::Utc;
use telemetry_alarms::AlarmEvent;
use telemetry_alarms::dispatcher::NotificationDispatcher;
use telemetry_alarms::storage::AlarmRepository;
use telemetry_alarms::{Output, OutputChannel};
use telemetry_alarms::notify::ChannelConfig;
use telemetry_alarms::notify::webhook::WebhookConfig;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_failing_output_does_not_block_others() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500).set_body_string("down"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/healthy"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new();
    let alarm = harness.alarm("hot", "mean(temperature) > 30", 1).await;
    let broken = harness
        .webhook_output(&alarm, "broken", format!("{}/broken", server.uri()))
        .await;
    let healthy = harness
        .webhook_output(&alarm, "healthy", format!("{}/healthy", server.uri()))
        .await;

    let dispatcher = NotificationDispatcher::new(harness.backend.clone(), reqwest::Client::new());
    let values = BTreeMap::from([("mean_temperature".to_string(), 31.0)]);
    let outcomes = dispatcher
        .dispatch(&alarm, AlarmEvent::Fire, &values, None, Utc::now())
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].output_id, broken.id);
    assert!(!outcomes[0].success);
    assert!(outcomes[0].message.contains("500"));
    assert_eq!(outcomes[1].output_id, healthy.id);
    assert!(outcomes[1].success);

    let broken_history = harness.backend.output_history(broken.id).await.unwrap();
    assert_eq!(broken_history.len(), 1);
    assert!(!broken_history[0].success);

    let healthy_history = harness.backend.output_history(healthy.id).await.unwrap();
    assert_eq!(healthy_history.len(), 1);
    assert!(healthy_history[0].success);
}

#[tokio::test]
async fn test_unreachable_output_is_recorded() {
    let harness = Harness::new();
    let alarm = harness.alarm("hot", "mean(temperature) > 30", 1).await;
    let output = harness
        .webhook_output(&alarm, "gone", "http://127.0.0.1:9/hook".to_string())
        .await;

    let dispatcher = NotificationDispatcher::new(harness.backend.clone(), reqwest::Client::new());
    let outcomes = dispatcher
        .dispatch(&alarm, AlarmEvent::Clear, &BTreeMap::new(), None, Utc::now())
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 1);
    assert!(!outcomes[0].success);

    let history = harness.backend.output_history(output.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
}

#[tokio::test]
async fn test_disabled_output_is_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let harness = Harness::new();
    let alarm = harness.alarm("hot", "mean(temperature) > 30", 1).await;

    let channel = OutputChannel::new(
        "owner-1",
        "muted",
        ChannelConfig::Webhook(WebhookConfig::new(format!("{}/hook", server.uri()))),
    );
    harness.backend.create_channel(channel.clone()).await.unwrap();
    let mut output = Output::new(alarm.id, "muted", channel);
    output.enabled = false;
    harness.backend.create_output(output).await.unwrap();

    let dispatcher = NotificationDispatcher::new(harness.backend.clone(), reqwest::Client::new());
    let outcomes = dispatcher
        .dispatch(&alarm, AlarmEvent::Fire, &BTreeMap::new(), None, Utc::now())
        .await
        .unwrap();

    assert!(outcomes.is_empty());
}

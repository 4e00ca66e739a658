//! End-to-end tests for device shadow request/response over MQTT.

mod helpers;

use helpers::{THING, TestHarness};
use serde_json::json;
use tw_mqtt_channel::{Channel, MqttError, ShadowClient};
use tw_protocol::topics;

#[tokio::test]
async fn e2e_report_then_get_round_trip() {
    let harness = TestHarness::new();
    let shadow = ShadowClient::new(harness.mqtt.as_ref(), THING);
    let get = topics::shadow_get(THING, None);
    harness.reply(
        &get,
        &topics::accepted(&get),
        &json!({"state": {"reported": {"firmware": "1.4.2"}}, "version": 7}),
    );

    shadow.report_state(json!({"firmware": "1.4.2"})).await.unwrap();
    let document = shadow.get(&harness.cancel).await.unwrap();

    let update = harness.mqtt.published_to(&topics::shadow_update(THING, None))[0].json();
    assert_eq!(update["state"]["reported"]["firmware"], "1.4.2");
    let document: serde_json::Value = serde_json::from_slice(&document).unwrap();
    assert_eq!(document["version"], 7);
    harness.assert_no_subscriptions();
}

#[tokio::test]
async fn e2e_get_missing_shadow_is_structured_failure() {
    let harness = TestHarness::new();
    let shadow = ShadowClient::named(harness.mqtt.as_ref(), THING, "config");
    let get = topics::shadow_get(THING, Some("config"));
    harness.reply(
        &get,
        &topics::rejected(&get),
        &json!({"code": 404, "message": "No shadow exists with name: 'config'", "clientToken": "c1"}),
    );

    let err = shadow.get(&harness.cancel).await.unwrap_err();

    match err {
        MqttError::Rejected(body) => {
            assert_eq!(body.status_code, 404);
            assert!(body.error_message.contains("config"));
        }
        other => panic!("unexpected error: {other}"),
    }
    // A late accept finds nobody listening.
    assert_eq!(harness.mqtt.inject(&topics::accepted(&get), b"{}"), 0);
    harness.assert_no_subscriptions();
}

#[tokio::test]
async fn e2e_update_verdicts_reach_change_subscription() {
    let harness = TestHarness::new();
    let shadow = ShadowClient::new(harness.mqtt.as_ref(), THING);
    let update = topics::shadow_update(THING, None);
    harness.reply(
        &update,
        &topics::rejected(&update),
        &json!({"code": 400, "message": "Missing required node: state"}),
    );

    let mut changes = shadow.subscribe_for_changes().await.unwrap();
    shadow.update(br#"{"desired":{}}"#).await.unwrap();

    let verdict = changes.rejected.recv().await.unwrap();
    assert_eq!(verdict.topic, topics::rejected(&update));
    assert!(changes.accepted.try_recv().is_none());

    shadow.unsubscribe_changes(changes).await.unwrap();
    harness.assert_no_subscriptions();
}

#[tokio::test]
async fn e2e_get_does_not_tear_down_a_watch_on_the_same_topic() {
    let harness = TestHarness::new();
    let get = topics::shadow_get(THING, None);
    let accepted = topics::accepted(&get);

    // An independent long-lived listener on the get reply topic.
    let mut watcher = harness
        .mqtt
        .subscribe(&accepted, rumqttc::QoS::AtLeastOnce)
        .await
        .unwrap();
    harness.reply(&get, &accepted, &json!({"state": {}}));

    ShadowClient::new(harness.mqtt.as_ref(), THING)
        .get(&harness.cancel)
        .await
        .unwrap();

    assert!(harness.mqtt.is_subscribed_to(&accepted));
    assert!(!harness.mqtt.unsubscribed().contains(&accepted));
    assert!(watcher.try_recv().is_some());
}

#[tokio::test]
async fn e2e_delete_publishes_empty_request() {
    let harness = TestHarness::new();
    let delete = topics::shadow_delete(THING, None);
    harness.reply(&delete, &topics::accepted(&delete), &json!({"version": 8}));

    ShadowClient::new(harness.mqtt.as_ref(), THING)
        .delete(&harness.cancel)
        .await
        .unwrap();

    let request = harness.mqtt.published_to(&delete);
    assert_eq!(request.len(), 1);
    assert_eq!(request[0].payload, b"{}");
    harness.assert_no_subscriptions();
}

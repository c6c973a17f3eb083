//! End-to-end pipeline behaviour with an in-memory middleware

use somiod_devkit::{HarnessBuilder, NotificationBuilder, TestHarness};
use somiod_reactor::config::ControlRule;
use somiod_reactor::{
    ControlError, ControlOutcome, ListenerError, Notification, PipelineEvent, SkipReason,
};

const APP: &str = "temp-sensor-001";
const CONTAINER: &str = "readings";

fn reading(harness: &TestHarness, name: &str, content: &str) {
    harness
        .mock
        .insert_content_instance(APP, CONTAINER, name, "application/xml", content);
}

fn outcomes(events: &[PipelineEvent]) -> Vec<&ControlOutcome> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Acted { outcome, .. } => Some(outcome),
            _ => None,
        })
        .collect()
}

fn archived(events: &[PipelineEvent]) -> Vec<&Notification> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Archived { notification, .. } => Some(notification),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn reading_above_threshold_sends_one_command() {
    let mut harness = TestHarness::new().unwrap();
    reading(&harness, "reading-1", "<temp>27.3</temp>");

    harness
        .send_notification(
            &NotificationBuilder::new()
                .resource("reading-1")
                .container("readings")
                .timestamp("2024-01-15T10:30:00"),
        )
        .await
        .unwrap();
    let events = harness.shutdown().await;

    let created = harness.mock.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].content, "<cmd>FAN_ON</cmd>");
    assert_eq!(created[0].content_type, "application/xml");
    assert_eq!(created[0].handle.application, APP);
    assert_eq!(created[0].handle.container, CONTAINER);
    assert!(created[0].handle.resource_name.starts_with("cmd-"));

    let acted = outcomes(&events);
    assert_eq!(acted.len(), 1);
    match acted[0] {
        ControlOutcome::Triggered { decision, .. } => {
            assert_eq!(decision.value, 27.3);
            assert_eq!(decision.action.as_deref(), Some("FAN_ON"));
        }
        other => panic!("expected a command, got {other:?}"),
    }

    let files = harness.archived_files();
    assert_eq!(files.len(), 1);
    let document: Notification =
        serde_json::from_str(&std::fs::read_to_string(&files[0]).unwrap()).unwrap();
    assert_eq!(document.resource_name, "reading-1");
    assert_eq!(document.timestamp, "2024-01-15T10:30:00");
}

#[tokio::test]
async fn readings_at_or_below_threshold_send_nothing() {
    let mut harness = TestHarness::new().unwrap();
    reading(&harness, "reading-1", "<temp>25</temp>");
    reading(&harness, "reading-2", "<temp>19.5</temp>");

    for name in ["reading-1", "reading-2"] {
        harness
            .send_notification(&NotificationBuilder::new().resource(name))
            .await
            .unwrap();
    }
    let events = harness.shutdown().await;

    assert!(harness.mock.created().is_empty());
    let acted = outcomes(&events);
    assert_eq!(acted.len(), 2);
    assert!(acted.iter().all(|o| matches!(o, ControlOutcome::Idle(_))));
}

#[tokio::test]
async fn highest_fired_rule_wins() {
    let mut harness = HarnessBuilder::new()
        .rules(vec![
            ControlRule { threshold: 25.0, action: "FAN_ON".into() },
            ControlRule { threshold: 35.0, action: "ALARM".into() },
        ])
        .build()
        .unwrap();
    reading(&harness, "reading-1", "<temp>40</temp>");

    harness
        .send_notification(&NotificationBuilder::new().resource("reading-1"))
        .await
        .unwrap();
    harness.shutdown().await;

    let created = harness.mock.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].content, "<cmd>ALARM</cmd>");
}

#[tokio::test]
async fn malformed_payload_is_dropped_and_processing_continues() {
    let mut harness = TestHarness::new().unwrap();
    reading(&harness, "reading-2", "<temp>30</temp>");

    harness.send_payload(b"{not json".to_vec()).await.unwrap();
    harness.send_payload(b"[1, 2, 3]".to_vec()).await.unwrap();
    harness
        .send_notification(&NotificationBuilder::new().resource("reading-2"))
        .await
        .unwrap();
    let events = harness.shutdown().await;

    let dropped = events
        .iter()
        .filter(|e| matches!(e, PipelineEvent::DecodeFailed { .. }))
        .count();
    assert_eq!(dropped, 2);
    assert_eq!(harness.archived_files().len(), 1);
    assert_eq!(harness.mock.created().len(), 1);
}

#[tokio::test]
async fn empty_resource_name_is_archived_but_never_fetched() {
    let mut harness = TestHarness::new().unwrap();

    harness
        .send_notification(&NotificationBuilder::new().without("resource_name"))
        .await
        .unwrap();
    let events = harness.shutdown().await;

    assert!(harness.mock.fetches().is_empty());
    assert!(harness.mock.created().is_empty());
    assert!(matches!(
        outcomes(&events).as_slice(),
        [ControlOutcome::Skipped(SkipReason::NoResourceName)]
    ));
    // decoded with an empty field and still archived
    assert_eq!(archived(&events).len(), 1);
    assert_eq!(harness.archived_files().len(), 1);
}

#[tokio::test]
async fn non_creation_events_and_own_commands_are_ignored() {
    let mut harness = TestHarness::new().unwrap();
    reading(&harness, "reading-1", "<temp>30</temp>");

    harness
        .send_notification(&NotificationBuilder::new().resource("reading-1").event_type("delete"))
        .await
        .unwrap();
    harness
        .send_notification(&NotificationBuilder::new().resource("cmd-1705314600000-abcd1234"))
        .await
        .unwrap();
    let events = harness.shutdown().await;

    assert!(harness.mock.fetches().is_empty());
    assert!(harness.mock.created().is_empty());
    let acted = outcomes(&events);
    assert!(matches!(acted[0], ControlOutcome::Skipped(SkipReason::NotCreation(_))));
    assert!(matches!(acted[1], ControlOutcome::Skipped(SkipReason::OwnCommand)));
    assert_eq!(harness.archived_files().len(), 2);
}

#[tokio::test]
async fn archive_failure_does_not_block_control() {
    let mut harness = HarnessBuilder::new().block_archive_root().build().unwrap();
    reading(&harness, "reading-1", "<temp>27.3</temp>");

    harness
        .send_notification(&NotificationBuilder::new().resource("reading-1"))
        .await
        .unwrap();
    let events = harness.shutdown().await;

    let report = events.iter().find_map(|e| match e {
        PipelineEvent::Archived { report, .. } => Some(report),
        _ => None,
    });
    let report = report.expect("archive branch reported");
    assert!(!report.persisted);
    assert!(!report.errors.is_empty());

    assert_eq!(harness.mock.created().len(), 1);
}

#[tokio::test]
async fn missing_schema_still_persists() {
    let mut harness = HarnessBuilder::new().without_schema().build().unwrap();

    harness.send_notification(&NotificationBuilder::new()).await.unwrap();
    let events = harness.shutdown().await;

    let report = events
        .iter()
        .find_map(|e| match e {
            PipelineEvent::Archived { report, .. } => Some(report),
            _ => None,
        })
        .expect("archive branch reported");
    assert!(report.persisted);
    assert!(!report.valid);
    assert_eq!(harness.archived_files().len(), 1);
}

#[tokio::test]
async fn fetch_failure_does_not_stop_later_notifications() {
    let mut harness = TestHarness::new().unwrap();
    reading(&harness, "reading-2", "<temp>28</temp>");

    // reading-1 is unknown to the middleware
    for name in ["reading-1", "reading-2"] {
        harness
            .send_notification(&NotificationBuilder::new().resource(name))
            .await
            .unwrap();
    }
    let events = harness.shutdown().await;

    let acted = outcomes(&events);
    assert_eq!(acted.len(), 2);
    match acted[0] {
        ControlOutcome::Failed(e) => {
            assert!(matches!(e, ControlError::Fetch(_)));
            assert_eq!(e.kind(), "fetch");
        }
        other => panic!("expected a fetch failure, got {other:?}"),
    }
    assert!(acted[1].is_triggered());
    assert_eq!(harness.mock.created().len(), 1);
}

#[tokio::test]
async fn command_submission_failure_is_reported() {
    let mut harness = TestHarness::new().unwrap();
    reading(&harness, "reading-1", "<temp>31</temp>");
    harness.mock.fail_creates(true);

    harness
        .send_notification(&NotificationBuilder::new().resource("reading-1"))
        .await
        .unwrap();
    let events = harness.shutdown().await;

    assert!(matches!(
        outcomes(&events).as_slice(),
        [ControlOutcome::Failed(ControlError::CommandSubmission(_))]
    ));
}

#[tokio::test]
async fn notifications_are_archived_in_arrival_order() {
    let mut harness = TestHarness::new().unwrap();

    let names: Vec<String> = (0..20).map(|i| format!("reading-{i}")).collect();
    for name in &names {
        harness
            .send_notification(&NotificationBuilder::new().resource(name))
            .await
            .unwrap();
    }
    let events = harness.shutdown().await;

    let order: Vec<&str> = archived(&events).iter().map(|n| n.resource_name.as_str()).collect();
    assert_eq!(order, names.iter().map(String::as_str).collect::<Vec<_>>());

    // file names sort in persistence order
    let files = harness.archived_files();
    assert_eq!(files.len(), names.len());
    for (file, name) in files.iter().zip(&names) {
        let document: Notification =
            serde_json::from_str(&std::fs::read_to_string(file).unwrap()).unwrap();
        assert_eq!(&document.resource_name, name);
    }
}

#[tokio::test]
async fn lost_connection_is_surfaced() {
    let mut harness = TestHarness::new().unwrap();

    harness.lose_connection("broker went away").await.unwrap();
    let event = harness.next_event(2000).await;

    match event {
        Some(PipelineEvent::ListenerLost(ListenerError::ConnectionLost(reason))) => {
            assert_eq!(reason, "broker went away")
        }
        other => panic!("expected a lost connection, got {other:?}"),
    }
    harness.shutdown().await;
}

#[tokio::test]
async fn manual_command_goes_to_configured_container() {
    let harness = TestHarness::new().unwrap();

    let target = harness.controller().send_command("FAN_OFF").await.unwrap();

    assert_eq!(target.application, APP);
    assert_eq!(target.container, CONTAINER);
    let created = harness.mock.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].content, "<cmd>FAN_OFF</cmd>");
}

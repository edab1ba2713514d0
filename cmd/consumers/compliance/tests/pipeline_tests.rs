mod support;

use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};

use compliance::{Outcome, PipelineError};
use support::{
    label_match, settings, EvaluatorFailure, Harness, RULE_SOURCE, STATUS_SUBJECT,
    VIOLATION_SUBJECT,
};

fn project_asset_event() -> Value {
    json!({
        "asset": {
            "name": "//x/projects/p1",
            "assetType": "t",
            "ancestors": ["projects/p1", "organizations/o1"],
            "resource": {"labels": {"owner": "alice"}}
        },
        "deleted": false
    })
}

#[tokio::test]
async fn compliant_asset_yields_one_status_and_no_violations() {
    let harness = Harness::new();

    let outcome = harness.handle(&project_asset_event()).await;
    assert!(matches!(outcome, Outcome::Done), "{outcome:?}");

    let statuses = harness.publisher.on(STATUS_SUBJECT);
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0]["assetName"], "//x/projects/p1");
    assert_eq!(statuses[0]["compliant"], true);
    assert_eq!(statuses[0]["deleted"], false);
    assert_eq!(statuses[0]["assetInventoryOrigin"], "real-time");
    assert_eq!(statuses[0]["assetInventoryTimestamp"], Value::Null);
    assert_eq!(statuses[0]["ruleName"], "instance_owner_label");
    assert!(harness.publisher.on(VIOLATION_SUBJECT).is_empty());

    let evaluated = harness.evaluator.evaluated();
    assert_eq!(evaluated.len(), 1);
    let asset = &evaluated[0];
    assert_eq!(asset.owner.as_deref(), Some("alice"));
    assert_eq!(asset.ancestors_display_name, vec!["Project p1", "Org o1"]);
    assert_eq!(asset.ancestry_path, "organization/o1/project/p1");
    assert_eq!(asset.ancestry_path_display_name, "Org o1/Project p1");
    assert_eq!(asset.project_id.as_deref(), Some("proj-p1"));
}

#[tokio::test]
async fn bare_and_tagged_feed_messages_are_equivalent() {
    let bare = Harness::new();
    let tagged = Harness::new();

    bare.handle(&project_asset_event()).await;
    tagged
        .handle(&json!({"kind": "feed", "payload": project_asset_event()}))
        .await;

    assert_eq!(bare.publisher.sent()[0].bytes, tagged.publisher.sent()[0].bytes);
}

#[tokio::test]
async fn violations_are_published_before_status() {
    let harness = Harness::new();
    harness.evaluator.answer(json!({
        "violations": [label_match("owner label missing"), label_match("owner label empty")]
    }));

    let outcome = harness.handle(&project_asset_event()).await;
    assert!(matches!(outcome, Outcome::Done));

    let sent = harness.publisher.sent();
    let subjects: Vec<&str> = sent.iter().map(|p| p.subject.as_str()).collect();
    assert_eq!(subjects, vec![VIOLATION_SUBJECT, VIOLATION_SUBJECT, STATUS_SUBJECT]);
    assert_eq!(sent[2].value["compliant"], false);

    let violation = &sent[0].value;
    assert_eq!(violation["nonCompliance"]["message"], "owner label missing");
    assert_eq!(violation["ruleSource"], RULE_SOURCE);
    assert_eq!(violation["functionConfig"]["functionName"], "instance_owner_label");
    assert_eq!(violation["constraintConfig"]["metadata"]["name"], "require-owner");

    let asset = &violation["feedMessage"]["asset"];
    assert_eq!(asset["assetType"], asset["asset_type"]);
    assert_eq!(asset["iamPolicy"], asset["iam_policy"]);
    assert_eq!(asset["ancestryPath"], asset["ancestry_path"]);
    assert_eq!(asset["ancestryPath"], "organization/o1/project/p1");
}

#[tokio::test]
async fn reprocessing_an_event_publishes_identical_bytes() {
    let harness = Harness::new();
    harness
        .evaluator
        .answer(json!({"violations": [label_match("owner label missing")]}));
    let mut event = project_asset_event();
    event["window"] = json!({"startTime": "2024-05-01T10:00:00Z"});
    event["stepStack"] = json!([{"stepId": "feed", "stepTimestamp": "2024-05-01T10:00:01Z"}]);

    harness.handle(&event).await;
    let first: Vec<Vec<u8>> = harness.publisher.sent().into_iter().map(|p| p.bytes).collect();
    harness.publisher.clear();
    harness.handle(&event).await;
    let second: Vec<Vec<u8>> = harness.publisher.sent().into_iter().map(|p| p.bytes).collect();

    assert_eq!(first.len(), 2);
    assert_eq!(first, second);
}

#[tokio::test]
async fn deleted_asset_is_compliant_regardless_of_policy() {
    let harness = Harness::new();
    harness
        .evaluator
        .answer(json!({"violations": [label_match("owner label missing")]}));

    let outcome = harness
        .handle(&json!({
            "asset": {"name": "//x/projects/p1", "assetType": "t"},
            "deleted": true,
            "origin": "batch-export",
            "window": {"startTime": "2024-05-01T10:00:00Z"}
        }))
        .await;
    assert!(matches!(outcome, Outcome::Done), "{outcome:?}");

    let sent = harness.publisher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, STATUS_SUBJECT);
    assert_eq!(sent[0].value["compliant"], true);
    assert_eq!(sent[0].value["deleted"], true);
    assert_eq!(sent[0].value["assetInventoryOrigin"], "batch-export");
    assert_eq!(sent[0].value["assetInventoryTimestamp"], "2024-05-01T10:00:00Z");
    assert!(harness.evaluator.evaluated().is_empty());
}

#[tokio::test]
async fn live_hierarchy_assets_are_cached_and_feed_later_deletions() {
    let harness = Harness::new();
    let project = json!({
        "asset": {
            "name": "//cloudresourcemanager.googleapis.com/projects/123",
            "assetType": "cloudresourcemanager.googleapis.com/Project",
            "ancestors": ["projects/123", "organizations/1"],
            "resource": {"data": {"name": "Payments", "projectId": "payments-prod"}}
        }
    });
    assert!(matches!(harness.handle(&project).await, Outcome::Done));
    assert_eq!(harness.cache.len().await, 1);

    // A later asset under the same project resolves its name from the cache.
    harness
        .handle(&json!({
            "asset": {
                "name": "//compute.googleapis.com/projects/payments-prod/instances/vm1",
                "assetType": "compute.googleapis.com/Instance",
                "ancestors": ["projects/123", "organizations/1"],
                "resource": {"data": {"labels": {"owner": "bob"}}}
            }
        }))
        .await;
    let evaluated = harness.evaluator.evaluated();
    assert_eq!(evaluated[1].ancestors_display_name, vec!["Payments", "Org 1"]);
    assert_eq!(evaluated[1].project_id.as_deref(), Some("payments-prod"));

    harness.publisher.clear();
    let outcome = harness
        .handle(&json!({
            "asset": {"name": "//cloudresourcemanager.googleapis.com/projects/123"},
            "deleted": true
        }))
        .await;
    assert!(matches!(outcome, Outcome::Done));
    let statuses = harness.publisher.on(STATUS_SUBJECT);
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0]["deleted"], true);
    assert_eq!(statuses[0]["compliant"], true);
}

#[tokio::test]
async fn deletion_without_cached_record_still_yields_a_verdict() {
    let harness = Harness::new();
    let outcome = harness
        .handle(&json!({"asset": {"name": "//x/unknown"}, "deleted": true}))
        .await;
    assert!(matches!(outcome, Outcome::Done));
    assert_eq!(harness.publisher.on(STATUS_SUBJECT).len(), 1);
}

#[tokio::test]
async fn malformed_and_empty_inputs_are_dropped() {
    let harness = Harness::new();

    let outcome = harness.pipeline.handle(b"{not json").await;
    assert!(matches!(outcome, Outcome::Aborted(PipelineError::MalformedInput(_))));

    let outcome = harness.handle(&json!({"asset": {"assetType": "t"}})).await;
    assert!(matches!(outcome, Outcome::Aborted(PipelineError::MalformedInput(_))));

    let outcome = harness
        .handle(&json!({"asset": {"name": "n", "assetType": "t", "resource": {}}}))
        .await;
    assert!(matches!(outcome, Outcome::Aborted(PipelineError::EmptyAsset { .. })));

    assert!(harness.publisher.sent().is_empty());
}

#[tokio::test]
async fn expired_events_are_dropped() {
    let harness = Harness::with_settings(compliance::PipelineSettings {
        max_event_age: Some(Duration::from_secs(600)),
        ..settings()
    });

    let mut stale = project_asset_event();
    stale["window"] = json!({"startTime": "2020-01-01T00:00:00Z"});
    let outcome = harness.handle(&stale).await;
    assert!(matches!(outcome, Outcome::Aborted(PipelineError::Expired { .. })));
    assert!(harness.publisher.sent().is_empty());

    let mut fresh = project_asset_event();
    fresh["window"] = json!({"startTime": Utc::now().to_rfc3339()});
    assert!(matches!(harness.handle(&fresh).await, Outcome::Done));
}

#[tokio::test]
async fn status_publish_failure_is_retried() {
    let harness = Harness::new();
    harness.publisher.reject_payloads_containing("assetInventoryOrigin");

    let outcome = harness.handle(&project_asset_event()).await;
    match outcome {
        Outcome::Failed(err) => assert!(matches!(err, PipelineError::Publish { .. })),
        other => panic!("expected retry, got {other:?}"),
    }
}

#[tokio::test]
async fn evaluator_errors_follow_their_classification() {
    let harness = Harness::new();
    harness.evaluator.fail_with(EvaluatorFailure::MissingRule);
    assert!(matches!(
        harness.handle(&project_asset_event()).await,
        Outcome::Aborted(PipelineError::RuleConfiguration(_))
    ));

    let harness = Harness::new();
    harness.evaluator.fail_with(EvaluatorFailure::TransientIo);
    assert!(matches!(
        harness.handle(&project_asset_event()).await,
        Outcome::Failed(PipelineError::Evaluation { retryable: true, .. })
    ));
    assert!(harness.publisher.sent().is_empty());
}

#[tokio::test]
async fn malformed_decision_result_is_dropped() {
    let harness = Harness::new();
    harness
        .evaluator
        .answer(json!({"violations": [{"violation": {"msg": "x"}}]}));
    assert!(matches!(
        harness.handle(&project_asset_event()).await,
        Outcome::Aborted(PipelineError::MalformedResult(_))
    ));
}

#[tokio::test]
async fn schedule_ticks_are_acknowledged() {
    let harness = Harness::new();
    assert!(matches!(
        harness.pipeline.handle(b"cron schedule */5 * * * *").await,
        Outcome::Done
    ));
    assert!(matches!(
        harness.handle(&json!({"kind": "schedule"})).await,
        Outcome::Done
    ));
    assert!(harness.publisher.sent().is_empty());
}

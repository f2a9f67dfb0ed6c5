use chrono::{Duration as ChronoDuration, Utc};
use futures::StreamExt;

use super::*;
use crate::schema::ModuleRuntimeDeployment;

fn deployed(name: &str, key: &str, age_secs: i64) -> Module {
    let mut module = Module::new(name);
    module.runtime.base.create_time = Utc::now() - ChronoDuration::seconds(age_secs);
    module.runtime.deployment = Some(ModuleRuntimeDeployment {
        deployment_key: key.to_string(),
        endpoint: None,
    });
    module
}

#[tokio::test]
async fn test_initial_snapshot_is_contiguous_block() {
    let source = SchemaEventSource::new();
    for name in ["a", "b", "c"] {
        source.upsert(deployed(name, &format!("dpl-{}", name), 10)).await;
    }

    let mut subscription = source.subscribe().await;
    assert_eq!(subscription.initial_len(), 3);

    let mut names = Vec::new();
    let mut flags = Vec::new();
    for _ in 0..3 {
        let event = subscription.next().await.unwrap();
        assert_eq!(event.change_type, ChangeType::Added);
        names.push(event.module_name);
        flags.push(event.more);
    }
    assert_eq!(names, vec!["a", "b", "c"]);
    assert_eq!(flags, vec![true, true, false]);
}

#[tokio::test]
async fn test_live_events_follow_snapshot() {
    let source = SchemaEventSource::new();
    source.upsert(deployed("a", "dpl-a-1", 10)).await;
    let mut subscription = source.subscribe().await;

    source.upsert(deployed("a", "dpl-a-2", 5)).await;
    source.upsert(deployed("b", "dpl-b-1", 5)).await;
    source.remove("a").await;

    let kinds: Vec<(ChangeType, String)> = {
        let mut out = Vec::new();
        for _ in 0..4 {
            let event = subscription.next().await.unwrap();
            out.push((event.change_type, event.module_name));
        }
        out
    };
    assert_eq!(
        kinds,
        vec![
            (ChangeType::Added, "a".to_string()),
            (ChangeType::Changed, "a".to_string()),
            (ChangeType::Added, "b".to_string()),
            (ChangeType::Removed, "a".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_older_deployment_is_ignored() {
    let source = SchemaEventSource::new();
    source.upsert(deployed("a", "dpl-a-new", 1)).await;
    let mut subscription = source.subscribe().await;
    subscription.next().await.unwrap();

    source.upsert(deployed("a", "dpl-a-old", 60)).await;

    let snapshot = source.snapshot().await;
    assert_eq!(snapshot[0].deployment_key(), Some("dpl-a-new"));
    let next = tokio::time::timeout(std::time::Duration::from_millis(50), subscription.next()).await;
    assert!(next.is_err());
}

#[tokio::test]
async fn test_same_create_time_breaks_tie_by_key() {
    let source = SchemaEventSource::new();
    let first = deployed("a", "dpl-a-b", 10);
    let mut lower = first.clone();
    lower.runtime.deployment = Some(ModuleRuntimeDeployment {
        deployment_key: "dpl-a-a".to_string(),
        endpoint: None,
    });
    let mut higher = first.clone();
    higher.runtime.deployment = Some(ModuleRuntimeDeployment {
        deployment_key: "dpl-a-c".to_string(),
        endpoint: None,
    });

    source.upsert(first).await;
    source.upsert(lower).await;
    assert_eq!(source.snapshot().await[0].deployment_key(), Some("dpl-a-b"));
    source.upsert(higher).await;
    assert_eq!(source.snapshot().await[0].deployment_key(), Some("dpl-a-c"));
}

#[tokio::test]
async fn test_removing_unknown_module_publishes_nothing() {
    let source = SchemaEventSource::new();
    let mut subscription = source.subscribe().await;

    source.remove("ghost").await;
    source.upsert(deployed("a", "dpl-a", 1)).await;

    let event = subscription.next().await.unwrap();
    assert_eq!(event.module_name, "a");
}

#[tokio::test]
async fn test_slow_subscriber_is_dropped_with_lagged() {
    let source = SchemaEventSource::new();
    let mut subscription = source.subscribe().await;

    for i in 0..(CHANNEL_CAPACITY + 10) {
        source.upsert(deployed("a", &format!("dpl-a-{:05}", i), 0)).await;
    }

    let mut lagged = false;
    for _ in 0..(CHANNEL_CAPACITY + 10) {
        match subscription.next().await {
            Err(SubscriptionError::Lagged(_)) => {
                lagged = true;
                break;
            }
            Ok(_) => continue,
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }
    assert!(lagged);
}

#[tokio::test]
async fn test_stream_ends_after_error() {
    let source = SchemaEventSource::new();
    source.upsert(deployed("a", "dpl-a", 1)).await;
    let subscription = source.subscribe().await;
    drop(source);

    let events: Vec<_> = subscription.into_stream().collect().await;
    assert_eq!(events.len(), 2);
    assert!(events[0].is_ok());
    assert!(matches!(events[1], Err(SubscriptionError::Closed)));
}

#[test]
fn test_event_wire_format() {
    let event = SchemaEvent::end_of_batch();
    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(
        value,
        serde_json::json!({
            "module_name": "",
            "more": false,
            "change_type": "unspecified",
            "module_removed": false
        })
    );
}

/// End-to-end fan-out completion: multiple responders answering one
/// broadcast, including a responder that starts late.
use sdp_fanout::bus::MemoryBus;
use sdp_fanout::engine::{run_source_query, run_source_query_sync};
use sdp_fanout::protocol::{Item, Query, QueryMethod, RecursionBehaviour};
use sdp_test_utils::{ResponderBehaviour, ResponderScript, ScriptedResponder};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

fn list_query(scope: &str) -> Query {
    Query {
        uuid: Uuid::nil(),
        item_type: "person".to_owned(),
        method: QueryMethod::List,
        query: String::new(),
        scope: scope.to_owned(),
        recursion_behaviour: RecursionBehaviour::default(),
        ignore_cache: false,
        deadline: None,
    }
}

fn person(scope: &str, name: &str) -> Item {
    let mut attributes = serde_json::Map::new();
    attributes.insert("name".to_owned(), serde_json::Value::String(name.to_owned()));
    Item {
        item_type: "person".to_owned(),
        unique_attribute: "name".to_owned(),
        attributes,
        scope: scope.to_owned(),
        source_query: None,
        linked_items: vec![],
        linked_item_queries: vec![],
    }
}

/// Three responders heartbeat, then all complete without items.  The sink
/// closes only after all three are terminal AND the start timeout has
/// elapsed, and progress reports exactly three completions.
#[tokio::test]
async fn three_responders_complete_cleanly() {
    let bus = MemoryBus::new();

    let mut responders = Vec::new();
    for name in ["resp-a", "resp-b", "resp-c"] {
        let script = ResponderScript {
            name: name.to_owned(),
            scopes: vec!["global".to_owned()],
            heartbeat_interval: Duration::from_millis(5),
            start_delay: Duration::ZERO,
            work_delay: Duration::from_millis(10),
            items: vec![],
            behaviour: ResponderBehaviour::Complete,
        };
        responders.push(ScriptedResponder::start(bus.clone(), script).await);
    }

    let start = Instant::now();
    let start_timeout = Duration::from_millis(80);
    let (sink, mut frames) = mpsc::channel(64);
    let handle = run_source_query(
        list_query("global"),
        start_timeout,
        Arc::new(bus.clone()),
        sink,
    )
    .await
    .expect("broadcast");

    assert!(frames.recv().await.is_none(), "no item frames expected");
    assert!(start.elapsed() >= start_timeout, "must not close before the start timeout");

    let progress = handle.progress();
    assert_eq!(progress.working, 0);
    assert_eq!(progress.stalled, 0);
    assert_eq!(progress.complete, 3);
    assert_eq!(progress.error, 0);
    assert_eq!(progress.cancelled, 0);
    assert_eq!(progress.responders, 3);
}

/// A fast responder finishes with one item while a second responder only
/// starts well after the first finished.  The start timeout keeps the query
/// open long enough for both items to arrive.
#[tokio::test]
async fn fast_finisher_with_slow_second_responder() {
    let bus = MemoryBus::new();

    let fast = ScriptedResponder::start(
        bus.clone(),
        ResponderScript {
            name: "fast".to_owned(),
            scopes: vec!["global".to_owned()],
            heartbeat_interval: Duration::from_millis(20),
            start_delay: Duration::ZERO,
            work_delay: Duration::from_millis(10),
            items: vec![person("global", "alice")],
            behaviour: ResponderBehaviour::Complete,
        },
    )
    .await;
    let slow = ScriptedResponder::start(
        bus.clone(),
        ResponderScript {
            name: "slow".to_owned(),
            scopes: vec!["global".to_owned()],
            heartbeat_interval: Duration::from_millis(20),
            start_delay: Duration::from_millis(60),
            work_delay: Duration::from_millis(30),
            items: vec![person("global", "bob")],
            behaviour: ResponderBehaviour::Complete,
        },
    )
    .await;

    let result = run_source_query_sync(
        list_query("global"),
        Duration::from_millis(200),
        Arc::new(bus.clone()),
    )
    .await
    .expect("query");

    assert_eq!(result.errors.len(), 0);
    let mut names: Vec<String> = result.items.iter().map(Item::globally_unique_name).collect();
    names.sort();
    assert_eq!(names, vec!["global.person.alice", "global.person.bob"]);

    drop(fast);
    drop(slow);
}

/// An erroring responder's query error reaches the caller and counts in
/// progress, alongside a successful responder's item.
#[tokio::test]
async fn mixed_success_and_error_responders() {
    let bus = MemoryBus::new();

    let _ok = ScriptedResponder::start(
        bus.clone(),
        ResponderScript {
            name: "ok".to_owned(),
            scopes: vec!["prod".to_owned()],
            heartbeat_interval: Duration::from_millis(10),
            start_delay: Duration::ZERO,
            work_delay: Duration::from_millis(5),
            items: vec![person("prod", "alice")],
            behaviour: ResponderBehaviour::Complete,
        },
    )
    .await;
    let _broken = ScriptedResponder::start(
        bus.clone(),
        ResponderScript {
            name: "broken".to_owned(),
            scopes: vec!["prod".to_owned()],
            heartbeat_interval: Duration::from_millis(10),
            start_delay: Duration::ZERO,
            work_delay: Duration::from_millis(5),
            items: vec![],
            behaviour: ResponderBehaviour::Error,
        },
    )
    .await;

    let result = run_source_query_sync(
        list_query("prod"),
        Duration::from_millis(80),
        Arc::new(bus.clone()),
    )
    .await
    .expect("query");

    assert_eq!(result.items.len(), 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].responder_name, "broken");
}

/// Scoped routing: a responder on another scope never hears the broadcast,
/// so only the matching responder contributes.
#[tokio::test]
async fn broadcast_reaches_only_matching_scopes() {
    let bus = MemoryBus::new();

    let _prod = ScriptedResponder::start(
        bus.clone(),
        ResponderScript {
            items: vec![person("prod", "alice")],
            work_delay: Duration::from_millis(5),
            ..ResponderScript::completing("prod-resp", "prod")
        },
    )
    .await;
    let _staging = ScriptedResponder::start(
        bus.clone(),
        ResponderScript {
            items: vec![person("staging", "mallory")],
            work_delay: Duration::from_millis(5),
            ..ResponderScript::completing("staging-resp", "staging")
        },
    )
    .await;

    let result = run_source_query_sync(
        list_query("prod"),
        Duration::from_millis(60),
        Arc::new(bus.clone()),
    )
    .await
    .expect("query");

    assert_eq!(result.items.len(), 1);
    assert_eq!(result.items[0].globally_unique_name(), "prod.person.alice");

    // The wildcard scope reaches both.
    let result = run_source_query_sync(
        list_query("*"),
        Duration::from_millis(60),
        Arc::new(bus.clone()),
    )
    .await
    .expect("wildcard query");
    assert_eq!(result.items.len(), 2);
}

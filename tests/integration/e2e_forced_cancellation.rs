/// Forced cancellation: a rogue responder heartbeats forever; the caller
/// cancels.  The cancel broadcast is observable on the bus, the tracker
/// reports the responder cancelled, and the sink closes.
use sdp_fanout::bus::{Bus, MemoryBus};
use sdp_fanout::engine::run_source_query;
use sdp_fanout::protocol::{CancelQuery, Query, QueryMethod, RecursionBehaviour};
use sdp_test_utils::{ResponderBehaviour, ResponderScript, ScriptedResponder};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

#[tokio::test]
async fn cancelling_a_rogue_responder_closes_the_run() {
    let bus = MemoryBus::new();
    let mut cancel_watch = bus.subscribe("cancel.scope.global").await.unwrap();

    let rogue = ScriptedResponder::start(
        bus.clone(),
        ResponderScript {
            name: "rogue".to_owned(),
            scopes: vec!["global".to_owned()],
            // Long interval: advertises a ~4.6s next-update, so it never
            // stalls within this test, it just keeps working.
            heartbeat_interval: Duration::from_secs(2),
            start_delay: Duration::ZERO,
            work_delay: Duration::ZERO,
            items: vec![],
            behaviour: ResponderBehaviour::KeepWorking,
        },
    )
    .await;

    let query = Query {
        uuid: Uuid::nil(),
        item_type: "person".to_owned(),
        method: QueryMethod::List,
        query: String::new(),
        scope: "global".to_owned(),
        recursion_behaviour: RecursionBehaviour::default(),
        ignore_cache: false,
        deadline: None,
    };
    let (sink, mut frames) = mpsc::channel(16);
    let handle = run_source_query(query, Duration::from_secs(10), Arc::new(bus.clone()), sink)
        .await
        .expect("broadcast");
    let query_uuid = handle.query_uuid();

    // Let the rogue's first heartbeat land so the tracker knows about it.
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(handle.progress().working, 1);

    handle.cancel();

    // The cancel frame goes out on the scope's cancel subject.
    let cancel_msg = tokio::time::timeout(Duration::from_secs(1), cancel_watch.recv())
        .await
        .expect("cancel within budget")
        .expect("cancel frame");
    let cancel: CancelQuery = serde_json::from_slice(&cancel_msg.payload).unwrap();
    assert_eq!(cancel.uuid, query_uuid);

    // The sink closes and the responder is reported cancelled.
    assert!(frames.recv().await.is_none());
    let progress = handle.progress();
    assert_eq!(progress.cancelled, 1);
    assert_eq!(progress.working, 0);
    assert_eq!(progress.responders, 1);

    drop(rogue);
}

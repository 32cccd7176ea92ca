/// Stall detection through a full query run: a responder that promises an
/// update and goes silent is reported STALLED, and a genuine frame from it
/// later reverts the stall.
use sdp_fanout::bus::{subjects, Bus, Headers, MemoryBus};
use sdp_fanout::engine::{coordinator::run_source_query_with_config, CoordinatorConfig};
use sdp_fanout::protocol::{
    Query, QueryMethod, QueryResponse, RecursionBehaviour, ResponderState, Response,
};
use std::sync::Arc;
use std::time::Duration;
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

async fn publish_response(bus: &MemoryBus, query_uuid: Uuid, response: Response) {
    bus.publish(
        &subjects::query_reply(query_uuid),
        Headers::new(),
        serde_json::to_vec(&QueryResponse::Response(response)).unwrap(),
    )
    .await
    .unwrap();
}

fn frame(state: ResponderState, next_update_in: Option<Duration>, query_uuid: Uuid) -> Response {
    Response {
        responder: "flaky".to_owned(),
        responder_uuid: Uuid::from_u128(77),
        state,
        next_update_in,
        query_uuid,
    }
}

#[tokio::test]
async fn silent_responder_stalls_then_recovers_on_completion() {
    let bus = MemoryBus::new();
    bus.ignore_no_responders(true);
    let (sink, mut frames) = mpsc::channel(16);

    // Long start timeout so the run stays open while we watch progress.
    let config = CoordinatorConfig {
        stall_check_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let handle = run_source_query_with_config(
        list_query("global"),
        Duration::from_millis(100),
        Arc::new(bus.clone()),
        sink,
        config,
    )
    .await
    .expect("broadcast");
    let query_uuid = handle.query_uuid();

    // WORKING with a 10ms promise, then silence.
    publish_response(
        &bus,
        query_uuid,
        frame(ResponderState::Working, Some(Duration::from_millis(10)), query_uuid),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    let progress = handle.progress();
    assert_eq!(progress.stalled, 1, "overdue responder must be reported stalled");
    assert_eq!(progress.working, 0);

    // The stalled responder comes back and completes: the stall clears.
    publish_response(&bus, query_uuid, frame(ResponderState::Complete, None, query_uuid)).await;

    assert!(frames.recv().await.is_none(), "run terminates once all responders settle");
    let progress = handle.progress();
    assert_eq!(progress.stalled, 0);
    assert_eq!(progress.complete, 1);
    assert_eq!(progress.responders, 1);
}

#[tokio::test]
async fn fully_stalled_query_still_terminates() {
    let bus = MemoryBus::new();
    bus.ignore_no_responders(true);
    let (sink, mut frames) = mpsc::channel(16);

    let config = CoordinatorConfig {
        stall_check_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let handle = run_source_query_with_config(
        list_query("global"),
        Duration::from_millis(40),
        Arc::new(bus.clone()),
        sink,
        config,
    )
    .await
    .expect("broadcast");
    let query_uuid = handle.query_uuid();

    publish_response(
        &bus,
        query_uuid,
        frame(ResponderState::Working, Some(Duration::from_millis(10)), query_uuid),
    )
    .await;

    // No further frames ever arrive; the stall tick alone must close the run.
    assert!(frames.recv().await.is_none());
    assert_eq!(handle.progress().stalled, 1);
}

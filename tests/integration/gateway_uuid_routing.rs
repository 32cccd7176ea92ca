/// Multiplexed UUID routing: two concurrent queries on one gateway client,
/// with the gateway interleaving their frames.  Each query must receive
/// exactly its own items.
use sdp_fanout::gateway::{GatewayClient, GatewayConfig};
use sdp_fanout::protocol::{
    GatewayRequest, GatewayResponse, Item, Query, QueryMethod, QueryState, QueryStatus,
    RecursionBehaviour,
};
use sdp_test_utils::MockGateway;
use uuid::Uuid;

fn get_query(scope: &str, target: &str) -> Query {
    Query {
        uuid: Uuid::nil(),
        item_type: "person".to_owned(),
        method: QueryMethod::Get,
        query: target.to_owned(),
        scope: scope.to_owned(),
        recursion_behaviour: RecursionBehaviour::default(),
        ignore_cache: false,
        deadline: None,
    }
}

fn item_for(source_query: Uuid, name: &str) -> Item {
    let mut attributes = serde_json::Map::new();
    attributes.insert("name".to_owned(), serde_json::Value::String(name.to_owned()));
    Item {
        item_type: "person".to_owned(),
        unique_attribute: "name".to_owned(),
        attributes,
        scope: "prod".to_owned(),
        source_query: Some(source_query),
        linked_items: vec![],
        linked_item_queries: vec![],
    }
}

async fn sent_query(gateway: &MockGateway) -> Query {
    match gateway.recv_request().await.expect("request") {
        GatewayRequest::Query(q) => q,
        other => panic!("expected query, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_queries_each_get_their_own_items() {
    let gateway = MockGateway::start().await.unwrap();
    let client = GatewayClient::connect(GatewayConfig::new(gateway.url())).await.unwrap();

    let client_a = client.clone();
    let task_a = tokio::spawn(async move { client_a.query(get_query("prod", "alice")).await });
    let qa = sent_query(&gateway).await;

    let client_b = client.clone();
    let task_b = tokio::spawn(async move { client_b.query(get_query("prod", "bob")).await });
    let qb = sent_query(&gateway).await;

    assert_ne!(qa.uuid, qb.uuid);

    // The gateway interleaves: B's item first, then A's, then A finishes
    // before B.
    gateway.send(&GatewayResponse::NewItem(item_for(qb.uuid, "bob"))).await;
    gateway.send(&GatewayResponse::NewItem(item_for(qa.uuid, "alice"))).await;
    gateway.send(&GatewayResponse::QueryStatus(QueryStatus {
        uuid: qa.uuid,
        status: QueryState::Finished,
    })).await;
    gateway.send(&GatewayResponse::QueryStatus(QueryStatus {
        uuid: qb.uuid,
        status: QueryState::Finished,
    })).await;

    let items_a = task_a.await.unwrap().unwrap();
    let items_b = task_b.await.unwrap().unwrap();

    assert_eq!(items_a.len(), 1);
    assert_eq!(items_a[0].globally_unique_name(), "prod.person.alice");
    assert_eq!(items_b.len(), 1);
    assert_eq!(items_b[0].globally_unique_name(), "prod.person.bob");

    // Both uuids are now finished: wait resolves immediately.
    client.wait(&[qa.uuid, qb.uuid]).await;
}

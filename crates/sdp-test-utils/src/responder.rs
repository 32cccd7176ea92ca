// responder: A scripted responder for end-to-end coordinator tests.
//
// Subscribes to the request subjects for its scopes on a MemoryBus and
// replays a configured behaviour for every query it accepts: heartbeat,
// publish items, then complete / error / go silent / keep working until
// cancelled.

use sdp_bus::{subjects, Bus, Headers, MemoryBus};
use sdp_engine::ResponseSender;
use sdp_protocol::{
    CancelQuery, Item, Query, QueryError, QueryErrorType, QueryResponse,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// What the responder does after publishing its items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderBehaviour {
    /// Finish with a COMPLETE frame.
    Complete,
    /// Publish a query error, then finish with an ERROR frame.
    Error,
    /// Go silent without a terminal frame — the tracker should notice.
    Stall,
    /// Heartbeat forever; acknowledge only a cancel broadcast.
    KeepWorking,
}

/// Configuration for one scripted responder.
#[derive(Debug, Clone)]
pub struct ResponderScript {
    pub name: String,
    /// Scopes this responder serves (it always also hears `request.all`).
    pub scopes: Vec<String>,
    pub heartbeat_interval: Duration,
    /// Delay before the responder starts working (and heartbeating) at all,
    /// as if it were slow to pick the query up.
    pub start_delay: Duration,
    /// Delay between starting and publishing results.
    pub work_delay: Duration,
    /// Items published for every accepted query (source_query is filled in).
    pub items: Vec<Item>,
    pub behaviour: ResponderBehaviour,
}

impl ResponderScript {
    /// A responder that immediately completes with no items.
    pub fn completing(name: &str, scope: &str) -> Self {
        Self {
            name: name.to_owned(),
            scopes: vec![scope.to_owned()],
            heartbeat_interval: Duration::from_millis(50),
            start_delay: Duration::ZERO,
            work_delay: Duration::ZERO,
            items: vec![],
            behaviour: ResponderBehaviour::Complete,
        }
    }
}

/// A running scripted responder.  Dropping it (or calling `stop`) detaches
/// it from the bus.
pub struct ScriptedResponder {
    pub responder_uuid: Uuid,
    task: tokio::task::JoinHandle<()>,
}

impl ScriptedResponder {
    /// Subscribe and start answering queries.  Returns once the
    /// subscriptions are live, so a broadcast published after this call is
    /// guaranteed to be heard.
    pub async fn start(bus: MemoryBus, script: ResponderScript) -> Self {
        let responder_uuid = Uuid::new_v4();
        let mut request_sub = bus.subscribe("request.>").await.expect("subscribe requests");
        let mut cancel_sub = bus.subscribe("cancel.>").await.expect("subscribe cancels");

        let task = tokio::spawn(async move {
            // Cancel signals per in-flight query uuid.
            let cancels: Arc<Mutex<HashMap<Uuid, watch::Sender<bool>>>> =
                Arc::new(Mutex::new(HashMap::new()));
            let accepted: Vec<String> =
                script.scopes.iter().map(|s| subjects::request_subject(s)).collect();

            loop {
                tokio::select! {
                    msg = request_sub.recv() => {
                        let Some(msg) = msg else { break };
                        if msg.subject != subjects::REQUEST_ALL
                            && !accepted.contains(&msg.subject)
                        {
                            continue;
                        }
                        let Ok(query) = serde_json::from_slice::<Query>(&msg.payload) else {
                            continue;
                        };
                        let reply_subject = msg
                            .reply
                            .unwrap_or_else(|| subjects::query_reply(query.uuid));

                        let (cancel_tx, cancel_rx) = watch::channel(false);
                        cancels.lock().unwrap().insert(query.uuid, cancel_tx);
                        tokio::spawn(work_query(
                            bus.clone(),
                            script.clone(),
                            responder_uuid,
                            query,
                            reply_subject,
                            cancel_rx,
                        ));
                    }
                    msg = cancel_sub.recv() => {
                        let Some(msg) = msg else { break };
                        let Ok(cancel) = serde_json::from_slice::<CancelQuery>(&msg.payload) else {
                            continue;
                        };
                        if let Some(tx) = cancels.lock().unwrap().remove(&cancel.uuid) {
                            debug!(query = %cancel.uuid, "responder saw cancel");
                            let _ = tx.send(true);
                        }
                    }
                }
            }
        });

        Self { responder_uuid, task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ScriptedResponder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Work one accepted query to its scripted conclusion.
async fn work_query(
    bus: MemoryBus,
    script: ResponderScript,
    responder_uuid: Uuid,
    query: Query,
    reply_subject: String,
    mut cancel_rx: watch::Receiver<bool>,
) {
    if !script.start_delay.is_zero() {
        tokio::time::sleep(script.start_delay).await;
    }
    let sender = ResponseSender::start_with_interval(
        Some(Arc::new(bus.clone()) as Arc<dyn Bus>),
        reply_subject.clone(),
        script.name.clone(),
        responder_uuid,
        query.uuid,
        script.heartbeat_interval,
    );

    if !script.work_delay.is_zero() {
        tokio::time::sleep(script.work_delay).await;
    }

    for template in &script.items {
        let mut item = template.clone();
        item.source_query = Some(query.uuid);
        publish_frame(&bus, &reply_subject, &QueryResponse::NewItem(item)).await;
    }

    match script.behaviour {
        ResponderBehaviour::Complete => sender.done().await,
        ResponderBehaviour::Error => {
            let error = QueryError {
                uuid: query.uuid,
                error_type: QueryErrorType::Other,
                error_string: format!("{} failed the query", script.name),
                scope: query.scope.clone(),
                source_name: script.name.clone(),
                item_type: query.item_type.clone(),
                responder_name: script.name.clone(),
            };
            publish_frame(&bus, &reply_subject, &QueryResponse::Error(error)).await;
            sender.error().await;
        }
        ResponderBehaviour::Stall => sender.kill().await,
        ResponderBehaviour::KeepWorking => {
            // Heartbeat until the cancel broadcast arrives.
            let _ = cancel_rx.changed().await;
            sender.cancel().await;
        }
    }
}

async fn publish_frame(bus: &MemoryBus, subject: &str, frame: &QueryResponse) {
    if let Ok(payload) = serde_json::to_vec(frame) {
        let _ = bus.publish(subject, Headers::new(), payload).await;
    }
}

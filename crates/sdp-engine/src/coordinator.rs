//! Query coordinator: owns one in-flight logical query.
//!
//! `run_source_query` broadcasts the query on its scope subject, subscribes
//! to the reply subject, and spawns a single coordinator task that:
//! - forwards items (plus their synthesised edges), edges, and errors to the
//!   caller's sink,
//! - feeds responder heartbeats into the tracker,
//! - decides termination: all responders terminal-or-stalled AND the start
//!   timeout has elapsed,
//! - on cancellation broadcasts a cancel frame and marks working responders
//!   cancelled locally, without waiting for acks.
//!
//! The sink is closed exactly once, by dropping the sender at cleanup; no
//! payload is emitted after cleanup begins.  The caller owns draining the
//! sink and must size its buffer for the result volume it expects — the
//! loop performs one blocking sink-send per forwarded payload.

use crate::tracker::{Progress, ResponderTracker};
use crate::EngineError;
use sdp_bus::{subjects, Bus, Headers, Subscription, TraceContext};
use sdp_protocol::{CancelQuery, Edge, Item, Query, QueryError, QueryResponse, Reference};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

/// Cadence of the periodic all-done check.  This guards the case where every
/// responder stalled silently and no inbound frame will ever arrive to drive
/// the termination decision.
pub const DEFAULT_STALL_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Budget for the cancel broadcast, detached from the caller's own
/// cancellation so the frame still goes out.
pub const DEFAULT_CANCEL_PUBLISH_BUDGET: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub stall_check_interval: Duration,
    pub cancel_publish_budget: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            stall_check_interval: DEFAULT_STALL_CHECK_INTERVAL,
            cancel_publish_budget: DEFAULT_CANCEL_PUBLISH_BUDGET,
        }
    }
}

/// One typed frame on the caller's sink.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryFrame {
    Item(Item),
    Edge(Edge),
    Error(QueryError),
}

/// Caller-facing handle for a live (or finished) query run.
///
/// `progress()` keeps returning the final counts after the run ends;
/// `cancel()` becomes a no-op.
pub struct QueryRunHandle {
    query_uuid: Uuid,
    cancel: watch::Sender<bool>,
    tracker: Arc<Mutex<ResponderTracker>>,
}

impl QueryRunHandle {
    /// The uuid the query was broadcast under (freshly assigned when the
    /// caller left it nil).
    pub fn query_uuid(&self) -> Uuid {
        self.query_uuid
    }

    /// Cancel the fan-out: broadcast a cancel frame, mark working responders
    /// cancelled, close the sink.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Current responder counts.
    pub fn progress(&self) -> Progress {
        self.tracker.lock().unwrap().progress()
    }
}

/// Broadcast `query` and stream its results into `sink`.
///
/// Fails synchronously on validation errors and on the initial broadcast
/// publish; the reply subscription is torn down before returning an error.
pub async fn run_source_query(
    query: Query,
    start_timeout: Duration,
    bus: Arc<dyn Bus>,
    sink: mpsc::Sender<QueryFrame>,
) -> Result<QueryRunHandle, EngineError> {
    run_source_query_with_config(query, start_timeout, bus, sink, CoordinatorConfig::default())
        .await
}

pub async fn run_source_query_with_config(
    mut query: Query,
    start_timeout: Duration,
    bus: Arc<dyn Bus>,
    sink: mpsc::Sender<QueryFrame>,
    config: CoordinatorConfig,
) -> Result<QueryRunHandle, EngineError> {
    if start_timeout.is_zero() {
        return Err(EngineError::ZeroStartTimeout);
    }
    if query.uuid.is_nil() {
        query.uuid = Uuid::new_v4();
    }
    query.validate()?;

    let reply_subject = subjects::query_reply(query.uuid);
    let subscription = bus.subscribe(&reply_subject).await?;

    let mut headers = Headers::new();
    sdp_bus::inject_trace_context(&TraceContext::new(), &mut headers);
    let payload = serde_json::to_vec(&query).map_err(|e| {
        EngineError::Bus(sdp_bus::BusError::Transport(format!("encode query: {e}")))
    })?;
    let broadcast_subject = subjects::request_subject(&query.scope);
    if let Err(e) = bus
        .publish_request(&broadcast_subject, &reply_subject, headers, payload)
        .await
    {
        subscription.unsubscribe();
        return Err(e.into());
    }
    debug!(query = %query.uuid, subject = %broadcast_subject, "query broadcast");

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let tracker = Arc::new(Mutex::new(ResponderTracker::new()));

    let handle = QueryRunHandle {
        query_uuid: query.uuid,
        cancel: cancel_tx,
        tracker: Arc::clone(&tracker),
    };

    tokio::spawn(coordinator_loop(
        query,
        start_timeout,
        config,
        bus,
        subscription,
        sink,
        tracker,
        cancel_rx,
    ));

    Ok(handle)
}

/// The single coordinator task: a select over the four event sources.
#[allow(clippy::too_many_arguments)]
async fn coordinator_loop(
    query: Query,
    start_timeout: Duration,
    config: CoordinatorConfig,
    bus: Arc<dyn Bus>,
    mut subscription: Subscription,
    sink: mpsc::Sender<QueryFrame>,
    tracker: Arc<Mutex<ResponderTracker>>,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let start_deadline = tokio::time::sleep(start_timeout);
    tokio::pin!(start_deadline);
    let mut start_timeout_elapsed = false;
    // True while the handle is alive; a dropped handle leaves the run going.
    let mut cancel_alive = true;

    let mut stall_ticker = tokio::time::interval(config.stall_check_interval);
    stall_ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            changed = cancel_rx.changed(), if cancel_alive => {
                match changed {
                    Ok(()) if *cancel_rx.borrow() => {
                        broadcast_cancel(bus.as_ref(), &query, &config).await;
                        tracker.lock().unwrap().mark_working_cancelled();
                        break;
                    }
                    Ok(()) => {}
                    Err(_) => cancel_alive = false,
                }
            }
            msg = subscription.recv() => {
                let Some(msg) = msg else {
                    warn!(query = %query.uuid, "reply subscription ended early");
                    break;
                };
                match handle_frame(&query, &msg.payload, &sink, &tracker).await {
                    FrameOutcome::Continue => {}
                    FrameOutcome::SinkClosed => {
                        debug!(query = %query.uuid, "caller went away, ending query run");
                        break;
                    }
                    FrameOutcome::AllDone => {
                        if start_timeout_elapsed {
                            break;
                        }
                    }
                }
            }
            _ = &mut start_deadline, if !start_timeout_elapsed => {
                start_timeout_elapsed = true;
                if tracker.lock().unwrap().all_done() {
                    break;
                }
            }
            _ = stall_ticker.tick() => {
                if start_timeout_elapsed && tracker.lock().unwrap().all_done() {
                    break;
                }
            }
        }
    }

    // Cleanup: runs exactly once, after which nothing touches the sink.
    subscription.unsubscribe();
    drop(sink);
    debug!(query = %query.uuid, progress = %tracker.lock().unwrap().progress(), "query run finished");
}

enum FrameOutcome {
    Continue,
    /// The caller dropped its end of the sink.
    SinkClosed,
    /// A responder frame tipped the tracker into all-done.
    AllDone,
}

async fn handle_frame(
    query: &Query,
    payload: &[u8],
    sink: &mpsc::Sender<QueryFrame>,
    tracker: &Arc<Mutex<ResponderTracker>>,
) -> FrameOutcome {
    let frame = match serde_json::from_slice::<QueryResponse>(payload) {
        Ok(frame) => frame,
        Err(e) => {
            // One bad frame must not poison the query.
            warn!(query = %query.uuid, error = %e, "dropping malformed reply frame");
            return FrameOutcome::Continue;
        }
    };

    match frame {
        QueryResponse::NewItem(item) => {
            if let Err(e) = item.validate() {
                warn!(query = %query.uuid, error = %e, "dropping invalid item");
                return FrameOutcome::Continue;
            }
            let edges = synthesize_edges(&item);
            if sink.send(QueryFrame::Item(item)).await.is_err() {
                return FrameOutcome::SinkClosed;
            }
            for edge in edges {
                if sink.send(QueryFrame::Edge(edge)).await.is_err() {
                    return FrameOutcome::SinkClosed;
                }
            }
            FrameOutcome::Continue
        }
        QueryResponse::NewEdge(edge) => {
            if sink.send(QueryFrame::Edge(edge)).await.is_err() {
                return FrameOutcome::SinkClosed;
            }
            FrameOutcome::Continue
        }
        QueryResponse::Error(error) => {
            if sink.send(QueryFrame::Error(error)).await.is_err() {
                return FrameOutcome::SinkClosed;
            }
            FrameOutcome::Continue
        }
        QueryResponse::Response(response) => {
            let mut tracker = tracker.lock().unwrap();
            if let Err(e) = tracker.observe(response) {
                warn!(
                    query = %query.uuid,
                    responder = %e.responder,
                    responder_uuid = %e.responder_uuid,
                    stored = ?e.stored,
                    attempted = ?e.attempted,
                    "rejected out-of-order response"
                );
                return FrameOutcome::Continue;
            }
            if tracker.all_done() {
                FrameOutcome::AllDone
            } else {
                FrameOutcome::Continue
            }
        }
    }
}

/// Items arrive with embedded links; downstream consumers expect explicit
/// edges, so each link becomes an edge from the item itself.  Linked-item
/// queries produce an edge to the reference the query would resolve to.
fn synthesize_edges(item: &Item) -> Vec<Edge> {
    let from = item.reference();
    let mut edges = Vec::with_capacity(item.linked_items.len() + item.linked_item_queries.len());
    for linked in &item.linked_items {
        edges.push(Edge {
            from: from.clone(),
            to: linked.item.clone(),
            blast_propagation: linked.blast_propagation,
        });
    }
    for linked_query in &item.linked_item_queries {
        edges.push(Edge {
            from: from.clone(),
            to: Reference {
                item_type: linked_query.query.item_type.clone(),
                unique_attribute_value: linked_query.query.query.clone(),
                scope: linked_query.query.scope.clone(),
            },
            blast_propagation: linked_query.blast_propagation,
        });
    }
    edges
}

/// Publish the cancel frame under its own budget.  Failures are logged, not
/// surfaced — cleanup continues regardless.
async fn broadcast_cancel(bus: &dyn Bus, query: &Query, config: &CoordinatorConfig) {
    let subject = subjects::cancel_subject(&query.scope);
    let Ok(payload) = serde_json::to_vec(&CancelQuery { uuid: query.uuid }) else {
        return;
    };
    let mut headers = Headers::new();
    sdp_bus::inject_trace_context(&TraceContext::new(), &mut headers);
    match tokio::time::timeout(
        config.cancel_publish_budget,
        bus.publish(&subject, headers, payload),
    )
    .await
    {
        Ok(Ok(())) => debug!(query = %query.uuid, subject = %subject, "cancel broadcast"),
        Ok(Err(e)) => warn!(query = %query.uuid, error = %e, "cancel publish failed"),
        Err(_) => warn!(query = %query.uuid, "cancel publish timed out"),
    }
}

// ---------------------------------------------------------------------------
// Synchronous convenience
// ---------------------------------------------------------------------------

/// Results of a fully-drained query run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncQueryResult {
    pub items: Vec<Item>,
    pub edges: Vec<Edge>,
    /// Per-responder errors; these do not fail the call.
    pub errors: Vec<QueryError>,
}

/// Run a query and collect everything until the sink closes.
///
/// Communication errors are returned; per-responder errors land in
/// [`SyncQueryResult::errors`].
pub async fn run_source_query_sync(
    query: Query,
    start_timeout: Duration,
    bus: Arc<dyn Bus>,
) -> Result<SyncQueryResult, EngineError> {
    let (sink, mut frames) = mpsc::channel(1024);
    let handle = run_source_query(query, start_timeout, bus, sink).await?;

    let mut result = SyncQueryResult::default();
    while let Some(frame) = frames.recv().await {
        match frame {
            QueryFrame::Item(item) => result.items.push(item),
            QueryFrame::Edge(edge) => result.edges.push(edge),
            QueryFrame::Error(error) => result.errors.push(error),
        }
    }
    drop(handle);
    Ok(result)
}

//! The gateway client proper: connection, reader task, correlation routing.
//!
//! Locking protocol: routing a frame to an in-flight request sends on its
//! channel while holding the in-flight map's read lock; `abort` takes the
//! write lock to drain the map, so closure can never race a send.  The
//! writer half lives behind its own async mutex.

use crate::{GatewayConfig, GatewayError, GatewayMessageHandler};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sdp_protocol::{
    CancelQuery, ChatMessage, GatewayRequest, GatewayResponse, Item, LoadBookmark, LoadSnapshot,
    Query, QueryErrorType, QueryState, StoreBookmark, StoreSnapshot,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tracing::{debug, warn};
use uuid::Uuid;

/// Header requesting non-interactive gateway behaviour.
pub const INTERACTIVE_HEADER: &str = "X-overmind-interactive";

/// Per-frame cap on the stream.  The transport default would be far too
/// small for large attribute bundles; anything up to 16 MiB is admitted.
const MAX_FRAME_BYTES: usize = 16 << 20;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct ClientInner {
    writer: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    /// Live requests: correlation UUID -> channel to the awaiting caller.
    in_flight: RwLock<HashMap<Uuid, mpsc::UnboundedSender<GatewayResponse>>>,
    /// UUIDs that have reached a terminal status (or were torn down by abort).
    finished: Mutex<HashSet<Uuid>>,
    finished_notify: Notify,
    closed: AtomicBool,
    /// First error observed on the transport; handed to late callers.
    close_error: Mutex<Option<GatewayError>>,
    handler: Option<Arc<dyn GatewayMessageHandler>>,
}

/// A multiplexing client over one persistent gateway stream.
///
/// Cheap to clone; clones share the connection and its in-flight requests.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<ClientInner>,
}

impl GatewayClient {
    /// Connect without a frame observer.
    pub async fn connect(config: GatewayConfig) -> Result<Self, GatewayError> {
        Self::connect_with_handler(config, None).await
    }

    /// Connect, optionally installing an observer that sees every inbound
    /// frame before it is routed.
    pub async fn connect_with_handler(
        config: GatewayConfig,
        handler: Option<Arc<dyn GatewayMessageHandler>>,
    ) -> Result<Self, GatewayError> {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;

        let mut request = config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| GatewayError::Connect(format!("invalid URL '{}': {}", config.url, e)))?;
        if let Some(token) = &config.token {
            let value = format!("Bearer {token}")
                .parse()
                .map_err(|_| GatewayError::Connect("invalid auth header".to_owned()))?;
            request.headers_mut().insert("Authorization", value);
        }
        if !config.interactive {
            request.headers_mut().insert(
                INTERACTIVE_HEADER,
                "false".parse().expect("static header value"),
            );
        }

        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(MAX_FRAME_BYTES))
            .max_frame_size(Some(MAX_FRAME_BYTES));
        let (ws, _response) =
            tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false)
                .await
                .map_err(|e| GatewayError::Connect(e.to_string()))?;
        let (write, read) = ws.split();

        let inner = Arc::new(ClientInner {
            writer: tokio::sync::Mutex::new(write),
            in_flight: RwLock::new(HashMap::new()),
            finished: Mutex::new(HashSet::new()),
            finished_notify: Notify::new(),
            closed: AtomicBool::new(false),
            close_error: Mutex::new(None),
            handler,
        });
        tokio::spawn(read_loop(Arc::clone(&inner), read));

        Ok(Self { inner })
    }

    /// True once the client has been closed or aborted.
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// User-initiated shutdown: a best-effort close frame, then a no-error
    /// abort that unblocks every waiter.
    pub async fn close(&self) {
        {
            let mut writer = self.inner.writer.lock().await;
            let _ = writer.send(Message::Close(None)).await;
        }
        self.inner.abort(None);
    }

    // -----------------------------------------------------------------------
    // Query
    // -----------------------------------------------------------------------

    /// Run one query to completion, returning the items it produced.
    ///
    /// `NOTFOUND` errors are ignored (the mapping succeeded trivially);
    /// other query errors are remembered and surfaced only if the query
    /// ends `ERRORED` without producing any item.  Dropping the returned
    /// future (e.g. under a timeout) cleans up the in-flight entry.
    pub async fn query(&self, mut query: Query) -> Result<Vec<Item>, GatewayError> {
        if query.uuid.is_nil() {
            query.uuid = Uuid::new_v4();
        }
        query.validate()?;

        let mut rx = self.inner.register(query.uuid)?;
        let _guard = InFlightGuard { inner: Arc::clone(&self.inner), uuid: query.uuid };
        self.send(&GatewayRequest::Query(query.clone())).await?;

        let mut items = Vec::new();
        let mut last_error: Option<GatewayError> = None;
        loop {
            let Some(frame) = rx.recv().await else {
                // Channel closed: the client aborted underneath us.
                return Err(self.inner.close_reason());
            };
            match frame {
                GatewayResponse::NewItem(item) => items.push(item),
                GatewayResponse::QueryError(e) => match e.error_type {
                    QueryErrorType::NotFound => {}
                    QueryErrorType::NoScope | QueryErrorType::Timeout | QueryErrorType::Other => {
                        last_error = Some(GatewayError::QueryErrored(e.to_string()));
                    }
                },
                GatewayResponse::QueryStatus(status) => match status.status {
                    QueryState::Started => {}
                    QueryState::Finished => return Ok(items),
                    QueryState::Cancelled => return Err(GatewayError::QueryCancelled),
                    QueryState::Errored => {
                        if items.is_empty() {
                            return Err(last_error.unwrap_or_else(|| {
                                GatewayError::QueryErrored("no detail provided".to_owned())
                            }));
                        }
                        // Partial results beat no results.
                        return Ok(items);
                    }
                },
                // Progress frames (responder status etc.) just keep us alive.
                _ => {}
            }
        }
    }

    /// Ask the gateway to cancel a running query.
    pub async fn cancel_query(&self, uuid: Uuid) -> Result<(), GatewayError> {
        self.send(&GatewayRequest::CancelQuery(CancelQuery { uuid })).await
    }

    /// Block until every listed uuid has reached a terminal status.  Returns
    /// immediately once the client closes — there is nothing left to wait
    /// for at that point.
    pub async fn wait(&self, uuids: &[Uuid]) {
        loop {
            let notified = self.inner.finished_notify.notified();
            {
                if self.inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                let finished = self.inner.finished.lock().unwrap();
                if uuids.iter().all(|u| finished.contains(u)) {
                    return;
                }
            }
            notified.await;
        }
    }

    // -----------------------------------------------------------------------
    // Request/response pairs
    // -----------------------------------------------------------------------

    /// Store a snapshot; returns the UUID the gateway assigned it.
    pub async fn store_snapshot(
        &self,
        name: &str,
        description: &str,
    ) -> Result<Uuid, GatewayError> {
        let msg_id = Uuid::new_v4();
        let request = GatewayRequest::StoreSnapshot(StoreSnapshot {
            msg_id,
            name: name.to_owned(),
            description: description.to_owned(),
        });
        let mut rx = self.inner.register(msg_id)?;
        let _guard = InFlightGuard { inner: Arc::clone(&self.inner), uuid: msg_id };
        self.send(&request).await?;

        loop {
            let Some(frame) = rx.recv().await else {
                return Err(self.inner.close_reason());
            };
            if let GatewayResponse::SnapshotStoreResult(result) = frame {
                if result.success {
                    return Ok(result.snapshot_uuid.unwrap_or_default());
                }
                return Err(GatewayError::Remote(result.error_message));
            }
        }
    }

    /// Load a snapshot by UUID.
    pub async fn load_snapshot(&self, uuid: Uuid) -> Result<(), GatewayError> {
        let msg_id = Uuid::new_v4();
        let request = GatewayRequest::LoadSnapshot(LoadSnapshot { msg_id, uuid });
        let mut rx = self.inner.register(msg_id)?;
        let _guard = InFlightGuard { inner: Arc::clone(&self.inner), uuid: msg_id };
        self.send(&request).await?;

        loop {
            let Some(frame) = rx.recv().await else {
                return Err(self.inner.close_reason());
            };
            if let GatewayResponse::SnapshotLoadResult(result) = frame {
                if result.success {
                    return Ok(());
                }
                return Err(GatewayError::Remote(result.error_message));
            }
        }
    }

    /// Store a bookmark; returns the UUID the gateway assigned it.
    pub async fn store_bookmark(
        &self,
        name: &str,
        description: &str,
    ) -> Result<Uuid, GatewayError> {
        let msg_id = Uuid::new_v4();
        let request = GatewayRequest::StoreBookmark(StoreBookmark {
            msg_id,
            name: name.to_owned(),
            description: description.to_owned(),
        });
        let mut rx = self.inner.register(msg_id)?;
        let _guard = InFlightGuard { inner: Arc::clone(&self.inner), uuid: msg_id };
        self.send(&request).await?;

        loop {
            let Some(frame) = rx.recv().await else {
                return Err(self.inner.close_reason());
            };
            if let GatewayResponse::BookmarkStoreResult(result) = frame {
                if result.success {
                    return Ok(result.bookmark_uuid.unwrap_or_default());
                }
                return Err(GatewayError::Remote(result.error_message));
            }
        }
    }

    /// Load a bookmark by UUID.
    pub async fn load_bookmark(&self, uuid: Uuid) -> Result<(), GatewayError> {
        let msg_id = Uuid::new_v4();
        let request = GatewayRequest::LoadBookmark(LoadBookmark { msg_id, uuid });
        let mut rx = self.inner.register(msg_id)?;
        let _guard = InFlightGuard { inner: Arc::clone(&self.inner), uuid: msg_id };
        self.send(&request).await?;

        loop {
            let Some(frame) = rx.recv().await else {
                return Err(self.inner.close_reason());
            };
            if let GatewayResponse::BookmarkLoadResult(result) = frame {
                if result.success {
                    return Ok(());
                }
                return Err(GatewayError::Remote(result.error_message));
            }
        }
    }

    /// Fire-and-forget chat message.  Replies arrive as `chat_response` /
    /// tool frames through the installed handler.
    pub async fn send_chat_message(&self, text: &str) -> Result<(), GatewayError> {
        self.send(&GatewayRequest::ChatMessage(ChatMessage { text: text.to_owned() })).await
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    async fn send(&self, request: &GatewayRequest) -> Result<(), GatewayError> {
        if self.closed() {
            return Err(self.inner.close_reason());
        }
        let json = serde_json::to_string(request)
            .map_err(|e| GatewayError::Serialization(e.to_string()))?;
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.send(Message::Text(json.into())).await {
            let error = GatewayError::Ws(e.to_string());
            self.inner.abort(Some(error.clone()));
            return Err(error);
        }
        Ok(())
    }
}

/// Removes the in-flight entry when a request completes or its future is
/// dropped mid-flight.
struct InFlightGuard {
    inner: Arc<ClientInner>,
    uuid: Uuid,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.write().unwrap().remove(&self.uuid);
    }
}

impl ClientInner {
    fn register(
        &self,
        uuid: Uuid,
    ) -> Result<mpsc::UnboundedReceiver<GatewayResponse>, GatewayError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.close_reason());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.in_flight.write().unwrap().insert(uuid, tx);
        // Re-check: an abort may have drained the map between the first
        // check and the insert.
        if self.closed.load(Ordering::SeqCst) {
            self.in_flight.write().unwrap().remove(&uuid);
            return Err(self.close_reason());
        }
        Ok(rx)
    }

    /// The error handed to requests that outlived the connection.
    fn close_reason(&self) -> GatewayError {
        self.close_error.lock().unwrap().clone().unwrap_or(GatewayError::Closed)
    }

    /// Idempotent teardown: mark closed, join the error, close every live
    /// channel, mark every live uuid finished, wake all waiters.
    fn abort(&self, error: Option<GatewayError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(error) = error {
            self.close_error.lock().unwrap().get_or_insert(error);
        }
        let drained: Vec<Uuid> = {
            let mut in_flight = self.in_flight.write().unwrap();
            in_flight.drain().map(|(uuid, _sender)| uuid).collect()
            // Senders drop here, closing each per-request channel.
        };
        {
            let mut finished = self.finished.lock().unwrap();
            for uuid in drained {
                finished.insert(uuid);
            }
        }
        self.finished_notify.notify_waiters();
        debug!("gateway client closed");
    }

    /// Route one frame: handler first, then the correlation-keyed channel.
    fn dispatch(&self, frame: GatewayResponse) {
        if let Some(handler) = &self.handler {
            match &frame {
                GatewayResponse::NewItem(item) => handler.on_item(item),
                GatewayResponse::NewEdge(edge) => handler.on_edge(edge),
                GatewayResponse::Status(status) => handler.on_status(status),
                GatewayResponse::QueryError(error) => handler.on_query_error(error),
                GatewayResponse::DeleteItem(reference) => handler.on_delete_item(reference),
                GatewayResponse::DeleteEdge(edge) => handler.on_delete_edge(edge),
                GatewayResponse::UpdateItem(item) => handler.on_update_item(item),
                GatewayResponse::SnapshotStoreResult(r) => handler.on_snapshot_store_result(r),
                GatewayResponse::SnapshotLoadResult(r) => handler.on_snapshot_load_result(r),
                GatewayResponse::BookmarkStoreResult(r) => handler.on_bookmark_store_result(r),
                GatewayResponse::BookmarkLoadResult(r) => handler.on_bookmark_load_result(r),
                GatewayResponse::QueryStatus(status) => handler.on_query_status(status),
                GatewayResponse::ChatResponse(response) => handler.on_chat_response(response),
                GatewayResponse::ToolStart(tool) => handler.on_tool_start(tool),
                GatewayResponse::ToolFinish(tool) => handler.on_tool_finish(tool),
            }
        }

        let key = correlation_uuid(&frame);
        let terminal_status = match &frame {
            GatewayResponse::QueryStatus(status) => status.status.is_terminal(),
            _ => false,
        };

        {
            // Sends happen under the read lock; abort's drain (write lock)
            // therefore cannot interleave with a send.
            let in_flight = self.in_flight.read().unwrap();
            if let Some(sender) = in_flight.get(&key) {
                let _ = sender.send(frame);
            } else if !key.is_nil() {
                debug!(correlation = %key, "frame for unknown request dropped");
            }
        }

        if terminal_status {
            // Terminal status closes the per-request channel and resolves
            // any `wait` on this uuid.
            self.in_flight.write().unwrap().remove(&key);
            self.finished.lock().unwrap().insert(key);
            self.finished_notify.notify_waiters();
        }
    }
}

/// Which field correlates a frame back to its request varies by class.
fn correlation_uuid(frame: &GatewayResponse) -> Uuid {
    match frame {
        GatewayResponse::NewItem(item) | GatewayResponse::UpdateItem(item) => {
            item.source_query.unwrap_or_default()
        }
        GatewayResponse::Status(status) => status.query_uuid,
        GatewayResponse::QueryError(error) => error.uuid,
        GatewayResponse::QueryStatus(status) => status.uuid,
        GatewayResponse::SnapshotStoreResult(r) => r.msg_id,
        GatewayResponse::SnapshotLoadResult(r) => r.msg_id,
        GatewayResponse::BookmarkStoreResult(r) => r.msg_id,
        GatewayResponse::BookmarkLoadResult(r) => r.msg_id,
        // Edges, deletions, chat, and tool frames have no owning request.
        GatewayResponse::NewEdge(_)
        | GatewayResponse::DeleteItem(_)
        | GatewayResponse::DeleteEdge(_)
        | GatewayResponse::ChatResponse(_)
        | GatewayResponse::ToolStart(_)
        | GatewayResponse::ToolFinish(_) => Uuid::nil(),
    }
}

/// The single reader task.  Any transport error (or the stream ending)
/// funnels into `abort`, which unblocks every awaiting caller.
async fn read_loop(inner: Arc<ClientInner>, mut read: SplitStream<WsStream>) {
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_payload(&inner, text.as_bytes()),
            Ok(Message::Binary(payload)) => handle_payload(&inner, &payload),
            Ok(Message::Ping(payload)) => {
                let mut writer = inner.writer.lock().await;
                let _ = writer.send(Message::Pong(payload)).await;
            }
            Ok(Message::Close(close_frame)) => {
                let error = match &close_frame {
                    Some(cf) if cf.code != CloseCode::Normal => {
                        Some(GatewayError::Ws(format!("closed: {} {}", cf.code, cf.reason)))
                    }
                    _ => None,
                };
                inner.abort(error);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                inner.abort(Some(GatewayError::Ws(e.to_string())));
                return;
            }
        }
    }
    // Stream ended without a close frame: clean shutdown.
    inner.abort(None);
}

fn handle_payload(inner: &Arc<ClientInner>, payload: &[u8]) {
    match serde_json::from_slice::<GatewayResponse>(payload) {
        Ok(frame) => inner.dispatch(frame),
        // Unknown tags log-and-drop; one bad frame must not kill the stream.
        Err(e) => warn!(error = %e, "dropping undecodable gateway frame"),
    }
}

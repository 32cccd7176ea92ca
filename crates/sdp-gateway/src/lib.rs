// sdp-gateway: Multiplexing client for the persistent gateway stream.
//
// One websocket connection carries many concurrent requests; inbound frames
// are routed back to the awaiting request by correlation UUID.  A single
// reader task owns the stream; `query`/`wait` and the store/load operations
// block on their per-request channel or the shared finished-set notifier.

use sdp_protocol::{
    BookmarkLoadResult, BookmarkStoreResult, ChatResponse, Edge, Item, ProtocolError, QueryError,
    QueryStatus, Reference, Response, SnapshotLoadResult, SnapshotStoreResult, ToolFinish,
    ToolStart,
};

mod client;

pub use client::{GatewayClient, INTERACTIVE_HEADER};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Connection settings for one gateway client.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// WebSocket URL of the gateway endpoint, e.g. `wss://gateway.example.com/api`.
    pub url: String,
    /// Bearer token, if the gateway requires one.
    pub token: Option<String>,
    /// When false, the `X-overmind-interactive: false` header is sent so the
    /// gateway skips interactive-only behaviour.
    pub interactive: bool,
}

impl GatewayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), token: None, interactive: true }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from gateway operations.  `Clone` because one transport failure is
/// handed to every request that was in flight when the client aborted.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GatewayError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("websocket: {0}")]
    Ws(String),
    #[error("serialization: {0}")]
    Serialization(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The client was closed (by `close()` or a clean disconnect).
    #[error("gateway connection closed")]
    Closed,
    #[error("query cancelled by the gateway")]
    QueryCancelled,
    #[error("query errored: {0}")]
    QueryErrored(String),
    /// A store/load request was rejected by the gateway.
    #[error("gateway rejected request: {0}")]
    Remote(String),
}

// ---------------------------------------------------------------------------
// Frame observer
// ---------------------------------------------------------------------------

/// External observer invoked once per inbound frame class, independent of
/// the UUID-keyed request routing.  All methods default to no-ops; implement
/// the ones you care about.
pub trait GatewayMessageHandler: Send + Sync {
    fn on_item(&self, _item: &Item) {}
    fn on_edge(&self, _edge: &Edge) {}
    fn on_status(&self, _status: &Response) {}
    fn on_query_error(&self, _error: &QueryError) {}
    fn on_delete_item(&self, _reference: &Reference) {}
    fn on_delete_edge(&self, _edge: &Edge) {}
    fn on_update_item(&self, _item: &Item) {}
    fn on_snapshot_store_result(&self, _result: &SnapshotStoreResult) {}
    fn on_snapshot_load_result(&self, _result: &SnapshotLoadResult) {}
    fn on_bookmark_store_result(&self, _result: &BookmarkStoreResult) {}
    fn on_bookmark_load_result(&self, _result: &BookmarkLoadResult) {}
    fn on_query_status(&self, _status: &QueryStatus) {}
    fn on_chat_response(&self, _response: &ChatResponse) {}
    fn on_tool_start(&self, _tool: &ToolStart) {}
    fn on_tool_finish(&self, _tool: &ToolFinish) {}
}

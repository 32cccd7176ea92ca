// sdp-engine: The query fan-out engine.
//
// Three pieces, leaves first:
// - `sender`: the responder-side heartbeat loop (emits WORKING frames until
//   terminated).
// - `tracker`: the per-responder state machine with stall detection.
// - `coordinator`: one task per logical query — broadcast, ingest, decide
//   termination, cancel, drain.

pub mod coordinator;
pub mod sender;
pub mod tracker;

pub use coordinator::{
    run_source_query, run_source_query_sync, CoordinatorConfig, QueryFrame, QueryRunHandle,
    SyncQueryResult,
};
pub use sender::{ResponseSender, DEFAULT_RESPONSE_INTERVAL, NEXT_UPDATE_FACTOR};
pub use tracker::{OutOfOrderResponse, Progress, ResponderTracker};

use sdp_bus::BusError;
use sdp_protocol::ProtocolError;

/// Errors surfaced synchronously by the engine entry points.
///
/// Everything that happens after a query run is live (publish failures on
/// cancel, malformed frames, out-of-order responses) is logged and absorbed
/// instead — one bad frame must not poison a query.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("start timeout must be positive")]
    ZeroStartTimeout,
}

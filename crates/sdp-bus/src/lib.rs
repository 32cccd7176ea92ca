// sdp-bus: Message bus abstraction for the query fan-out engine.
//
// The engine talks to the bus exclusively through the `Bus` trait; the real
// transport lives behind it.  `MemoryBus` is the in-process implementation
// used by every test in the workspace — same subject grammar, same
// no-responders semantics, synchronous delivery.

use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod headers;
pub mod memory;
pub mod subjects;

pub use headers::{extract_trace_context, inject_trace_context, Headers, TraceContext};
pub use memory::MemoryBus;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Publishing to a subject nobody subscribes to, when the bus is
    /// configured to report that.
    #[error("no responders on subject '{0}'")]
    NoResponders(String),
    #[error("invalid subject '{subject}': {reason}")]
    InvalidSubject { subject: String, reason: &'static str },
    /// The underlying transport failed.
    #[error("transport: {0}")]
    Transport(String),
    /// Request-reply timed out or the reply channel closed.
    #[error("no reply received on '{0}'")]
    NoReply(String),
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// One delivered message.  The payload encoding is owned by the layer above;
/// the bus moves opaque bytes.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    /// Subject the receiver should reply on, for request-style publishes.
    pub reply: Option<String>,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// A live subscription: a FIFO of matching messages plus the hook that
/// detaches it from the bus.
///
/// Coordinator code consumes messages with `recv()` on its own task — bus
/// internals never run subscriber code, so a slow subscriber cannot block
/// delivery to others.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<BusMessage>,
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<BusMessage>,
        detach: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self { receiver, detach: Some(detach) }
    }

    /// Next message, or `None` once detached and fully drained.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    /// Detach from the bus and discard anything still buffered.
    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
        self.receiver.close();
    }

    /// Detach from the bus but keep already-delivered messages readable.
    /// `recv()` returns the buffered tail, then `None`.
    pub fn drain(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

// ---------------------------------------------------------------------------
// The Bus trait
// ---------------------------------------------------------------------------

/// Subscribe / publish / request-reply over a dot-delimited subject
/// namespace with `>` (trailing) and `*` (single-token) wildcards.
///
/// Delivery is best-effort and in-order per subscription; nothing is ordered
/// across subjects and nothing is persisted.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Subscribe to `subject` (which may contain wildcards).
    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;

    /// Publish a message with no reply subject.
    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> Result<(), BusError>;

    /// Publish a message directing replies to `reply_subject`.
    async fn publish_request(
        &self,
        subject: &str,
        reply_subject: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> Result<(), BusError>;

    /// Publish to `subject` and await a single reply on an ephemeral inbox.
    async fn request(
        &self,
        subject: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> Result<BusMessage, BusError>;
}

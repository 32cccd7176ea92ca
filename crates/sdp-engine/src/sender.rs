//! Responder-side heartbeat loop.
//!
//! A started sender publishes `WORKING` immediately and then every
//! `interval` until one of the terminal calls is made:
//! - `done()`    -> final `COMPLETE` frame
//! - `error()`   -> final `ERROR` frame
//! - `cancel()`  -> final `CANCELLED` frame
//! - `kill()`    -> no final frame
//!
//! Each heartbeat advertises `next_update_in = NEXT_UPDATE_FACTOR x interval`
//! so the tracker on the other side knows how long to wait before declaring
//! a stall (one missed heartbeat plus ~30% slack).

use sdp_bus::{Bus, Headers};
use sdp_protocol::{QueryResponse, ResponderState, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

/// Default gap between heartbeats.
pub const DEFAULT_RESPONSE_INTERVAL: Duration = Duration::from_secs(5);

/// Protocol constant: how many intervals (plus slack) the tracker waits for
/// the next heartbeat before declaring a stall.
pub const NEXT_UPDATE_FACTOR: f64 = 2.3;

/// A running heartbeat loop for one responder working one query.
///
/// Terminal calls consume the sender, so a second terminal call is
/// unrepresentable.  The loop is guaranteed to have exited before any
/// terminal call returns; after that no further frames are emitted.
pub struct ResponseSender {
    bus: Option<Arc<dyn Bus>>,
    subject: String,
    responder: String,
    responder_uuid: Uuid,
    query_uuid: Uuid,
    kill: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ResponseSender {
    /// Start heartbeating on `subject` with the default interval.
    ///
    /// A `None` bus is legal and turns the sender into a no-op skeleton.
    pub fn start(
        bus: Option<Arc<dyn Bus>>,
        subject: impl Into<String>,
        responder: impl Into<String>,
        responder_uuid: Uuid,
        query_uuid: Uuid,
    ) -> Self {
        Self::start_with_interval(
            bus,
            subject,
            responder,
            responder_uuid,
            query_uuid,
            DEFAULT_RESPONSE_INTERVAL,
        )
    }

    /// Start heartbeating with an explicit interval (tests use short ones).
    pub fn start_with_interval(
        bus: Option<Arc<dyn Bus>>,
        subject: impl Into<String>,
        responder: impl Into<String>,
        responder_uuid: Uuid,
        query_uuid: Uuid,
        interval: Duration,
    ) -> Self {
        let subject = subject.into();
        let responder = responder.into();
        let (kill, mut kill_rx) = watch::channel(false);

        let loop_bus = bus.clone();
        let loop_subject = subject.clone();
        let loop_responder = responder.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    // Any change (or the sender being dropped) terminates.
                    _ = kill_rx.changed() => break,
                    _ = ticker.tick() => {
                        let heartbeat = Response {
                            responder: loop_responder.clone(),
                            responder_uuid,
                            state: ResponderState::Working,
                            next_update_in: Some(interval.mul_f64(NEXT_UPDATE_FACTOR)),
                            query_uuid,
                        };
                        publish_response(loop_bus.as_deref(), &loop_subject, heartbeat).await;
                    }
                }
            }
        });

        Self {
            bus,
            subject,
            responder,
            responder_uuid,
            query_uuid,
            kill,
            task: Some(task),
        }
    }

    /// Stop the loop and emit a final `COMPLETE` frame.
    pub async fn done(self) {
        self.finish(Some(ResponderState::Complete)).await;
    }

    /// Stop the loop and emit a final `ERROR` frame.
    pub async fn error(self) {
        self.finish(Some(ResponderState::Error)).await;
    }

    /// Stop the loop and emit a final `CANCELLED` frame.
    pub async fn cancel(self) {
        self.finish(Some(ResponderState::Cancelled)).await;
    }

    /// Stop the loop silently: no final frame.
    pub async fn kill(self) {
        self.finish(None).await;
    }

    async fn finish(mut self, state: Option<ResponderState>) {
        let _ = self.kill.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        if let Some(state) = state {
            let response = Response {
                responder: self.responder.clone(),
                responder_uuid: self.responder_uuid,
                state,
                next_update_in: None,
                query_uuid: self.query_uuid,
            };
            publish_response(self.bus.as_deref(), &self.subject, response).await;
        }
    }
}

/// Publish one `Response` frame; errors are logged and swallowed — the
/// sender never fails back to its caller.
async fn publish_response(bus: Option<&dyn Bus>, subject: &str, response: Response) {
    let Some(bus) = bus else { return };
    if let Ok(payload) = serde_json::to_vec(&QueryResponse::Response(response)) {
        if let Err(e) = bus.publish(subject, Headers::new(), payload).await {
            warn!(subject = %subject, error = %e, "heartbeat publish failed");
        }
    }
}

//! Per-responder state machine for one logical query.
//!
//! The tracker records the latest `Response` seen from each responder UUID
//! together with when it was observed.  Terminal states are monotonic: once
//! a responder has reported `COMPLETE`/`ERROR`/`CANCELLED`, later frames for
//! it are rejected.  Responders may briefly send delayed frames after
//! completing due to bus reordering; accepting them would oscillate the
//! record and prevent termination.
//!
//! `STALLED` is assigned here and only here, from the
//! `observed_at + next_update_in` test.  It is non-terminal: a later genuine
//! frame from the responder reverts it.

use sdp_protocol::{ResponderState, Response};
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

/// Rejected update: a frame arrived for a responder that already reported a
/// terminal state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "out-of-order response from {responder} ({responder_uuid}): {attempted:?} after terminal {stored:?}"
)]
pub struct OutOfOrderResponse {
    pub responder: String,
    pub responder_uuid: Uuid,
    pub stored: ResponderState,
    pub attempted: ResponderState,
}

/// Aggregated responder counts at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub working: usize,
    pub stalled: usize,
    pub complete: usize,
    pub error: usize,
    pub cancelled: usize,
    /// Total responders ever observed for this query.
    pub responders: usize,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "working: {}, stalled: {}, complete: {}, error: {}, cancelled: {} ({} responders)",
            self.working, self.stalled, self.complete, self.error, self.cancelled, self.responders
        )
    }
}

struct ResponderRecord {
    last_response: Response,
    observed_at: Instant,
}

/// State for every responder that has ever answered one query.
///
/// Records are append-only with respect to the set of responder UUIDs; they
/// live as long as the query run.  All access goes through the coordinator's
/// mutex.
#[derive(Default)]
pub struct ResponderTracker {
    responders: HashMap<Uuid, ResponderRecord>,
}

impl ResponderTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame from a responder.  Frames for responders already in a
    /// terminal state are rejected — terminal states never transition out.
    pub fn observe(&mut self, response: Response) -> Result<(), OutOfOrderResponse> {
        if let Some(record) = self.responders.get(&response.responder_uuid) {
            if record.last_response.state.is_terminal() {
                return Err(OutOfOrderResponse {
                    responder: response.responder,
                    responder_uuid: response.responder_uuid,
                    stored: record.last_response.state,
                    attempted: response.state,
                });
            }
        }
        self.responders.insert(
            response.responder_uuid,
            ResponderRecord { last_response: response, observed_at: Instant::now() },
        );
        Ok(())
    }

    /// Rewrite every `WORKING` record to `CANCELLED` in place.  Used when the
    /// coordinator forcibly cancels without waiting for responder acks.
    pub fn mark_working_cancelled(&mut self) {
        for record in self.responders.values_mut() {
            if record.last_response.state == ResponderState::Working {
                record.last_response.state = ResponderState::Cancelled;
            }
        }
    }

    /// Flip overdue `WORKING` records to `STALLED`.
    ///
    /// A record is overdue when its advertised `next_update_in` has elapsed
    /// since it was observed.  `observed_at` is left unchanged so a stalled
    /// record stays stalled until a genuine frame arrives.
    pub fn recheck_stall(&mut self) {
        let now = Instant::now();
        for record in self.responders.values_mut() {
            if record.last_response.state != ResponderState::Working {
                continue;
            }
            if let Some(next_update_in) = record.last_response.next_update_in {
                if !next_update_in.is_zero() && now.duration_since(record.observed_at) > next_update_in {
                    record.last_response.state = ResponderState::Stalled;
                }
            }
        }
    }

    /// True when no responder is still `WORKING`.  An empty record set is
    /// trivially done — the coordinator's start-timeout guard handles the
    /// zero-responder window.
    pub fn all_done(&mut self) -> bool {
        self.recheck_stall();
        self.responders
            .values()
            .all(|r| r.last_response.state != ResponderState::Working)
    }

    /// Current counts per state, after a stall recheck.
    pub fn progress(&mut self) -> Progress {
        self.recheck_stall();
        let mut progress = Progress { responders: self.responders.len(), ..Progress::default() };
        for record in self.responders.values() {
            match record.last_response.state {
                ResponderState::Working => progress.working += 1,
                ResponderState::Stalled => progress.stalled += 1,
                ResponderState::Complete => progress.complete += 1,
                ResponderState::Error => progress.error += 1,
                ResponderState::Cancelled => progress.cancelled += 1,
            }
        }
        progress
    }
}

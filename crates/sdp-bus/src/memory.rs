//! In-process bus with the full subject grammar.
//!
//! Delivery is synchronous: `publish` walks the subscription table and pushes
//! onto each matching subscriber's FIFO before returning.  Per-subscription
//! ordering therefore follows publish order exactly, which the scenario
//! suites rely on.

use crate::subjects::subject_to_regex;
use crate::{Bus, BusError, BusMessage, Headers, Subscription};
use async_trait::async_trait;
use regex::Regex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

struct SubscriptionEntry {
    id: u64,
    pattern: Regex,
    sender: mpsc::UnboundedSender<BusMessage>,
}

struct Shared {
    subscriptions: Mutex<Vec<SubscriptionEntry>>,
    ignore_no_responders: AtomicBool,
    next_id: AtomicU64,
}

/// The in-process bus double.  Cheap to clone; clones share one subject
/// space.
#[derive(Clone)]
pub struct MemoryBus {
    shared: Arc<Shared>,
}

impl MemoryBus {
    /// A bus that reports [`BusError::NoResponders`] when a publish matches
    /// no subscription.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                subscriptions: Mutex::new(Vec::new()),
                ignore_no_responders: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Toggle whether publishing into the void is an error (`false`, the
    /// default) or silently accepted (`true`).
    pub fn ignore_no_responders(&self, ignore: bool) {
        self.shared.ignore_no_responders.store(ignore, Ordering::SeqCst);
    }

    fn deliver(&self, msg: BusMessage) -> usize {
        let mut subs = self.shared.subscriptions.lock().unwrap();
        let mut delivered = 0;
        // Dead receivers are pruned as a side effect of delivery.
        subs.retain(|entry| {
            if !entry.pattern.is_match(&msg.subject) {
                return true;
            }
            match entry.sender.send(msg.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        delivered
    }

    fn publish_inner(&self, msg: BusMessage) -> Result<(), BusError> {
        let subject = msg.subject.clone();
        let delivered = self.deliver(msg);
        debug!(subject = %subject, delivered, "publish");
        if delivered == 0 && !self.shared.ignore_no_responders.load(Ordering::SeqCst) {
            return Err(BusError::NoResponders(subject));
        }
        Ok(())
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
        let pattern = subject_to_regex(subject)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        self.shared
            .subscriptions
            .lock()
            .unwrap()
            .push(SubscriptionEntry { id, pattern, sender });

        let shared = Arc::clone(&self.shared);
        let detach = Box::new(move || {
            shared.subscriptions.lock().unwrap().retain(|e| e.id != id);
        });
        Ok(Subscription::new(receiver, detach))
    }

    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        self.publish_inner(BusMessage {
            subject: subject.to_owned(),
            reply: None,
            headers,
            payload,
        })
    }

    async fn publish_request(
        &self,
        subject: &str,
        reply_subject: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        self.publish_inner(BusMessage {
            subject: subject.to_owned(),
            reply: Some(reply_subject.to_owned()),
            headers,
            payload,
        })
    }

    async fn request(
        &self,
        subject: &str,
        headers: Headers,
        payload: Vec<u8>,
    ) -> Result<BusMessage, BusError> {
        let inbox = format!("inbox.{}", Uuid::new_v4().simple());
        let mut reply_sub = self.subscribe(&inbox).await?;
        self.publish_request(subject, &inbox, headers, payload).await?;
        reply_sub.recv().await.ok_or(BusError::NoReply(subject.to_owned()))
    }
}

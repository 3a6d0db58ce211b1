//! Correlation waits for replies arriving on the responses queue.
//!
//! A wait is registered under a fresh correlation ID before the request is
//! published, and resolved by the response consumer or abandoned by the
//! caller. Removal from the table is the single point of decision: whoever
//! removes a single wait owns its outcome, so a timeout and a late reply can
//! never both win.

use courier_core::Reply;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

enum Waiter {
    Single(oneshot::Sender<Reply>),
    Multi(mpsc::UnboundedSender<Reply>),
}

/// Correlation ID to resolution slot.
#[derive(Default)]
pub struct PendingWaits {
    waits: DashMap<String, Waiter>,
}

impl PendingWaits {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a wait that takes exactly one reply.
    pub fn register_single(&self, correlation_id: &str) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.waits
            .insert(correlation_id.to_string(), Waiter::Single(tx));
        rx
    }

    /// Registers a wait that collects every reply until abandoned.
    pub fn register_multi(&self, correlation_id: &str) -> mpsc::UnboundedReceiver<Reply> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.waits
            .insert(correlation_id.to_string(), Waiter::Multi(tx));
        rx
    }

    /// Hands a reply to its wait. Returns `false` when nobody awaits that
    /// correlation ID, in which case the reply is dropped.
    pub fn resolve(&self, reply: Reply) -> bool {
        let multi = match self.waits.get(&reply.correlation_id) {
            None => return false,
            Some(entry) => match entry.value() {
                Waiter::Multi(tx) => Some(tx.clone()),
                Waiter::Single(_) => None,
            },
        };

        if let Some(tx) = multi {
            return tx.send(reply).is_ok();
        }

        match self.waits.remove(&reply.correlation_id) {
            Some((_, Waiter::Single(tx))) => tx.send(reply).is_ok(),
            Some((id, waiter @ Waiter::Multi(_))) => {
                // Re-registered as multi between the two lookups.
                self.waits.insert(id, waiter);
                false
            }
            None => {
                trace!(correlation_id = %reply.correlation_id, "wait already settled");
                false
            }
        }
    }

    /// Stops waiting for `correlation_id`. Returns `true` if the wait was
    /// still registered, i.e. no reply claimed it first.
    pub fn abandon(&self, correlation_id: &str) -> bool {
        self.waits.remove(correlation_id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.waits.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waits.is_empty()
    }
}

/// Abandons a wait when dropped, so a cancelled caller leaves nothing
/// behind in the table.
pub(crate) struct WaitGuard<'a> {
    pending: &'a PendingWaits,
    correlation_id: &'a str,
}

impl<'a> WaitGuard<'a> {
    pub(crate) fn new(pending: &'a PendingWaits, correlation_id: &'a str) -> Self {
        Self {
            pending,
            correlation_id,
        }
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.pending.abandon(self.correlation_id);
    }
}

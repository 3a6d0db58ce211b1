//! Message broker abstraction.
//!
//! The intakes and the gateway only need three things from a broker: publish
//! a payload to a named queue, receive deliveries from a named queue, and
//! settle each delivery by acknowledging or requeueing it. Competing
//! consumers of one queue each receive a share of its messages.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use memory::{BrokerStats, MemoryBroker};

/// Broker failures. On the request path these surface as the nearest Status
/// Code; at startup they abort initialization.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connect(String),
    #[error("publish to {queue} failed: {reason}")]
    Publish { queue: String, reason: String },
    #[error("consume from {queue} failed: {reason}")]
    Consume { queue: String, reason: String },
    #[error("settling delivery failed: {0}")]
    Settle(String),
    #[error("broker is closed")]
    Closed,
}

/// Final decision for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done with it; remove it from the queue.
    Ack,
    /// Put it back so another consumer can take it.
    Requeue,
}

impl Disposition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::Ack => "ack",
            Disposition::Requeue => "requeue",
        }
    }
}

/// Settles one delivery with the broker it came from.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn settle(self: Box<Self>, disposition: Disposition) -> Result<(), BrokerError>;
}

/// A message received from a queue, to be settled exactly once.
pub struct Delivery {
    pub payload: Bytes,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    #[must_use]
    pub fn new(payload: Bytes, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            payload,
            redelivered,
            acker,
        }
    }

    /// # Errors
    ///
    /// Returns `BrokerError::Settle` if the broker refused the settlement.
    pub async fn settle(self, disposition: Disposition) -> Result<(), BrokerError> {
        self.acker.settle(disposition).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// A connection to a message broker.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Publishes a payload to a queue.
    async fn publish(&self, queue: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Starts consuming a queue. The receiver yields deliveries until the
    /// broker is closed; dropping it cancels the consumer.
    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, BrokerError>;

    /// Closes the connection. Unsettled deliveries are returned to their
    /// queues.
    async fn close(&self);
}

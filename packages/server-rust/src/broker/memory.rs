//! In-process broker used for tests and single-process deployments.
//!
//! Each queue is an unbounded channel whose receiving end is shared by every
//! consumer of that queue, so consumers compete for messages. A delivery
//! dropped without being settled goes back to its queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, trace};

use super::{Acknowledger, Broker, BrokerError, Delivery, Disposition};

/// Capacity of each consumer's delivery channel.
const CONSUMER_PREFETCH: usize = 16;

struct Message {
    payload: Bytes,
    redelivered: bool,
}

struct Queue {
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    fn push(&self, message: Message) {
        // The queue owns its receiver, so the channel cannot be closed.
        let _ = self.tx.send(message);
    }
}

/// Counters for settled and published messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub acked: u64,
    pub requeued: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
}

/// In-memory [`Broker`].
pub struct MemoryBroker {
    queues: DashMap<String, Arc<Queue>>,
    counters: Arc<Counters>,
    closed_tx: watch::Sender<bool>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            queues: DashMap::new(),
            counters: Arc::new(Counters::default()),
            closed_tx,
        }
    }

    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            published: self.counters.published.load(Ordering::Acquire),
            acked: self.counters.acked.load(Ordering::Acquire),
            requeued: self.counters.requeued.load(Ordering::Acquire),
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    fn queue(&self, name: &str) -> Arc<Queue> {
        Arc::clone(
            self.queues
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Queue::new()))
                .value(),
        )
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, queue: &str, payload: Bytes) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        self.queue(queue).push(Message {
            payload,
            redelivered: false,
        });
        self.counters.published.fetch_add(1, Ordering::AcqRel);
        trace!(queue, "published");
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let (tx, rx) = mpsc::channel(CONSUMER_PREFETCH);
        let state = self.queue(queue);
        let counters = Arc::clone(&self.counters);
        let mut closed_rx = self.closed_tx.subscribe();
        let name = queue.to_string();

        tokio::spawn(async move {
            loop {
                let next = async { state.rx.lock().await.recv().await };
                let message = tokio::select! {
                    message = next => match message {
                        Some(m) => m,
                        None => break,
                    },
                    () = tx.closed() => break,
                    _ = closed_rx.changed() => break,
                };

                let delivery = Delivery::new(
                    message.payload.clone(),
                    message.redelivered,
                    Box::new(MemoryAcker {
                        queue: Arc::clone(&state),
                        counters: Arc::clone(&counters),
                        message: Some(message),
                    }),
                );
                // A failed send drops the delivery, which requeues it.
                if tx.send(delivery).await.is_err() {
                    break;
                }
            }
            debug!(queue = %name, "consumer stopped");
        });

        Ok(rx)
    }

    async fn close(&self) {
        let _ = self.closed_tx.send(true);
    }
}

struct MemoryAcker {
    queue: Arc<Queue>,
    counters: Arc<Counters>,
    message: Option<Message>,
}

impl MemoryAcker {
    fn requeue(&mut self) {
        if let Some(mut message) = self.message.take() {
            message.redelivered = true;
            self.queue.push(message);
            self.counters.requeued.fetch_add(1, Ordering::AcqRel);
        }
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn settle(self: Box<Self>, disposition: Disposition) -> Result<(), BrokerError> {
        let mut this = self;
        match disposition {
            Disposition::Ack => {
                this.message.take();
                this.counters.acked.fetch_add(1, Ordering::AcqRel);
            }
            Disposition::Requeue => this.requeue(),
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        self.requeue();
    }
}

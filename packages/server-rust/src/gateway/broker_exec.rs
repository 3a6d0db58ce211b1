//! Broker executor: publishes requests and correlates replies.
//!
//! One consumer task reads the responses queue for the life of the executor,
//! acknowledges every delivery, and hands replies to the pending-waits table.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use courier_core::{wire, BrokerFields, OperationId, Params, Reply, StatusCode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::pending::{PendingWaits, WaitGuard};
use super::ExecuteError;
use crate::broker::{Broker, BrokerError, Delivery, Disposition};
use crate::config::{BrokerConfig, GatewayConfig};

/// Settings for the broker executor.
#[derive(Debug, Clone)]
pub struct BrokerExecutorConfig {
    pub requests_queue: String,
    pub responses_queue: String,
    pub fields: BrokerFields,
    pub single_response_timeout: Duration,
    /// Quiet period ending a multi-response wait.
    pub multi_response_timeout: Duration,
}

impl BrokerExecutorConfig {
    fn from_broker(broker: &BrokerConfig, single: Duration, multi: Duration) -> Self {
        Self {
            requests_queue: broker.requests_queue.clone(),
            responses_queue: broker.responses_queue.clone(),
            fields: broker.fields(),
            single_response_timeout: single,
            multi_response_timeout: multi,
        }
    }
}

impl From<&GatewayConfig> for BrokerExecutorConfig {
    fn from(config: &GatewayConfig) -> Self {
        Self::from_broker(
            &config.broker,
            config.single_response_timeout(),
            config.multi_response_timeout(),
        )
    }
}

/// Sends requests over the broker and waits for correlated replies.
pub struct BrokerExecutor {
    config: BrokerExecutorConfig,
    broker: Arc<dyn Broker>,
    pending: Arc<PendingWaits>,
    consumer: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

async fn route_replies(mut deliveries: mpsc::Receiver<Delivery>, pending: Arc<PendingWaits>) {
    while let Some(delivery) = deliveries.recv().await {
        match wire::decode_reply(&delivery.payload) {
            Some(reply) => {
                let correlation_id = reply.correlation_id.clone();
                if !pending.resolve(reply) {
                    debug!(%correlation_id, "discarding reply nobody awaits");
                }
            }
            None => warn!(len = delivery.payload.len(), "discarding unreadable reply"),
        }
        if let Err(e) = delivery.settle(Disposition::Ack).await {
            warn!(error = %e, "failed to ack reply");
        }
    }
    debug!("response consumer finished");
}

impl BrokerExecutor {
    #[must_use]
    pub fn new(config: BrokerExecutorConfig, broker: Arc<dyn Broker>) -> Self {
        Self {
            config,
            broker,
            pending: Arc::new(PendingWaits::new()),
            consumer: parking_lot::Mutex::new(None),
        }
    }

    /// Starts consuming the responses queue. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the broker's error if the consumer cannot be created.
    pub async fn start(&self) -> Result<(), BrokerError> {
        if self.consumer.lock().is_some() {
            return Ok(());
        }
        let deliveries = self.broker.consume(&self.config.responses_queue).await?;
        let handle = tokio::spawn(route_replies(deliveries, Arc::clone(&self.pending)));

        let mut consumer = self.consumer.lock();
        if consumer.is_some() {
            handle.abort();
        } else {
            info!(queue = %self.config.responses_queue, "consuming replies");
            *consumer = Some(handle);
        }
        Ok(())
    }

    /// Stops the response consumer. Waits still pending run into their
    /// timeouts.
    pub fn stop(&self) {
        if let Some(handle) = self.consumer.lock().take() {
            handle.abort();
        }
    }

    /// Number of correlation waits currently registered.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    async fn publish(
        &self,
        correlation_id: &str,
        operation: &OperationId,
        params: &Params,
    ) -> Result<(), ExecuteError> {
        let payload = wire::encode_request(&self.config.fields, correlation_id, operation, params);
        self.broker
            .publish(&self.config.requests_queue, Bytes::from(payload))
            .await
            .map_err(|e| {
                warn!(%operation, error = %e, "request publish failed");
                ExecuteError::Status(StatusCode::InternalError)
            })
    }

    /// Publishes one request and waits for the first reply.
    ///
    /// # Errors
    ///
    /// `Timeout` when no reply arrives within the single-response timeout,
    /// `Status` for error replies and publish failures.
    pub async fn request(&self, operation: &OperationId, params: &Params) -> Result<Reply, ExecuteError> {
        let correlation_id = Uuid::new_v4().to_string();
        let mut rx = self.pending.register_single(&correlation_id);
        let _guard = WaitGuard::new(&self.pending, &correlation_id);

        self.publish(&correlation_id, operation, params).await?;

        let timeout = self.config.single_response_timeout;
        let reply = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(ExecuteError::Status(StatusCode::InternalError)),
            Err(_) => {
                if self.pending.abandon(&correlation_id) {
                    debug!(%operation, %correlation_id, "no reply before timeout");
                    return Err(ExecuteError::timeout(timeout));
                }
                // A reply claimed the wait as the timer fired.
                rx.await
                    .map_err(|_| ExecuteError::Status(StatusCode::InternalError))?
            }
        };

        match reply.error_status() {
            Some(status) => Err(ExecuteError::Status(status)),
            None => Ok(reply),
        }
    }

    /// Publishes one request and collects replies until none has arrived
    /// for the quiet period. The result may be empty.
    ///
    /// # Errors
    ///
    /// `Status(InternalError)` if the request could not be published.
    pub async fn request_all(
        &self,
        operation: &OperationId,
        params: &Params,
    ) -> Result<Vec<Reply>, ExecuteError> {
        let correlation_id = Uuid::new_v4().to_string();
        let mut rx = self.pending.register_multi(&correlation_id);
        let guard = WaitGuard::new(&self.pending, &correlation_id);

        self.publish(&correlation_id, operation, params).await?;

        let quiet = self.config.multi_response_timeout;
        let mut replies = Vec::new();
        while let Ok(Some(reply)) = tokio::time::timeout(quiet, rx.recv()).await {
            replies.push(reply);
        }
        drop(guard);
        while let Ok(reply) = rx.try_recv() {
            replies.push(reply);
        }

        debug!(%operation, replies = replies.len(), "multi-response wait finished");
        Ok(replies)
    }
}

impl Drop for BrokerExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::broker::MemoryBroker;

    fn config() -> BrokerExecutorConfig {
        BrokerExecutorConfig {
            requests_queue: "requests".into(),
            responses_queue: "responses".into(),
            fields: BrokerFields::default(),
            single_response_timeout: Duration::from_millis(200),
            multi_response_timeout: Duration::from_millis(100),
        }
    }

    /// Answers every request after `delay`, `copies` times, with `body`.
    fn spawn_responder(broker: Arc<MemoryBroker>, delay: Duration, copies: usize, error: Option<u16>) {
        tokio::spawn(async move {
            let mut requests = broker.consume("requests").await.unwrap();
            while let Some(delivery) = requests.recv().await {
                let request = wire::decode_request(&BrokerFields::default(), &delivery.payload).unwrap();
                delivery.settle(Disposition::Ack).await.unwrap();
                let id = request.correlation_id.unwrap();
                let body = match error {
                    Some(code) => json!({"uuid": id, "error": code}),
                    None => json!({"uuid": id, "echo": request.operation.to_string()}),
                };
                let broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    for _ in 0..copies {
                        broker
                            .publish("responses", Bytes::from(body.to_string()))
                            .await
                            .unwrap();
                    }
                });
            }
        });
    }

    async fn executor(broker: &Arc<MemoryBroker>) -> BrokerExecutor {
        let dyn_broker: Arc<dyn Broker> = Arc::clone(broker) as Arc<dyn Broker>;
        let executor = BrokerExecutor::new(config(), dyn_broker);
        executor.start().await.unwrap();
        executor
    }

    #[tokio::test]
    async fn single_reply_resolves() {
        let broker = Arc::new(MemoryBroker::new());
        spawn_responder(Arc::clone(&broker), Duration::from_millis(10), 1, None);
        let executor = executor(&broker).await;

        let op = OperationId::new("guess-counter", "get-count");
        let reply = executor.request(&op, &Params::new()).await.unwrap();
        assert_eq!(reply.body["echo"], "guess-counter/get-count");
        assert_eq!(executor.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_reply_is_a_status() {
        let broker = Arc::new(MemoryBroker::new());
        spawn_responder(Arc::clone(&broker), Duration::ZERO, 1, Some(404));
        let executor = executor(&broker).await;

        let op = OperationId::new("guess-counter", "nope");
        let err = executor.request(&op, &Params::new()).await.unwrap_err();
        assert_eq!(err, ExecuteError::Status(StatusCode::UnknownRoute));
    }

    #[tokio::test]
    async fn silence_is_a_timeout() {
        let broker = Arc::new(MemoryBroker::new());
        let executor = executor(&broker).await;

        let op = OperationId::new("guess-counter", "get-count");
        let err = executor.request(&op, &Params::new()).await.unwrap_err();
        assert_eq!(err, ExecuteError::Timeout { ms: 200 });
        assert_eq!(executor.pending_count(), 0);
    }

    #[tokio::test]
    async fn multi_collects_every_copy() {
        let broker = Arc::new(MemoryBroker::new());
        spawn_responder(Arc::clone(&broker), Duration::from_millis(10), 3, None);
        let executor = executor(&broker).await;

        let op = OperationId::new("service-wrapper", "get-ids");
        let replies = executor.request_all(&op, &Params::new()).await.unwrap();
        assert_eq!(replies.len(), 3);
        assert_eq!(executor.pending_count(), 0);
    }

    #[tokio::test]
    async fn multi_with_no_replies_is_empty() {
        let broker = Arc::new(MemoryBroker::new());
        let executor = executor(&broker).await;
        let op = OperationId::new("service-wrapper", "get-ids");
        assert!(executor.request_all(&op, &Params::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stray_replies_are_acked_and_dropped() {
        let broker = Arc::new(MemoryBroker::new());
        let executor = executor(&broker).await;

        broker
            .publish("responses", Bytes::from(json!({"uuid": "stray"}).to_string()))
            .await
            .unwrap();
        broker
            .publish("responses", Bytes::from_static(b"garbage"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.stats().acked, 2);
        assert_eq!(broker.stats().requeued, 0);
        drop(executor);
    }
}

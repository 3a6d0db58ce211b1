//! Broker intake: consumes the requests queue and publishes replies.
//!
//! Settling a delivery is a routing decision, not a completion signal:
//!
//! | Situation                                   | Settle  | Reply         |
//! |---------------------------------------------|---------|---------------|
//! | not JSON, no correlation ID, no route       | ack     | none          |
//! | service not hosted here                     | requeue | none          |
//! | unknown operation path or binding failure   | ack     | error reply   |
//! | dispatch succeeded                          | ack     | response      |
//! | handler failed internally                   | requeue | none          |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_core::envelope::error_reply;
use courier_core::{wire, BrokerFields};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use super::Intake;
use crate::broker::{Broker, Delivery, Disposition};
use crate::config::WrapperConfig;
use crate::network::ShutdownController;
use crate::service::Dispatcher;

/// Settings for the broker intake.
#[derive(Debug, Clone)]
pub struct BrokerIntakeConfig {
    pub requests_queue: String,
    pub responses_queue: String,
    pub fields: BrokerFields,
    pub drain_timeout: Duration,
}

impl From<&WrapperConfig> for BrokerIntakeConfig {
    fn from(config: &WrapperConfig) -> Self {
        Self {
            requests_queue: config.broker.requests_queue.clone(),
            responses_queue: config.broker.responses_queue.clone(),
            fields: config.broker.fields(),
            drain_timeout: config.drain_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// RequestProcessor
// ---------------------------------------------------------------------------

/// What to do with one request message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub disposition: Disposition,
    /// Payload to publish on the responses queue before settling.
    pub reply: Option<Vec<u8>>,
}

impl Outcome {
    fn ack(reply: Option<Vec<u8>>) -> Self {
        Self {
            disposition: Disposition::Ack,
            reply,
        }
    }

    fn requeue() -> Self {
        Self {
            disposition: Disposition::Requeue,
            reply: None,
        }
    }
}

/// Applies the settle policy to request payloads.
#[derive(Debug, Clone)]
pub struct RequestProcessor {
    dispatcher: Arc<Dispatcher>,
    fields: BrokerFields,
}

impl RequestProcessor {
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>, fields: BrokerFields) -> Self {
        Self { dispatcher, fields }
    }

    pub async fn process(&self, payload: &[u8]) -> Outcome {
        let request = match wire::decode_request(&self.fields, payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "dropping undeliverable request");
                return Outcome::ack(None);
            }
        };

        let correlation_id = request.correlation_id.clone().unwrap_or_default();
        let operation = request.operation.clone();
        match self.dispatcher.dispatch(request).await {
            Ok(response) => Outcome::ack(Some(response.to_json_bytes())),
            Err(status) if status.is_retriable() => {
                debug!(%operation, %status, "requeueing request for another instance");
                Outcome::requeue()
            }
            Err(status) => {
                let reply = error_reply(&correlation_id, status);
                Outcome::ack(Some(reply.to_string().into_bytes()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// BrokerIntake
// ---------------------------------------------------------------------------

struct Running {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Serves the dispatcher from a broker queue.
pub struct BrokerIntake {
    config: BrokerIntakeConfig,
    broker: Arc<dyn Broker>,
    processor: RequestProcessor,
    shutdown: Arc<ShutdownController>,
    running: Mutex<Option<Running>>,
}

impl BrokerIntake {
    #[must_use]
    pub fn new(config: BrokerIntakeConfig, broker: Arc<dyn Broker>, dispatcher: Arc<Dispatcher>) -> Self {
        let processor = RequestProcessor::new(dispatcher, config.fields.clone());
        Self {
            config,
            broker,
            processor,
            shutdown: Arc::new(ShutdownController::new()),
            running: Mutex::new(None),
        }
    }

    /// Number of deliveries currently being processed.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.shutdown.in_flight_count()
    }
}

async fn handle_delivery(
    delivery: Delivery,
    processor: RequestProcessor,
    broker: Arc<dyn Broker>,
    responses_queue: Arc<str>,
) {
    let mut outcome = processor.process(&delivery.payload).await;

    if let Some(reply) = outcome.reply.take() {
        if let Err(e) = broker.publish(&responses_queue, Bytes::from(reply)).await {
            warn!(error = %e, "reply publish failed, requeueing request");
            outcome.disposition = Disposition::Requeue;
        }
    }

    let disposition = outcome.disposition;
    metrics::counter!("courier_broker_deliveries_total", "disposition" => disposition.as_str())
        .increment(1);
    if let Err(e) = delivery.settle(disposition).await {
        warn!(error = %e, disposition = disposition.as_str(), "settle failed");
    }
}

async fn consume_loop(
    mut deliveries: mpsc::Receiver<Delivery>,
    mut stop_rx: oneshot::Receiver<()>,
    processor: RequestProcessor,
    broker: Arc<dyn Broker>,
    responses_queue: Arc<str>,
    shutdown: Arc<ShutdownController>,
) {
    loop {
        tokio::select! {
            next = deliveries.recv() => {
                let Some(delivery) = next else {
                    warn!("request consumer closed by broker");
                    break;
                };
                let guard = shutdown.in_flight_guard();
                let span = info_span!("delivery", redelivered = delivery.redelivered);
                tokio::spawn(
                    {
                        let processor = processor.clone();
                        let broker = Arc::clone(&broker);
                        let responses_queue = Arc::clone(&responses_queue);
                        async move {
                            let _guard = guard;
                            handle_delivery(delivery, processor, broker, responses_queue).await;
                        }
                    }
                    .instrument(span),
                );
            }
            _ = &mut stop_rx => break,
        }
    }
    // Deliveries buffered but never taken go back to the queue on drop.
}

#[async_trait]
impl Intake for BrokerIntake {
    fn name(&self) -> &'static str {
        "broker"
    }

    async fn start(&self) -> anyhow::Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let deliveries = self.broker.consume(&self.config.requests_queue).await?;
        let (stop_tx, stop_rx) = oneshot::channel();
        self.shutdown.set_ready();
        let handle = tokio::spawn(consume_loop(
            deliveries,
            stop_rx,
            self.processor.clone(),
            Arc::clone(&self.broker),
            Arc::from(self.config.responses_queue.as_str()),
            Arc::clone(&self.shutdown),
        ));

        info!(queue = %self.config.requests_queue, "consuming requests");
        *running = Some(Running { stop_tx, handle });
        Ok(())
    }

    async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        self.shutdown.trigger_shutdown();
        let _ = running.stop_tx.send(());
        if let Err(e) = running.handle.await {
            warn!(error = %e, "request consumer task failed");
        }

        if self.shutdown.wait_for_drain(self.config.drain_timeout).await {
            info!("broker intake drained");
        } else {
            warn!(
                in_flight = self.shutdown.in_flight_count(),
                "drain timeout expired; unsettled deliveries return to the queue"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use courier_core::{Bind, BindError, Params};
    use serde_json::{json, Value};

    use super::*;
    use crate::broker::{BrokerError, MemoryBroker};
    use crate::service::{
        domain::GuessCounter, Content, Microservice, Operation, OperationError, OperationTable,
        SelfService,
    };

    /// `dice/roll?sides=N`; zero sides is an internal failure.
    struct Roll;

    struct RollRequest {
        sides: u32,
    }

    impl Bind for RollRequest {
        fn bind(params: &Params) -> Result<Self, BindError> {
            Ok(Self {
                sides: params.parse("sides")?,
            })
        }
    }

    #[async_trait]
    impl Operation for Roll {
        type Request = RollRequest;

        fn path(&self) -> &'static str {
            "roll"
        }

        async fn handle(&self, request: RollRequest) -> Result<Content, OperationError> {
            if request.sides == 0 {
                return Err(anyhow::anyhow!("die has no sides").into());
            }
            let mut content = Content::new();
            content.insert("rolled".into(), json!(request.sides));
            Ok(content)
        }
    }

    /// Delegates to a memory broker but refuses every publish.
    struct NoReplies(Arc<MemoryBroker>);

    #[async_trait]
    impl Broker for NoReplies {
        async fn publish(&self, queue: &str, _payload: Bytes) -> Result<(), BrokerError> {
            Err(BrokerError::Publish {
                queue: queue.to_string(),
                reason: "refused".into(),
            })
        }

        async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
            self.0.consume(queue).await
        }

        async fn close(&self) {
            self.0.close().await;
        }
    }

    fn processor() -> RequestProcessor {
        let dispatcher = Arc::new(Dispatcher::new());
        let counter = GuessCounter::with_initial(3);
        dispatcher
            .register_service(counter.id(), counter.operations())
            .unwrap();
        dispatcher
            .register_service("dice", OperationTable::new().with(Roll))
            .unwrap();
        let self_service = SelfService::new(&dispatcher);
        dispatcher
            .register_service(self_service.id(), self_service.operations())
            .unwrap();
        RequestProcessor::new(dispatcher, BrokerFields::default())
    }

    fn message(value: &Value) -> Vec<u8> {
        value.to_string().into_bytes()
    }

    fn reply_json(outcome: &Outcome) -> Value {
        serde_json::from_slice(outcome.reply.as_deref().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn malformed_json_is_acked_and_dropped() {
        let outcome = processor().process(b"{not json").await;
        assert_eq!(outcome, Outcome::ack(None));
    }

    #[tokio::test]
    async fn missing_correlation_id_is_acked_and_dropped() {
        let outcome = processor()
            .process(&message(&json!({
                "microservice_id": "guess-counter",
                "request_path": "get-count"
            })))
            .await;
        assert_eq!(outcome, Outcome::ack(None));
    }

    #[tokio::test]
    async fn missing_route_fields_are_acked_and_dropped() {
        let outcome = processor()
            .process(&message(&json!({"uuid": "u", "request_path": "get-count"})))
            .await;
        assert_eq!(outcome, Outcome::ack(None));
    }

    #[tokio::test]
    async fn unhosted_service_is_requeued() {
        let outcome = processor()
            .process(&message(&json!({
                "uuid": "u",
                "microservice_id": "bible-reader",
                "request_path": "random-verse"
            })))
            .await;
        assert_eq!(outcome, Outcome::requeue());
    }

    #[tokio::test]
    async fn unknown_path_is_acked_with_error_reply() {
        let outcome = processor()
            .process(&message(&json!({
                "uuid": "u-1",
                "microservice_id": "guess-counter",
                "request_path": "reset"
            })))
            .await;
        assert_eq!(outcome.disposition, Disposition::Ack);
        assert_eq!(reply_json(&outcome), json!({"uuid": "u-1", "error": 404}));
    }

    #[tokio::test]
    async fn success_is_acked_with_response() {
        let outcome = processor()
            .process(&message(&json!({
                "uuid": "u-2",
                "microservice_id": "guess-counter",
                "request_path": "get-count"
            })))
            .await;
        assert_eq!(outcome.disposition, Disposition::Ack);
        assert_eq!(reply_json(&outcome), json!({"uuid": "u-2", "count": 3}));
    }

    #[tokio::test]
    async fn get_ids_answers_over_the_broker() {
        let outcome = processor()
            .process(&message(&json!({
                "uuid": "p",
                "microservice_id": "service-wrapper",
                "request_path": "get-ids"
            })))
            .await;
        assert_eq!(
            reply_json(&outcome),
            json!({"uuid": "p", "version": 1, "ids": ["dice", "guess-counter"]})
        );
    }

    #[tokio::test]
    async fn binding_failure_is_acked_with_error_reply() {
        let outcome = processor()
            .process(&message(&json!({
                "uuid": "u-3",
                "microservice_id": "dice",
                "request_path": "roll",
                "sides": "x"
            })))
            .await;
        assert_eq!(outcome.disposition, Disposition::Ack);
        assert_eq!(reply_json(&outcome), json!({"uuid": "u-3", "error": 400}));
    }

    #[tokio::test]
    async fn handler_failure_is_requeued_without_reply() {
        let outcome = processor()
            .process(&message(&json!({
                "uuid": "u-4",
                "microservice_id": "dice",
                "request_path": "roll",
                "sides": 0
            })))
            .await;
        assert_eq!(outcome, Outcome::requeue());
    }

    #[tokio::test]
    async fn failed_reply_publish_requeues_the_request() {
        let memory = Arc::new(MemoryBroker::new());
        let mut requests = memory.consume("requests").await.unwrap();
        memory
            .publish(
                "requests",
                Bytes::from(
                    json!({"uuid": "u-5", "microservice_id": "dice", "request_path": "roll", "sides": 6})
                        .to_string(),
                ),
            )
            .await
            .unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(1), requests.recv())
            .await
            .unwrap()
            .unwrap();

        let broker: Arc<dyn Broker> = Arc::new(NoReplies(Arc::clone(&memory)));
        handle_delivery(delivery, processor(), broker, Arc::from("responses")).await;

        let stats = memory.stats();
        assert_eq!(stats.acked, 0);
        assert_eq!(stats.requeued, 1);
        let again = tokio::time::timeout(Duration::from_secs(1), requests.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(again.redelivered);
    }
}

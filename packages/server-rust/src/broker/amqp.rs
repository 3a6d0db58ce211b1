//! AMQP 0.9.1 broker (`RabbitMQ`) over `lapin`.
//!
//! Declares one direct exchange and binds each queue to it with the queue
//! name as routing key, so publishing to "queue X" means publishing to the
//! exchange with routing key X.
//!
//! The channel runs in confirm mode and each consumer has a bounded
//! prefetch. Dropping the receiver returned by `consume` cancels the
//! consumer and hands every delivery it still holds back to the queue.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{
    acker::Acker, BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
    ExchangeKind,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Acknowledger, Broker, BrokerError, Delivery, Disposition};
use crate::config::BrokerConfig;

const CONSUMER_PREFETCH: u16 = 16;

/// A connected AMQP broker with one channel.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
    exchange: String,
}

impl AmqpBroker {
    /// Connects and declares the exchange plus the requests and responses
    /// queues.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Connect` if the connection or any declaration
    /// fails.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let connect_err = |e: lapin::Error| BrokerError::Connect(e.to_string());

        let connection = Connection::connect(&config.amqp_uri(), ConnectionProperties::default())
            .await
            .map_err(connect_err)?;
        let channel = connection.create_channel().await.map_err(connect_err)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(connect_err)?;

        channel
            .exchange_declare(
                &config.exchange_name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(connect_err)?;

        for queue in [&config.requests_queue, &config.responses_queue] {
            channel
                .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
                .await
                .map_err(connect_err)?;
            channel
                .queue_bind(
                    queue,
                    &config.exchange_name,
                    queue,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(connect_err)?;
        }

        info!(
            host = %config.host,
            port = config.port,
            exchange = %config.exchange_name,
            "connected to broker"
        );

        Ok(Self {
            connection,
            channel,
            exchange: config.exchange_name.clone(),
        })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn publish(&self, queue: &str, payload: Bytes) -> Result<(), BrokerError> {
        let publish_err = |e: lapin::Error| BrokerError::Publish {
            queue: queue.to_string(),
            reason: e.to_string(),
        };
        let confirmation = self
            .channel
            .basic_publish(
                &self.exchange,
                queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await
            .map_err(publish_err)?
            .await
            .map_err(publish_err)?;
        if confirmation.is_nack() {
            return Err(BrokerError::Publish {
                queue: queue.to_string(),
                reason: "broker nacked the message".into(),
            });
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
        let consume_err = |e: lapin::Error| BrokerError::Consume {
            queue: queue.to_string(),
            reason: e.to_string(),
        };
        let tag = format!("courier-{}", uuid::Uuid::new_v4());
        self.channel
            .basic_qos(CONSUMER_PREFETCH, BasicQosOptions::default())
            .await
            .map_err(consume_err)?;
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(consume_err)?;

        let (tx, rx) = mpsc::channel(usize::from(CONSUMER_PREFETCH));
        tokio::spawn(forward(
            consumer,
            self.channel.clone(),
            tag,
            queue.to_string(),
            tx,
        ));
        Ok(rx)
    }

    async fn close(&self) {
        if let Err(e) = self.channel.close(200, "closing").await {
            debug!(error = %e, "channel close failed");
        }
        if let Err(e) = self.connection.close(200, "closing").await {
            debug!(error = %e, "connection close failed");
        }
    }
}

/// Moves deliveries from the lapin consumer into `tx` until either side
/// goes away. When the receiver is dropped the consumer is cancelled and
/// whatever it still delivers is requeued.
async fn forward(
    mut consumer: Consumer,
    channel: Channel,
    tag: String,
    queue: String,
    tx: mpsc::Sender<Delivery>,
) {
    loop {
        let next = tokio::select! {
            next = consumer.next() => next,
            () = tx.closed() => break,
        };
        match next {
            Some(Ok(delivery)) => {
                let wrapped = Delivery::new(
                    Bytes::from(delivery.data),
                    delivery.redelivered,
                    Box::new(AmqpAcker::new(delivery.acker)),
                );
                // On failure the returned delivery drops and requeues itself.
                if tx.send(wrapped).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(queue = %queue, error = %e, "consumer error");
                return;
            }
            None => {
                debug!(queue = %queue, "consumer closed by broker");
                return;
            }
        }
    }

    if let Err(e) = channel
        .basic_cancel(&tag, BasicCancelOptions::default())
        .await
    {
        warn!(queue = %queue, error = %e, "consumer cancel failed");
        return;
    }
    // Prefetched messages still arrive until the cancel is confirmed.
    let mut returned = 0u32;
    while let Some(Ok(delivery)) = consumer.next().await {
        if let Err(e) = delivery.acker.nack(requeue()).await {
            warn!(queue = %queue, error = %e, "requeue after cancel failed");
        }
        returned += 1;
    }
    debug!(queue = %queue, returned, "consumer cancelled");
}

fn requeue() -> BasicNackOptions {
    BasicNackOptions {
        requeue: true,
        ..BasicNackOptions::default()
    }
}

/// Settles one AMQP delivery. Dropped unsettled, it nacks with requeue.
struct AmqpAcker {
    acker: Option<Acker>,
}

impl AmqpAcker {
    fn new(acker: Acker) -> Self {
        Self { acker: Some(acker) }
    }
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn settle(self: Box<Self>, disposition: Disposition) -> Result<(), BrokerError> {
        let mut this = self;
        let Some(acker) = this.acker.take() else {
            return Ok(());
        };
        let result = match disposition {
            Disposition::Ack => acker.ack(BasicAckOptions::default()).await,
            Disposition::Requeue => acker.nack(requeue()).await,
        };
        result
            .map(|_| ())
            .map_err(|e| BrokerError::Settle(e.to_string()))
    }
}

impl Drop for AmqpAcker {
    fn drop(&mut self) {
        let Some(acker) = self.acker.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = acker.nack(requeue()).await {
                        warn!(error = %e, "requeue of dropped delivery failed");
                    }
                });
            }
            Err(_) => warn!("delivery dropped outside a runtime; the broker requeues it on close"),
        }
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::{Acker, BusError, Delivery, DeliveryStream, ExchangeKind, MessageBus, Settlement};

/// Exchange every declared queue dead-letters into.
pub const DEAD_LETTER_EXCHANGE: &str = "dispatch.dead_letter";
pub const DEAD_LETTER_QUEUE: &str = "dispatch.dead_letters";

/// Persistent delivery mode.
const PERSISTENT: u8 = 2;

impl From<lapin::Error> for BusError {
    fn from(err: lapin::Error) -> Self {
        BusError::Broker(err.to_string())
    }
}

/// RabbitMQ-backed bus. Exchanges and queues are durable, messages persistent.
/// Publishing shares one channel; every consumer gets its own channel so the
/// prefetch window applies per queue.
pub struct AmqpBus {
    connection: Connection,
    channel: Channel,
    prefetch: u16,
}

impl AmqpBus {
    pub async fn connect(url: &str, prefetch: usize) -> Result<Self, BusError> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        let bus = Self {
            connection,
            channel,
            prefetch: u16::try_from(prefetch.max(1)).unwrap_or(u16::MAX),
        };
        bus.declare_dead_letters().await?;

        info!(prefetch = bus.prefetch, "connected to AMQP broker");
        Ok(bus)
    }

    async fn declare_dead_letters(&self) -> Result<(), BusError> {
        self.channel
            .exchange_declare(
                DEAD_LETTER_EXCHANGE,
                lapin::ExchangeKind::Fanout,
                durable_exchange(),
                FieldTable::default(),
            )
            .await?;
        self.channel
            .queue_declare(DEAD_LETTER_QUEUE, durable_queue(), FieldTable::default())
            .await?;
        self.channel
            .queue_bind(
                DEAD_LETTER_QUEUE,
                DEAD_LETTER_EXCHANGE,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }
}

fn durable_exchange() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        ..ExchangeDeclareOptions::default()
    }
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..QueueDeclareOptions::default()
    }
}

#[async_trait]
impl MessageBus for AmqpBus {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BusError> {
        let kind = match kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        self.channel
            .exchange_declare(name, kind, durable_exchange(), FieldTable::default())
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BusError> {
        let mut arguments = FieldTable::default();
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(DEAD_LETTER_EXCHANGE.into()),
        );
        self.channel
            .queue_declare(name, durable_queue(), arguments)
            .await?;
        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BusError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> Result<(), BusError> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT);
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BusError> {
        let handle = Handle::try_current().map_err(|_| BusError::Closed)?;
        let channel = self.connection.create_channel().await?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await?;
        let consumer = channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        debug!(queue, prefetch = self.prefetch, "amqp consumer started");

        let queue = queue.to_string();
        let deliveries = consumer.filter_map(move |delivery| {
            // The stream owns its channel; dropping the stream closes it and
            // the broker requeues anything left unacknowledged.
            let _channel = &channel;
            let handle = handle.clone();
            let queue = queue.clone();
            async move {
                match delivery {
                    Ok(delivery) => Some(Delivery::new(
                        delivery.exchange.as_str().to_string(),
                        delivery.routing_key.as_str().to_string(),
                        Arc::from(delivery.data),
                        delivery.redelivered,
                        Box::new(AmqpAcker {
                            acker: delivery.acker,
                            handle,
                        }),
                    )),
                    Err(err) => {
                        warn!(queue = %queue, error = %err, "amqp consumer error");
                        None
                    }
                }
            }
        });

        Ok(deliveries.boxed())
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
    handle: Handle,
}

impl Acker for AmqpAcker {
    fn settle(self: Box<Self>, settlement: Settlement) {
        let AmqpAcker { acker, handle } = *self;
        handle.spawn(async move {
            let result = match settlement {
                Settlement::Ack => acker.ack(BasicAckOptions::default()).await,
                Settlement::Requeue => {
                    acker
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..BasicNackOptions::default()
                        })
                        .await
                }
                Settlement::DeadLetter => {
                    acker
                        .nack(BasicNackOptions {
                            requeue: false,
                            ..BasicNackOptions::default()
                        })
                        .await
                }
            };
            if let Err(err) = result {
                warn!(?settlement, error = %err, "failed to settle amqp delivery");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use uuid::Uuid;

    use super::AmqpBus;
    use crate::bus::{ExchangeKind, MessageBus};

    async fn bus() -> Option<AmqpBus> {
        let Ok(url) = std::env::var("AMQP_URL") else {
            eprintln!("Skipping: AMQP_URL not set");
            return None;
        };
        Some(AmqpBus::connect(&url, 10).await.expect("connect to AMQP_URL"))
    }

    fn unique(prefix: &str) -> String {
        format!("{prefix}.{}", Uuid::new_v4().simple())
    }

    #[tokio::test]
    async fn topic_binding_delivers_and_requeues_on_nack() {
        let Some(bus) = bus().await else { return };
        let exchange = unique("test_topic");
        let queue = unique("test_responses");
        bus.declare_exchange(&exchange, ExchangeKind::Topic).await.unwrap();
        bus.declare_queue(&queue).await.unwrap();
        bus.bind(&queue, &exchange, "driver.response.*").await.unwrap();

        bus.publish(&exchange, "driver.status.x", b"status".to_vec())
            .await
            .unwrap();
        bus.publish(&exchange, "driver.response.r1", b"response".to_vec())
            .await
            .unwrap();

        let mut deliveries = bus.consume(&queue).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), deliveries.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.exchange, exchange);
        assert_eq!(first.routing_key, "driver.response.r1");
        assert_eq!(&*first.body, b"response");
        assert!(!first.redelivered);
        first.nack(true);

        let again = tokio::time::timeout(Duration::from_secs(5), deliveries.next())
            .await
            .unwrap()
            .unwrap();
        assert!(again.redelivered);
        again.ack();

        let nothing = tokio::time::timeout(Duration::from_millis(200), deliveries.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn fanout_ignores_routing_key() {
        let Some(bus) = bus().await else { return };
        let exchange = unique("test_fanout");
        let queue = unique("test_locations");
        bus.declare_exchange(&exchange, ExchangeKind::Fanout).await.unwrap();
        bus.declare_queue(&queue).await.unwrap();
        bus.bind(&queue, &exchange, "").await.unwrap();

        bus.publish(&exchange, "location.anything", b"{}".to_vec())
            .await
            .unwrap();

        let mut deliveries = bus.consume(&queue).await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(5), deliveries.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.routing_key, "location.anything");
        delivery.ack();
    }
}

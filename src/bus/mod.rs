//! Asynchronous messaging between services.
//!
//! [`MessageBus`] is the broker seam: exchanges, queues, bindings, publish and
//! a manually-acknowledged consume stream. [`memory::InMemoryBus`] implements it
//! inside one process and [`amqp::AmqpBus`] against a RabbitMQ broker; the typed layer on top is [`Publisher`] for producers and
//! [`consumer::run_consumer`] for queue workers.

pub mod amqp;
pub mod consumer;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::AppError;
use crate::models::events::{Event, DRIVER_TOPIC, LOCATION_FANOUT, RIDE_REQUESTED_KEY, RIDE_TOPIC};

pub const DRIVER_MATCHING_QUEUE: &str = "driver_matching";
pub const DRIVER_RESPONSES_QUEUE: &str = "ride_service_driver_responses";
pub const DRIVER_STATUS_QUEUE: &str = "ride_service_driver_status";
pub const LOCATIONS_QUEUE: &str = "ride_service_locations";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Fanout,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("exchange {name} already declared as {existing:?}")]
    ExchangeMismatch { name: String, existing: ExchangeKind },

    #[error("queue {0} already has a consumer")]
    ConsumerExists(String),

    #[error("publish to {0} timed out")]
    Timeout(String),

    #[error("bus is closed")]
    Closed,

    #[error("broker error: {0}")]
    Broker(String),
}

impl From<BusError> for AppError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Timeout(_) | BusError::Closed | BusError::Broker(_) => {
                AppError::Unavailable(err.to_string())
            }
            _ => AppError::Internal(err.to_string()),
        }
    }
}

/// How a consumer settled one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Requeue,
    DeadLetter,
}

/// Broker-side handle used to settle a delivery.
pub trait Acker: Send {
    fn settle(self: Box<Self>, settlement: Settlement);
}

/// One message handed to a consumer. Settled exactly once: by [`Delivery::ack`],
/// by [`Delivery::nack`], or by being dropped, which requeues it.
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub body: Arc<[u8]>,
    pub redelivered: bool,
    acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    pub fn new(
        exchange: String,
        routing_key: String,
        body: Arc<[u8]>,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            exchange,
            routing_key,
            body,
            redelivered,
            acker: Some(acker),
        }
    }

    pub fn ack(mut self) {
        self.settle(Settlement::Ack);
    }

    pub fn nack(mut self, requeue: bool) {
        let settlement = if requeue {
            Settlement::Requeue
        } else {
            Settlement::DeadLetter
        };
        self.settle(settlement);
    }

    fn settle(&mut self, settlement: Settlement) {
        if let Some(acker) = self.acker.take() {
            acker.settle(settlement);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.settle(Settlement::Requeue);
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Delivery>;

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BusError>;

    async fn declare_queue(&self, name: &str) -> Result<(), BusError>;

    async fn bind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BusError>;

    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>)
    -> Result<(), BusError>;

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BusError>;
}

/// AMQP topic matching: words are dot-separated, `*` matches exactly one word
/// and `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((first, key_rest)) => (word == "*" || word == *first) && match_words(rest, key_rest),
            None => false,
        },
    }
}

/// Typed producer with a bounded publish time.
#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn MessageBus>,
    timeout: Duration,
}

impl Publisher {
    pub fn new(bus: Arc<dyn MessageBus>, timeout: Duration) -> Self {
        Self { bus, timeout }
    }

    pub async fn publish(&self, event: &Event) -> Result<(), AppError> {
        let body = event.encode()?;
        let exchange = event.exchange();
        let routing_key = event.routing_key();

        tokio::time::timeout(self.timeout, self.bus.publish(exchange, &routing_key, body))
            .await
            .map_err(|_| BusError::Timeout(exchange.to_string()))??;

        debug!(exchange, routing_key = %routing_key, "event published");
        Ok(())
    }
}

/// Declares every exchange, queue and binding the services rely on. Idempotent.
pub async fn declare_topology(bus: &dyn MessageBus) -> Result<(), BusError> {
    bus.declare_exchange(RIDE_TOPIC, ExchangeKind::Topic).await?;
    bus.declare_exchange(DRIVER_TOPIC, ExchangeKind::Topic).await?;
    bus.declare_exchange(LOCATION_FANOUT, ExchangeKind::Fanout).await?;

    bus.declare_queue(DRIVER_MATCHING_QUEUE).await?;
    bus.declare_queue(DRIVER_RESPONSES_QUEUE).await?;
    bus.declare_queue(DRIVER_STATUS_QUEUE).await?;
    bus.declare_queue(LOCATIONS_QUEUE).await?;

    bus.bind(DRIVER_MATCHING_QUEUE, RIDE_TOPIC, RIDE_REQUESTED_KEY)
        .await?;
    bus.bind(DRIVER_RESPONSES_QUEUE, DRIVER_TOPIC, "driver.response.*")
        .await?;
    bus.bind(DRIVER_STATUS_QUEUE, DRIVER_TOPIC, "driver.status.*")
        .await?;
    bus.bind(LOCATIONS_QUEUE, LOCATION_FANOUT, "").await?;

    info!("bus topology declared");
    Ok(())
}

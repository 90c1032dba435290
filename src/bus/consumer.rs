use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{Delivery, MessageBus};
use crate::error::{AppError, Disposition};
use crate::models::events::Event;
use crate::observability::metrics::Metrics;

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<(), AppError>;
}

/// Drains one queue until shutdown. Each delivery is decoded, handed to
/// `handler`, then settled according to the outcome: success acks, transient
/// failures are requeued, everything else is dead-lettered.
pub async fn run_consumer(
    bus: Arc<dyn MessageBus>,
    queue: &'static str,
    handler: Arc<dyn MessageHandler>,
    metrics: Metrics,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), AppError> {
    let mut deliveries = bus.consume(queue).await?;
    info!(queue, "consumer started");

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            next = deliveries.next() => {
                let Some(delivery) = next else {
                    warn!(queue, "delivery stream ended");
                    break;
                };
                process(queue, handler.as_ref(), &metrics, delivery).await;
            }
        }
    }

    info!(queue, "consumer stopped");
    Ok(())
}

async fn process(queue: &str, handler: &dyn MessageHandler, metrics: &Metrics, delivery: Delivery) {
    let outcome = match Event::decode(&delivery.exchange, &delivery.routing_key, &delivery.body) {
        Ok(event) => handler.handle(event).await,
        Err(err) => Err(err),
    };

    let label = match outcome {
        Ok(()) => {
            debug!(queue, routing_key = %delivery.routing_key, "message handled");
            delivery.ack();
            "ack"
        }
        Err(err) => match err.disposition() {
            Disposition::Requeue => {
                warn!(
                    queue,
                    routing_key = %delivery.routing_key,
                    redelivered = delivery.redelivered,
                    error = %err,
                    "transient failure, requeueing"
                );
                delivery.nack(true);
                Disposition::Requeue.as_str()
            }
            Disposition::DeadLetter => {
                error!(
                    queue,
                    routing_key = %delivery.routing_key,
                    error = %err,
                    "message rejected"
                );
                delivery.nack(false);
                Disposition::DeadLetter.as_str()
            }
        },
    };

    metrics
        .bus_messages_total
        .with_label_values(&[queue, label])
        .inc();
}

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::{
    topic_matches, Acker, BusError, Delivery, DeliveryStream, ExchangeKind, MessageBus, Settlement,
};

#[derive(Debug, Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    body: Arc<[u8]>,
    redelivered: bool,
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub body: Arc<[u8]>,
    pub rejected_at: DateTime<Utc>,
}

struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<(String, String)>,
}

/// Oldest dead letters are discarded past this many.
pub const DEAD_LETTER_LIMIT: usize = 1024;

/// Rejected messages kept for inspection, newest last.
struct DeadLetters {
    letters: VecDeque<DeadLetter>,
    limit: usize,
}

impl DeadLetters {
    fn push(&mut self, letter: DeadLetter) {
        if self.letters.len() == self.limit {
            if let Some(dropped) = self.letters.pop_front() {
                warn!(queue = %dropped.queue, routing_key = %dropped.routing_key, "dead letter store full, discarding oldest");
            }
        }
        self.letters.push_back(letter);
    }
}

struct Queue {
    tx: mpsc::UnboundedSender<Message>,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<Message>>>,
}

/// Single-process broker. Queues are unbounded; consumers are limited by a
/// per-stream prefetch window. Each queue serves one consumer at a time and
/// keeps its backlog when that consumer goes away.
pub struct InMemoryBus {
    exchanges: DashMap<String, Exchange>,
    queues: DashMap<String, Queue>,
    dead_letters: Arc<Mutex<DeadLetters>>,
    prefetch: usize,
}

impl InMemoryBus {
    pub fn new(prefetch: usize) -> Self {
        Self {
            exchanges: DashMap::new(),
            queues: DashMap::new(),
            dead_letters: Arc::new(Mutex::new(DeadLetters {
                letters: VecDeque::new(),
                limit: DEAD_LETTER_LIMIT,
            })),
            prefetch: prefetch.max(1),
        }
    }

    pub fn with_dead_letter_limit(self, limit: usize) -> Self {
        self.lock_dead_letters().limit = limit.max(1);
        self
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock_dead_letters().letters.iter().cloned().collect()
    }

    /// Removes and returns every stored dead letter.
    pub fn drain_dead_letters(&self) -> Vec<DeadLetter> {
        self.lock_dead_letters().letters.drain(..).collect()
    }

    fn lock_dead_letters(&self) -> std::sync::MutexGuard<'_, DeadLetters> {
        self.dead_letters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BusError> {
        let entry = self.exchanges.entry(name.to_string()).or_insert_with(|| Exchange {
            kind,
            bindings: Vec::new(),
        });

        if entry.kind != kind {
            return Err(BusError::ExchangeMismatch {
                name: name.to_string(),
                existing: entry.kind,
            });
        }
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BusError> {
        self.queues.entry(name.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            Queue {
                tx,
                rx: Arc::new(AsyncMutex::new(rx)),
            }
        });
        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<(), BusError> {
        if !self.queues.contains_key(queue) {
            return Err(BusError::UnknownQueue(queue.to_string()));
        }

        let mut exchange_entry = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BusError::UnknownExchange(exchange.to_string()))?;

        let binding = (queue.to_string(), pattern.to_string());
        if !exchange_entry.bindings.contains(&binding) {
            exchange_entry.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
    ) -> Result<(), BusError> {
        let exchange_entry = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| BusError::UnknownExchange(exchange.to_string()))?;

        let body: Arc<[u8]> = body.into();
        let mut routed = 0;

        for (queue_name, pattern) in &exchange_entry.bindings {
            let matches = match exchange_entry.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(pattern, routing_key),
            };
            if !matches {
                continue;
            }

            let Some(queue) = self.queues.get(queue_name) else {
                continue;
            };
            let message = Message {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.clone(),
                redelivered: false,
            };
            if queue.tx.send(message).is_ok() {
                routed += 1;
            }
        }

        if routed == 0 {
            debug!(exchange, routing_key, "message was unroutable");
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BusError> {
        let (receiver, requeue) = {
            let entry = self
                .queues
                .get(queue)
                .ok_or_else(|| BusError::UnknownQueue(queue.to_string()))?;
            let receiver = entry
                .rx
                .clone()
                .try_lock_owned()
                .map_err(|_| BusError::ConsumerExists(queue.to_string()))?;
            (receiver, entry.tx.clone())
        };

        let consumer = Consumer {
            queue: queue.to_string(),
            receiver,
            requeue,
            permits: Arc::new(Semaphore::new(self.prefetch)),
            dead_letters: self.dead_letters.clone(),
        };

        let deliveries = stream::unfold(consumer, |mut consumer| async move {
            let delivery = consumer.next().await?;
            Some((delivery, consumer))
        });
        Ok(Box::pin(deliveries))
    }
}

struct Consumer {
    queue: String,
    receiver: OwnedMutexGuard<mpsc::UnboundedReceiver<Message>>,
    requeue: mpsc::UnboundedSender<Message>,
    permits: Arc<Semaphore>,
    dead_letters: Arc<Mutex<DeadLetters>>,
}

impl Consumer {
    async fn next(&mut self) -> Option<Delivery> {
        // The prefetch window is taken before receiving so an unsettled
        // backlog stops the stream instead of piling up in memory.
        let permit = self.permits.clone().acquire_owned().await.ok()?;
        let message = self.receiver.recv().await?;

        let acker = MemoryAcker {
            queue: self.queue.clone(),
            message: message.clone(),
            requeue: self.requeue.clone(),
            dead_letters: self.dead_letters.clone(),
            _permit: permit,
        };

        Some(Delivery::new(
            message.exchange,
            message.routing_key,
            message.body,
            message.redelivered,
            Box::new(acker),
        ))
    }
}

struct MemoryAcker {
    queue: String,
    message: Message,
    requeue: mpsc::UnboundedSender<Message>,
    dead_letters: Arc<Mutex<DeadLetters>>,
    _permit: OwnedSemaphorePermit,
}

impl Acker for MemoryAcker {
    fn settle(self: Box<Self>, settlement: Settlement) {
        match settlement {
            Settlement::Ack => {}
            Settlement::Requeue => {
                let mut message = self.message;
                message.redelivered = true;
                if self.requeue.send(message).is_err() {
                    warn!(queue = %self.queue, "queue closed, requeued message lost");
                }
            }
            Settlement::DeadLetter => {
                let letter = DeadLetter {
                    queue: self.queue,
                    exchange: self.message.exchange,
                    routing_key: self.message.routing_key,
                    body: self.message.body,
                    rejected_at: Utc::now(),
                };
                self.dead_letters
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(letter);
            }
        }
    }
}

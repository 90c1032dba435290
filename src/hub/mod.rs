//! Registry of live client connections.
//!
//! All membership state is owned by [`HubLoop`], a single task draining three
//! request channels (register, unregister, deliver). [`Hub`] handles are cheap
//! clones that only ever talk to that task, so senders never contend on a lock
//! and a slow client can never stall the loop: an outbound queue that is full
//! gets its connection dropped instead of blocking delivery.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Role;
use crate::config::HubConfig;
use crate::error::AppError;
use crate::models::frames::ServerFrame;
use crate::observability::metrics::Metrics;

pub type ConnectionId = Uuid;

/// Serialized frame shared between every queue it is delivered to.
pub type Outbound = Arc<str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub user_id: Uuid,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Connection(ConnectionId),
    User(Uuid),
    Role(Role),
    All,
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub is not running")]
    Closed,
}

impl From<HubError> for AppError {
    fn from(err: HubError) -> Self {
        AppError::Unavailable(err.to_string())
    }
}

/// Read-only view of who is connected, republished after every change.
#[derive(Debug, Default)]
pub struct Membership {
    users: HashMap<Uuid, usize>,
    connections: usize,
}

impl Membership {
    pub fn is_connected(&self, user_id: &Uuid) -> bool {
        self.users.contains_key(user_id)
    }

    pub fn connections(&self) -> usize {
        self.connections
    }
}

struct Registration {
    info: ConnectionInfo,
    outbound: mpsc::Sender<Outbound>,
    done: oneshot::Sender<()>,
}

struct Unregistration {
    id: ConnectionId,
    done: oneshot::Sender<()>,
}

struct Delivery {
    target: Target,
    payload: Outbound,
}

#[derive(Clone)]
pub struct Hub {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<Unregistration>,
    deliver_tx: mpsc::Sender<Delivery>,
    membership: watch::Receiver<Arc<Membership>>,
    outbound_queue_size: usize,
}

impl Hub {
    pub fn new(config: &HubConfig, metrics: Metrics) -> (Self, HubLoop) {
        let (register_tx, register_rx) = mpsc::channel(config.channel_size.max(1));
        let (unregister_tx, unregister_rx) = mpsc::channel(config.channel_size.max(1));
        let (deliver_tx, deliver_rx) = mpsc::channel(config.channel_size.max(1));
        let (membership_tx, membership) = watch::channel(Arc::new(Membership::default()));

        let hub = Self {
            register_tx,
            unregister_tx,
            deliver_tx,
            membership,
            outbound_queue_size: config.outbound_queue_size.max(1),
        };
        let hub_loop = HubLoop {
            register_rx,
            unregister_rx,
            deliver_rx,
            membership_tx,
            connections: HashMap::new(),
            by_user: HashMap::new(),
            metrics,
        };

        (hub, hub_loop)
    }

    /// Adds an authenticated connection and returns the receiving end of its
    /// bounded outbound queue. Resolves once the connection is visible to
    /// `is_connected` and to deliveries.
    pub async fn register(
        &self,
        user_id: Uuid,
        role: Role,
    ) -> Result<(ConnectionInfo, mpsc::Receiver<Outbound>), HubError> {
        let info = ConnectionInfo {
            id: Uuid::new_v4(),
            user_id,
            role,
        };
        let (outbound, outbound_rx) = mpsc::channel(self.outbound_queue_size);
        let (done, registered) = oneshot::channel();

        self.register_tx
            .send(Registration {
                info,
                outbound,
                done,
            })
            .await
            .map_err(|_| HubError::Closed)?;
        registered.await.map_err(|_| HubError::Closed)?;

        Ok((info, outbound_rx))
    }

    /// Removes a connection and closes its outbound queue. Unknown ids are a no-op.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        let (done, unregistered) = oneshot::channel();
        self.unregister_tx
            .send(Unregistration { id, done })
            .await
            .map_err(|_| HubError::Closed)?;
        unregistered.await.map_err(|_| HubError::Closed)
    }

    pub async fn send(&self, target: Target, frame: &ServerFrame) -> Result<(), AppError> {
        let payload: Outbound = frame.to_text()?.into();
        self.deliver_tx
            .send(Delivery { target, payload })
            .await
            .map_err(|_| HubError::Closed)?;
        Ok(())
    }

    pub async fn send_to_user(&self, user_id: Uuid, frame: &ServerFrame) -> Result<(), AppError> {
        self.send(Target::User(user_id), frame).await
    }

    pub async fn send_to_role(&self, role: Role, frame: &ServerFrame) -> Result<(), AppError> {
        self.send(Target::Role(role), frame).await
    }

    pub async fn broadcast(&self, frame: &ServerFrame) -> Result<(), AppError> {
        self.send(Target::All, frame).await
    }

    pub fn is_connected(&self, user_id: Uuid) -> bool {
        self.membership.borrow().is_connected(&user_id)
    }

    pub fn connection_count(&self) -> usize {
        self.membership.borrow().connections()
    }
}

struct Entry {
    info: ConnectionInfo,
    outbound: mpsc::Sender<Outbound>,
}

pub struct HubLoop {
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<Unregistration>,
    deliver_rx: mpsc::Receiver<Delivery>,
    membership_tx: watch::Sender<Arc<Membership>>,
    connections: HashMap<ConnectionId, Entry>,
    by_user: HashMap<Uuid, HashSet<ConnectionId>>,
    metrics: Metrics,
}

impl HubLoop {
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("hub started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(registration) = self.register_rx.recv() => {
                    self.add(registration.info, registration.outbound);
                    let _ = registration.done.send(());
                }
                Some(unregistration) = self.unregister_rx.recv() => {
                    self.remove(unregistration.id);
                    let _ = unregistration.done.send(());
                }
                Some(delivery) = self.deliver_rx.recv() => {
                    self.deliver(delivery);
                }
                else => break,
            }
        }

        let open = self.connections.len();
        self.connections.clear();
        self.by_user.clear();
        self.publish_membership();
        info!(open_connections = open, "hub stopped");
    }

    fn add(&mut self, info: ConnectionInfo, outbound: mpsc::Sender<Outbound>) {
        self.by_user.entry(info.user_id).or_default().insert(info.id);
        self.connections.insert(info.id, Entry { info, outbound });
        self.publish_membership();

        info!(
            connection_id = %info.id,
            user_id = %info.user_id,
            role = %info.role,
            "connection registered"
        );
    }

    fn remove(&mut self, id: ConnectionId) -> bool {
        let Some(entry) = self.connections.remove(&id) else {
            return false;
        };

        if let Some(ids) = self.by_user.get_mut(&entry.info.user_id) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_user.remove(&entry.info.user_id);
            }
        }
        self.publish_membership();

        info!(connection_id = %id, user_id = %entry.info.user_id, "connection unregistered");
        true
    }

    fn deliver(&mut self, delivery: Delivery) {
        let targets: Vec<ConnectionId> = match delivery.target {
            Target::Connection(id) => vec![id],
            Target::User(user_id) => self
                .by_user
                .get(&user_id)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default(),
            Target::Role(role) => self
                .connections
                .values()
                .filter(|entry| entry.info.role == role)
                .map(|entry| entry.info.id)
                .collect(),
            Target::All => self.connections.keys().copied().collect(),
        };

        if targets.is_empty() {
            debug!(target = ?delivery.target, "no connection for delivery");
            return;
        }

        let mut slow = Vec::new();
        for id in targets {
            let Some(entry) = self.connections.get(&id) else {
                continue;
            };
            match entry.outbound.try_send(delivery.payload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(connection_id = %id, user_id = %entry.info.user_id, "outbound queue full, dropping connection");
                    slow.push(id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(connection_id = %id, "outbound queue closed");
                    slow.push(id);
                }
            }
        }

        for id in slow {
            if self.remove(id) {
                self.metrics.hub_dropped_connections_total.inc();
            }
        }
    }

    fn publish_membership(&self) {
        let users = self
            .by_user
            .iter()
            .map(|(user_id, ids)| (*user_id, ids.len()))
            .collect();
        let membership = Membership {
            users,
            connections: self.connections.len(),
        };

        self.metrics.hub_connections.set(membership.connections as i64);
        self.membership_tx.send_replace(Arc::new(membership));
    }
}

pub mod dispatch;
pub mod fare;
pub mod lifecycle;
pub mod location;
pub mod reconciler;
pub mod relay;
pub mod rides;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::error;

use crate::bus::consumer::{run_consumer, MessageHandler};
use crate::bus::{
    DRIVER_MATCHING_QUEUE, DRIVER_RESPONSES_QUEUE, DRIVER_STATUS_QUEUE, LOCATIONS_QUEUE,
};
use crate::state::AppState;

/// Starts one consumer task per queue. Each stops when `shutdown` flips.
pub fn spawn_consumers(state: &AppState, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let handlers: [(&'static str, Arc<dyn MessageHandler>); 4] = [
        (DRIVER_MATCHING_QUEUE, state.dispatch.clone()),
        (DRIVER_RESPONSES_QUEUE, state.reconciler.clone()),
        (DRIVER_STATUS_QUEUE, state.status_relay.clone()),
        (LOCATIONS_QUEUE, state.location_relay.clone()),
    ];

    handlers
        .into_iter()
        .map(|(queue, handler)| {
            let bus = state.bus.clone();
            let metrics = state.metrics.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(err) = run_consumer(bus, queue, handler, metrics, shutdown).await {
                    error!(queue, error = %err, "consumer failed");
                }
            })
        })
        .collect()
}

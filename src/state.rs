use std::sync::Arc;
use std::time::Duration;

use crate::auth::CredentialVerifier;
use crate::bus::{MessageBus, Publisher};
use crate::config::{Config, HubConfig};
use crate::engine::dispatch::DispatchPipeline;
use crate::engine::lifecycle::DriverLifecycle;
use crate::engine::location::LocationService;
use crate::engine::reconciler::{DriverResponder, ResponseReconciler};
use crate::engine::relay::{LocationRelay, StatusRelay};
use crate::engine::rides::RideService;
use crate::hub::{Hub, HubLoop};
use crate::observability::metrics::Metrics;
use crate::store::{DriverRepository, LocationRepository, RideRepository, Store};

#[derive(Clone)]
pub struct Repositories {
    pub rides: Arc<dyn RideRepository>,
    pub drivers: Arc<dyn DriverRepository>,
    pub locations: Arc<dyn LocationRepository>,
}

impl Repositories {
    pub fn from_store<S: Store + 'static>(store: Arc<S>) -> Self {
        Self {
            rides: store.clone(),
            drivers: store.clone(),
            locations: store,
        }
    }
}

pub struct AppState {
    pub hub: Hub,
    pub hub_config: HubConfig,
    pub request_timeout: Duration,
    pub bus: Arc<dyn MessageBus>,
    pub repos: Repositories,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub metrics: Metrics,
    pub rides: RideService,
    pub lifecycle: DriverLifecycle,
    pub locations: LocationService,
    pub responder: DriverResponder,
    pub dispatch: Arc<DispatchPipeline>,
    pub reconciler: Arc<ResponseReconciler>,
    pub status_relay: Arc<StatusRelay>,
    pub location_relay: Arc<LocationRelay>,
}

impl AppState {
    /// Wires every service around one hub. The returned loop must be spawned
    /// before any connection registers.
    pub fn new(
        config: &Config,
        repos: Repositories,
        bus: Arc<dyn MessageBus>,
        verifier: Arc<dyn CredentialVerifier>,
        metrics: Metrics,
    ) -> (Self, HubLoop) {
        let (hub, hub_loop) = Hub::new(&config.hub, metrics.clone());
        let publisher = Publisher::new(bus.clone(), config.bus.publish_timeout);

        let state = Self {
            rides: RideService::new(
                repos.rides.clone(),
                repos.locations.clone(),
                publisher.clone(),
                hub.clone(),
            ),
            lifecycle: DriverLifecycle::new(
                repos.rides.clone(),
                repos.drivers.clone(),
                repos.locations.clone(),
                publisher.clone(),
            ),
            locations: LocationService::new(
                repos.locations.clone(),
                publisher.clone(),
                metrics.clone(),
                config.location.min_interval,
            ),
            responder: DriverResponder::new(
                repos.rides.clone(),
                repos.drivers.clone(),
                repos.locations.clone(),
                publisher,
            ),
            dispatch: Arc::new(DispatchPipeline::new(
                repos.drivers.clone(),
                hub.clone(),
                metrics.clone(),
                config.dispatch.clone(),
            )),
            reconciler: Arc::new(ResponseReconciler::new(
                repos.rides.clone(),
                hub.clone(),
                metrics.clone(),
            )),
            status_relay: Arc::new(StatusRelay::new(repos.rides.clone(), hub.clone())),
            location_relay: Arc::new(LocationRelay::new(repos.rides.clone(), hub.clone())),
            hub,
            hub_config: config.hub.clone(),
            request_timeout: config.request_timeout,
            bus,
            repos,
            verifier,
            metrics,
        };

        (state, hub_loop)
    }
}

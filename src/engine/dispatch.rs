use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::bus::consumer::MessageHandler;
use crate::config::DispatchConfig;
use crate::engine::fare;
use crate::error::AppError;
use crate::geo;
use crate::hub::Hub;
use crate::models::events::{Event, RideRequested};
use crate::models::frames::{RideOffer, ServerFrame};
use crate::observability::metrics::Metrics;
use crate::store::{DriverRepository, NearbyQuery};

/// Turns `ride.requested` events into time-boxed offers pushed to nearby,
/// connected drivers.
pub struct DispatchPipeline {
    drivers: Arc<dyn DriverRepository>,
    hub: Hub,
    metrics: Metrics,
    config: DispatchConfig,
}

impl DispatchPipeline {
    pub fn new(
        drivers: Arc<dyn DriverRepository>,
        hub: Hub,
        metrics: Metrics,
        config: DispatchConfig,
    ) -> Self {
        Self {
            drivers,
            hub,
            metrics,
            config,
        }
    }

    /// Returns how many offers were delivered. Zero leaves the ride REQUESTED.
    pub async fn dispatch(&self, request: &RideRequested) -> Result<usize, AppError> {
        let started = Instant::now();
        let pickup = request.pickup_location.point();
        geo::validate(&pickup)?;
        geo::validate(&request.destination_location.point())?;

        let candidates = self
            .drivers
            .find_nearby(&NearbyQuery {
                point: pickup,
                vehicle_type: request.vehicle_type,
                radius_km: self.config.radius_km,
                limit: self.config.candidate_limit,
            })
            .await?;

        info!(
            ride_id = %request.ride_id,
            ride_number = %request.ride_number,
            vehicle_type = %request.vehicle_type,
            candidates = candidates.len(),
            "ride request received"
        );

        let trip = fare::quote(
            &pickup,
            &request.destination_location.point(),
            request.vehicle_type,
        );
        let ttl = chrono::Duration::from_std(self.config.offer_ttl)
            .map_err(|err| AppError::Internal(format!("invalid offer ttl: {err}")))?;
        let expires_at = Utc::now() + ttl;

        let mut sent = 0;
        for candidate in &candidates {
            if sent >= self.config.fan_out {
                break;
            }

            let driver_id = candidate.driver.id;
            if !self.hub.is_connected(driver_id) {
                debug!(ride_id = %request.ride_id, driver_id = %driver_id, "driver not connected, skipping");
                continue;
            }

            let offer = ServerFrame::RideOffer(RideOffer {
                offer_id: format!("offer_{}_{}", request.ride_id, driver_id),
                ride_id: request.ride_id,
                ride_number: request.ride_number.clone(),
                pickup_location: request.pickup_location.clone(),
                destination_location: request.destination_location.clone(),
                estimated_fare: request.estimated_fare,
                driver_earnings: fare::driver_earnings(request.estimated_fare),
                distance_to_pickup_km: (candidate.distance_km * 100.0).round() / 100.0,
                estimated_ride_duration_min: trip.duration_minutes,
                expires_at,
            });

            match self.hub.send_to_user(driver_id, &offer).await {
                Ok(()) => {
                    sent += 1;
                    self.metrics.offers_sent_total.inc();
                    info!(
                        ride_id = %request.ride_id,
                        driver_id = %driver_id,
                        distance_km = candidate.distance_km,
                        "ride offer sent"
                    );
                }
                Err(err) => {
                    warn!(ride_id = %request.ride_id, driver_id = %driver_id, error = %err, "failed to send ride offer");
                }
            }
        }

        let outcome = if sent == 0 {
            warn!(ride_id = %request.ride_id, "no connected drivers nearby, ride stays requested");
            "no_drivers"
        } else {
            info!(ride_id = %request.ride_id, offers_sent = sent, "ride offers dispatched");
            "offered"
        };
        self.metrics
            .dispatch_latency_seconds
            .with_label_values(&[outcome])
            .observe(started.elapsed().as_secs_f64());

        Ok(sent)
    }
}

#[async_trait]
impl MessageHandler for DispatchPipeline {
    async fn handle(&self, event: Event) -> Result<(), AppError> {
        match event {
            Event::RideRequested(request) => self.dispatch(&request).await.map(|_| ()),
            other => Err(AppError::BadRequest(format!(
                "dispatch cannot handle {}",
                other.routing_key()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use tokio::sync::watch;
    use uuid::Uuid;

    use super::DispatchPipeline;
    use crate::auth::Role;
    use crate::config::{DispatchConfig, HubConfig};
    use crate::hub::Hub;
    use crate::models::coordinate::{Coordinate, EntityType, GeoPoint, Place};
    use crate::models::driver::{Driver, DriverStatus, VehicleInfo};
    use crate::models::events::RideRequested;
    use crate::models::frames::ServerFrame;
    use crate::models::ride::VehicleType;
    use crate::observability::metrics::Metrics;
    use crate::store::memory::MemoryStore;
    use crate::store::{DriverRepository, LocationRepository};

    struct Fixture {
        store: Arc<MemoryStore>,
        hub: Hub,
        pipeline: DispatchPipeline,
        _shutdown: watch::Sender<bool>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let metrics = Metrics::new();
        let (hub, hub_loop) = Hub::new(&HubConfig::default(), metrics.clone());
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(hub_loop.run(shutdown_rx));

        let pipeline = DispatchPipeline::new(
            store.clone(),
            hub.clone(),
            metrics,
            DispatchConfig::default(),
        );
        Fixture {
            store,
            hub,
            pipeline,
            _shutdown: shutdown,
        }
    }

    async fn available_driver(store: &MemoryStore, lat: f64, rating: f64) -> Uuid {
        let now = Utc::now();
        let driver = Driver {
            id: Uuid::new_v4(),
            name: "driver".to_string(),
            vehicle_type: VehicleType::Economy,
            vehicle: VehicleInfo::default(),
            status: DriverStatus::Available,
            is_verified: true,
            rating,
            total_rides: 0,
            total_earnings: 0.0,
            created_at: now,
            updated_at: now,
        };
        store.insert_driver(&driver).await.unwrap();
        let coordinate = Coordinate::current(
            driver.id,
            EntityType::Driver,
            GeoPoint { lat, lng: 37.6173 },
            "",
            now,
        );
        store.replace_current(&coordinate).await.unwrap();
        driver.id
    }

    fn request() -> RideRequested {
        RideRequested {
            ride_id: Uuid::new_v4(),
            ride_number: "RIDE-20240101-000001".to_string(),
            vehicle_type: VehicleType::Economy,
            pickup_location: Place {
                lat: 55.7558,
                lng: 37.6173,
                address: "Red Square".to_string(),
            },
            destination_location: Place {
                lat: 55.7858,
                lng: 37.6173,
                address: "Savyolovsky".to_string(),
            },
            estimated_fare: 170.0,
        }
    }

    #[tokio::test]
    async fn offers_go_to_connected_drivers_up_to_fan_out() {
        let f = fixture();
        let mut receivers = Vec::new();
        for i in 0..5 {
            let id = available_driver(&f.store, 55.7560 + i as f64 * 0.001, 4.5).await;
            let (_info, rx) = f.hub.register(id, Role::Driver).await.unwrap();
            receivers.push(rx);
        }

        let request = request();
        let sent = f.pipeline.dispatch(&request).await.unwrap();
        assert_eq!(sent, 3);

        // Nearest three get the offer.
        for rx in receivers.iter_mut().take(3) {
            let text = rx.recv().await.unwrap();
            let frame: ServerFrame = serde_json::from_str(&text).unwrap();
            match frame {
                ServerFrame::RideOffer(offer) => {
                    assert_eq!(offer.ride_id, request.ride_id);
                    assert_eq!(offer.driver_earnings, 136.0);
                    assert!(offer.expires_at > Utc::now());
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
        for rx in receivers.iter_mut().skip(3) {
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn disconnected_drivers_do_not_use_a_slot() {
        let f = fixture();
        let _offline_nearest = available_driver(&f.store, 55.7559, 5.0).await;
        let connected = available_driver(&f.store, 55.7600, 4.0).await;
        let (_info, mut rx) = f.hub.register(connected, Role::Driver).await.unwrap();

        let sent = f.pipeline.dispatch(&request()).await.unwrap();
        assert_eq!(sent, 1);
        assert!(rx.recv().await.unwrap().contains("ride_offer"));
    }

    #[tokio::test]
    async fn nobody_nearby_is_not_an_error() {
        let f = fixture();
        available_driver(&f.store, 56.5, 5.0).await;

        assert_eq!(f.pipeline.dispatch(&request()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invalid_pickup_is_a_permanent_failure() {
        let f = fixture();
        let mut bad = request();
        bad.pickup_location.lat = 200.0;

        let err = f.pipeline.dispatch(&bad).await.unwrap_err();
        assert!(!err.is_transient());
    }
}

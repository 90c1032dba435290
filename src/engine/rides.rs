use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::{Identity, Role};
use crate::bus::Publisher;
use crate::engine::fare;
use crate::error::AppError;
use crate::geo;
use crate::hub::Hub;
use crate::models::coordinate::{Coordinate, EntityType, Place, TripEstimate};
use crate::models::events::{Event, RideRequested};
use crate::models::frames::{RideStatusUpdate, ServerFrame};
use crate::models::ride::{Ride, RideStatus, VehicleType};
use crate::store::{LocationRepository, RideRepository};

const DEFAULT_PRIORITY: i32 = 1;

#[derive(Debug, Clone)]
pub struct RideRequest {
    pub pickup: Place,
    pub destination: Place,
    pub vehicle_type: VehicleType,
    pub priority: Option<i32>,
}

pub struct RideService {
    rides: Arc<dyn RideRepository>,
    locations: Arc<dyn LocationRepository>,
    publisher: Publisher,
    hub: Hub,
}

impl RideService {
    pub fn new(
        rides: Arc<dyn RideRepository>,
        locations: Arc<dyn LocationRepository>,
        publisher: Publisher,
        hub: Hub,
    ) -> Self {
        Self {
            rides,
            locations,
            publisher,
            hub,
        }
    }

    pub async fn request(&self, passenger_id: Uuid, request: RideRequest) -> Result<Ride, AppError> {
        let pickup = request.pickup.point();
        let destination = request.destination.point();
        geo::validate(&pickup)?;
        geo::validate(&destination)?;

        let priority = request
            .priority
            .filter(|p| (1..=10).contains(p))
            .unwrap_or(DEFAULT_PRIORITY);
        let trip = fare::quote(&pickup, &destination, request.vehicle_type);
        let now = Utc::now();

        let pickup_row = Coordinate::current(
            passenger_id,
            EntityType::Passenger,
            pickup,
            request.pickup.address.clone(),
            now,
        );
        self.locations.replace_current(&pickup_row).await?;

        let destination_row = Coordinate::waypoint(
            passenger_id,
            EntityType::Passenger,
            &request.destination,
            TripEstimate {
                fare_amount: Some(trip.fare),
                distance_km: Some(trip.distance_km),
                duration_minutes: Some(trip.duration_minutes),
            },
            now,
        );
        self.locations.insert_coordinate(&destination_row).await?;

        let ride = Ride {
            id: Uuid::new_v4(),
            ride_number: Ride::number_for(now),
            passenger_id,
            driver_id: None,
            vehicle_type: request.vehicle_type,
            status: RideStatus::Requested,
            priority,
            requested_at: now,
            matched_at: None,
            arrived_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            estimated_fare: trip.fare,
            final_fare: None,
            pickup_coordinate_id: pickup_row.id,
            destination_coordinate_id: destination_row.id,
            created_at: now,
            updated_at: now,
        };
        self.rides.insert_ride(&ride).await?;

        let event = Event::RideRequested(RideRequested {
            ride_id: ride.id,
            ride_number: ride.ride_number.clone(),
            vehicle_type: ride.vehicle_type,
            pickup_location: request.pickup,
            destination_location: request.destination,
            estimated_fare: ride.estimated_fare,
        });
        if let Err(err) = self.publisher.publish(&event).await {
            // Nothing will ever dispatch this ride, so it must not linger as REQUESTED.
            error!(ride_id = %ride.id, error = %err, "failed to publish ride request");
            if let Err(cancel_err) = self
                .rides
                .cancel_ride(ride.id, "dispatch unavailable", Utc::now())
                .await
            {
                error!(ride_id = %ride.id, error = %cancel_err, "failed to cancel undispatched ride");
            }
            return Err(err);
        }

        info!(
            ride_id = %ride.id,
            ride_number = %ride.ride_number,
            passenger_id = %passenger_id,
            vehicle_type = %ride.vehicle_type,
            distance_km = trip.distance_km,
            estimated_fare = ride.estimated_fare,
            "ride requested"
        );
        self.push_status(passenger_id, &ride, "looking for a driver")
            .await;
        Ok(ride)
    }

    /// Visible to its passenger, its driver and admins.
    pub async fn get(&self, viewer: &Identity, ride_id: Uuid) -> Result<Ride, AppError> {
        let ride = self.find(ride_id).await?;
        let allowed = match viewer.role {
            Role::Admin => true,
            Role::Passenger => ride.passenger_id == viewer.user_id,
            Role::Driver => ride.is_assigned_to(viewer.user_id),
        };
        if !allowed {
            return Err(AppError::Forbidden(format!("ride {ride_id} belongs to someone else")));
        }
        Ok(ride)
    }

    pub async fn cancel(
        &self,
        passenger_id: Uuid,
        ride_id: Uuid,
        reason: Option<String>,
    ) -> Result<Ride, AppError> {
        let ride = self.find(ride_id).await?;
        if ride.passenger_id != passenger_id {
            return Err(AppError::Forbidden(format!("ride {ride_id} belongs to someone else")));
        }
        if !ride.can_cancel() {
            return Err(AppError::Conflict(format!(
                "ride {ride_id} is {}, cannot be cancelled",
                ride.status
            )));
        }

        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "cancelled by passenger".to_string());
        let ride = self
            .rides
            .cancel_ride(ride_id, &reason, Utc::now())
            .await?
            .ok_or_else(|| AppError::Conflict(format!("ride {ride_id} changed state")))?;

        info!(ride_id = %ride_id, passenger_id = %passenger_id, reason = %reason, "ride cancelled");
        self.push_status(passenger_id, &ride, &reason).await;
        if let Some(driver_id) = ride.driver_id {
            self.push_status(driver_id, &ride, &reason).await;
        }
        Ok(ride)
    }

    async fn find(&self, ride_id: Uuid) -> Result<Ride, AppError> {
        self.rides
            .find_ride(ride_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("ride {ride_id} not found")))
    }

    async fn push_status(&self, user_id: Uuid, ride: &Ride, message: &str) {
        let frame = ServerFrame::RideStatusUpdate(RideStatusUpdate {
            ride_id: ride.id,
            status: ride.status,
            message: message.to_string(),
        });
        if let Err(err) = self.hub.send_to_user(user_id, &frame).await {
            warn!(ride_id = %ride.id, user_id = %user_id, error = %err, "failed to push ride status");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use futures::StreamExt;
    use uuid::Uuid;

    use super::{RideRequest, RideService};
    use crate::auth::{Identity, Role};
    use crate::bus::memory::InMemoryBus;
    use crate::bus::{declare_topology, MessageBus, Publisher, DRIVER_MATCHING_QUEUE};
    use crate::engine::testing::{driver, running_hub};
    use crate::error::AppError;
    use crate::models::coordinate::{EntityType, Place};
    use crate::models::driver::DriverStatus;
    use crate::models::events::Event;
    use crate::models::ride::{RideStatus, VehicleType};
    use crate::store::memory::MemoryStore;
    use crate::store::{DriverRepository, LocationRepository, RideRepository};

    fn request() -> RideRequest {
        RideRequest {
            pickup: Place {
                lat: 55.7558,
                lng: 37.6173,
                address: "Red Square".to_string(),
            },
            destination: Place {
                lat: 55.7858,
                lng: 37.6173,
                address: "Savyolovsky".to_string(),
            },
            vehicle_type: VehicleType::Economy,
            priority: Some(42),
        }
    }

    struct Fixture {
        service: RideService,
        store: Arc<MemoryStore>,
        bus: Arc<InMemoryBus>,
        hub: crate::hub::Hub,
        _shutdown: tokio::sync::watch::Sender<bool>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(InMemoryBus::new(10));
        declare_topology(bus.as_ref()).await.unwrap();
        let (hub, shutdown) = running_hub();
        let service = RideService::new(
            store.clone(),
            store.clone(),
            Publisher::new(bus.clone(), Duration::from_secs(5)),
            hub.clone(),
        );
        Fixture {
            service,
            store,
            bus,
            hub,
            _shutdown: shutdown,
        }
    }

    #[tokio::test]
    async fn request_stores_ride_and_publishes_it() {
        let f = fixture().await;
        let passenger_id = Uuid::new_v4();
        let (_conn, mut passenger_rx) = f.hub.register(passenger_id, Role::Passenger).await.unwrap();

        let ride = f.service.request(passenger_id, request()).await.unwrap();
        assert_eq!(ride.status, RideStatus::Requested);
        assert_eq!(ride.priority, 1);
        assert!(ride.ride_number.starts_with("RIDE-"));
        // 3.34 km economy trip
        assert_eq!(ride.estimated_fare, 100.04);

        let pickup = f
            .store
            .current(passenger_id, EntityType::Passenger)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pickup.id, ride.pickup_coordinate_id);
        let destination = f
            .store
            .find_coordinate(ride.destination_coordinate_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!destination.is_current);
        assert_eq!(destination.estimate.fare_amount, Some(ride.estimated_fare));
        assert_eq!(destination.estimate.duration_minutes, Some(6));

        let mut queue = f.bus.consume(DRIVER_MATCHING_QUEUE).await.unwrap();
        let delivery = queue.next().await.unwrap();
        match Event::decode(&delivery.exchange, &delivery.routing_key, &delivery.body).unwrap() {
            Event::RideRequested(event) => {
                assert_eq!(event.ride_id, ride.id);
                assert_eq!(event.pickup_location.address, "Red Square");
            }
            other => panic!("unexpected event {other:?}"),
        }
        delivery.ack();

        assert!(passenger_rx.recv().await.unwrap().contains("REQUESTED"));
    }

    #[tokio::test]
    async fn invalid_coordinates_are_rejected() {
        let f = fixture().await;
        let mut bad = request();
        bad.destination.lng = 500.0;

        let err = f.service.request(Uuid::new_v4(), bad).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn only_owner_sees_or_cancels_a_ride() {
        let f = fixture().await;
        let owner = Uuid::new_v4();
        let ride = f.service.request(owner, request()).await.unwrap();

        let stranger = Identity {
            user_id: Uuid::new_v4(),
            role: Role::Passenger,
        };
        assert!(matches!(
            f.service.get(&stranger, ride.id).await,
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            f.service.cancel(stranger.user_id, ride.id, None).await,
            Err(AppError::Forbidden(_))
        ));

        let admin = Identity {
            user_id: Uuid::new_v4(),
            role: Role::Admin,
        };
        assert_eq!(f.service.get(&admin, ride.id).await.unwrap().id, ride.id);

        let cancelled = f
            .service
            .cancel(owner, ride.id, Some("changed my mind".to_string()))
            .await
            .unwrap();
        assert_eq!(cancelled.status, RideStatus::Cancelled);
        assert_eq!(cancelled.cancellation_reason.as_deref(), Some("changed my mind"));

        let again = f.service.cancel(owner, ride.id, None).await.unwrap_err();
        assert!(matches!(again, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn cancelling_matched_ride_notifies_driver() {
        let f = fixture().await;
        let owner = Uuid::new_v4();
        let ride = f.service.request(owner, request()).await.unwrap();
        let d = driver(DriverStatus::Available);
        f.store.insert_driver(&d).await.unwrap();
        f.store.assign_driver(ride.id, d.id, Utc::now()).await.unwrap();
        let (_conn, mut driver_rx) = f.hub.register(d.id, Role::Driver).await.unwrap();

        f.service.cancel(owner, ride.id, None).await.unwrap();

        assert!(driver_rx.recv().await.unwrap().contains("CANCELLED"));
        let released = f.store.find_driver(d.id).await.unwrap().unwrap();
        assert_eq!(released.status, DriverStatus::Available);
    }

    #[tokio::test]
    async fn missing_ride_is_not_found() {
        let f = fixture().await;
        let admin = Identity {
            user_id: Uuid::new_v4(),
            role: Role::Admin,
        };
        assert!(matches!(
            f.service.get(&admin, Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
    }
}

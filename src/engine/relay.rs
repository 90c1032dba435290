//! Forward bus traffic to the passenger a ride belongs to.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::bus::consumer::MessageHandler;
use crate::error::AppError;
use crate::hub::Hub;
use crate::models::events::{DriverStatusChanged, Event, LocationBroadcast};
use crate::models::frames::{DriverLocationUpdate, RideStatusUpdate, ServerFrame};
use crate::models::ride::RideStatus;
use crate::store::RideRepository;

pub struct LocationRelay {
    rides: Arc<dyn RideRepository>,
    hub: Hub,
}

impl LocationRelay {
    pub fn new(rides: Arc<dyn RideRepository>, hub: Hub) -> Self {
        Self { rides, hub }
    }

    /// Returns whether the position was pushed to a passenger.
    pub async fn relay(&self, update: &LocationBroadcast) -> Result<bool, AppError> {
        let Some(ride_id) = update.ride_id else {
            return Ok(false);
        };
        let Some(ride) = self.rides.find_ride(ride_id).await? else {
            debug!(ride_id = %ride_id, "location update for unknown ride");
            return Ok(false);
        };
        let tracking = matches!(ride.status, RideStatus::Matched | RideStatus::InProgress);
        if !tracking || !ride.is_assigned_to(update.driver_id) {
            return Ok(false);
        }

        let frame = ServerFrame::DriverLocationUpdate(DriverLocationUpdate {
            ride_id,
            driver_id: update.driver_id,
            location: update.location,
            speed_kmh: update.speed_kmh,
            heading_degrees: update.heading_degrees,
            timestamp: update.timestamp,
        });
        if let Err(err) = self.hub.send_to_user(ride.passenger_id, &frame).await {
            warn!(ride_id = %ride_id, error = %err, "failed to relay driver location");
            return Ok(false);
        }
        Ok(true)
    }
}

#[async_trait]
impl MessageHandler for LocationRelay {
    async fn handle(&self, event: Event) -> Result<(), AppError> {
        match event {
            Event::LocationUpdated(update) => self.relay(&update).await.map(|_| ()),
            other => Err(AppError::BadRequest(format!(
                "location relay cannot handle {}",
                other.routing_key()
            ))),
        }
    }
}

pub struct StatusRelay {
    rides: Arc<dyn RideRepository>,
    hub: Hub,
}

impl StatusRelay {
    pub fn new(rides: Arc<dyn RideRepository>, hub: Hub) -> Self {
        Self { rides, hub }
    }

    pub async fn relay(&self, change: &DriverStatusChanged) -> Result<bool, AppError> {
        let Some(ride_id) = change.ride_id else {
            return Ok(false);
        };
        let Some(ride) = self.rides.find_ride(ride_id).await? else {
            debug!(ride_id = %ride_id, "status change for unknown ride");
            return Ok(false);
        };

        let message = match ride.status {
            RideStatus::Requested => "looking for a driver",
            RideStatus::Matched => "driver is on the way",
            RideStatus::InProgress => "ride in progress",
            RideStatus::Completed => "ride completed",
            RideStatus::Cancelled => "ride cancelled",
        };
        let frame = ServerFrame::RideStatusUpdate(RideStatusUpdate {
            ride_id,
            status: ride.status,
            message: message.to_string(),
        });
        if let Err(err) = self.hub.send_to_user(ride.passenger_id, &frame).await {
            warn!(ride_id = %ride_id, error = %err, "failed to relay ride status");
            return Ok(false);
        }
        debug!(ride_id = %ride_id, driver_status = %change.status, ride_status = %ride.status, "ride status relayed");
        Ok(true)
    }
}

#[async_trait]
impl MessageHandler for StatusRelay {
    async fn handle(&self, event: Event) -> Result<(), AppError> {
        match event {
            Event::DriverStatus(change) => self.relay(&change).await.map(|_| ()),
            other => Err(AppError::BadRequest(format!(
                "status relay cannot handle {}",
                other.routing_key()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use uuid::Uuid;

    use super::{LocationRelay, StatusRelay};
    use crate::auth::Role;
    use crate::engine::testing::{driver, requested_ride, running_hub};
    use crate::models::coordinate::GeoPoint;
    use crate::models::driver::DriverStatus;
    use crate::models::events::{DriverStatusChanged, LocationBroadcast};
    use crate::store::memory::MemoryStore;
    use crate::store::{DriverRepository, RideRepository};

    fn broadcast(driver_id: Uuid, ride_id: Option<Uuid>) -> LocationBroadcast {
        LocationBroadcast {
            driver_id,
            ride_id,
            location: GeoPoint {
                lat: 55.76,
                lng: 37.62,
            },
            speed_kmh: 30.0,
            heading_degrees: 90.0,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn assigned_driver_position_reaches_passenger() {
        let store = Arc::new(MemoryStore::new());
        let (hub, _shutdown) = running_hub();
        let relay = LocationRelay::new(store.clone(), hub.clone());

        let passenger_id = Uuid::new_v4();
        let ride = requested_ride(passenger_id, Uuid::new_v4());
        store.insert_ride(&ride).await.unwrap();
        let d = driver(DriverStatus::Available);
        store.insert_driver(&d).await.unwrap();
        let (_conn, mut rx) = hub.register(passenger_id, Role::Passenger).await.unwrap();

        // Not matched yet.
        assert!(!relay.relay(&broadcast(d.id, Some(ride.id))).await.unwrap());

        store.assign_driver(ride.id, d.id, Utc::now()).await.unwrap();
        assert!(relay.relay(&broadcast(d.id, Some(ride.id))).await.unwrap());
        assert!(rx.recv().await.unwrap().contains("driver_location_update"));

        // Some other driver claiming the ride is ignored.
        assert!(!relay.relay(&broadcast(Uuid::new_v4(), Some(ride.id))).await.unwrap());
        assert!(!relay.relay(&broadcast(d.id, None)).await.unwrap());
    }

    #[tokio::test]
    async fn status_change_pushes_ride_status() {
        let store = Arc::new(MemoryStore::new());
        let (hub, _shutdown) = running_hub();
        let relay = StatusRelay::new(store.clone(), hub.clone());

        let passenger_id = Uuid::new_v4();
        let ride = requested_ride(passenger_id, Uuid::new_v4());
        store.insert_ride(&ride).await.unwrap();
        let (_conn, mut rx) = hub.register(passenger_id, Role::Passenger).await.unwrap();

        let change = DriverStatusChanged {
            driver_id: Uuid::new_v4(),
            status: DriverStatus::Busy,
            ride_id: Some(ride.id),
            timestamp: Utc::now(),
        };
        assert!(relay.relay(&change).await.unwrap());
        let text = rx.recv().await.unwrap();
        assert!(text.contains("ride_status_update"));
        assert!(text.contains("REQUESTED"));

        let no_ride = DriverStatusChanged {
            ride_id: None,
            ..change
        };
        assert!(!relay.relay(&no_ride).await.unwrap());
    }
}

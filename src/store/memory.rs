use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::warn;
use uuid::Uuid;

use super::{
    AssignOutcome, DriverRepository, LocationRepository, NearbyDriver, NearbyQuery, RideRepository,
};
use crate::error::AppError;
use crate::geo::haversine_km;
use crate::models::coordinate::{Coordinate, EntityType, LocationHistory};
use crate::models::driver::{Driver, DriverSession, DriverStatus};
use crate::models::ride::Ride;

/// In-process store.
///
/// Guarded operations that touch several maps hold every entry guard they need
/// before checking predicates, always acquired in the order
/// drivers -> sessions -> rides (and current -> coordinates for positions), so
/// concurrent writers serialize per row without deadlocking.
#[derive(Default)]
pub struct MemoryStore {
    drivers: DashMap<Uuid, Driver>,
    open_sessions: DashMap<Uuid, DriverSession>,
    closed_sessions: DashMap<Uuid, DriverSession>,
    rides: DashMap<Uuid, Ride>,
    current: DashMap<(Uuid, EntityType), Uuid>,
    coordinates: DashMap<Uuid, Coordinate>,
    history: DashMap<Uuid, LocationHistory>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn coordinates_of(&self, entity_id: Uuid, entity_type: EntityType) -> Vec<Coordinate> {
        self.coordinates
            .iter()
            .filter(|c| c.entity_id == entity_id && c.entity_type == entity_type)
            .map(|c| c.clone())
            .collect()
    }

    pub fn history_of(&self, driver_id: Uuid) -> Vec<LocationHistory> {
        let mut entries: Vec<LocationHistory> = self
            .history
            .iter()
            .filter(|h| h.driver_id == driver_id)
            .map(|h| h.clone())
            .collect();
        entries.sort_by_key(|h| h.recorded_at);
        entries
    }

    pub fn sessions_of(&self, driver_id: Uuid) -> Vec<DriverSession> {
        let mut sessions: Vec<DriverSession> = self
            .closed_sessions
            .iter()
            .filter(|s| s.driver_id == driver_id)
            .map(|s| s.clone())
            .collect();
        if let Some(open) = self.open_sessions.get(&driver_id) {
            sessions.push(open.clone());
        }
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }
}

#[async_trait]
impl RideRepository for MemoryStore {
    async fn insert_ride(&self, ride: &Ride) -> Result<(), AppError> {
        match self.rides.entry(ride.id) {
            Entry::Occupied(_) => Err(AppError::Conflict(format!("ride {} already exists", ride.id))),
            Entry::Vacant(slot) => {
                slot.insert(ride.clone());
                Ok(())
            }
        }
    }

    async fn find_ride(&self, id: Uuid) -> Result<Option<Ride>, AppError> {
        Ok(self.rides.get(&id).map(|r| r.clone()))
    }

    async fn assign_driver(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<AssignOutcome, AppError> {
        let driver = self.drivers.get_mut(&driver_id);
        let Some(mut ride) = self.rides.get_mut(&ride_id) else {
            return Ok(AssignOutcome::RideNotFound);
        };
        if !ride.can_be_matched() {
            return Ok(AssignOutcome::AlreadyTaken);
        }
        let Some(mut driver) = driver.filter(|d| d.can_accept_ride()) else {
            return Ok(AssignOutcome::DriverUnavailable);
        };

        driver.status = DriverStatus::EnRoute;
        driver.updated_at = at;
        ride.mark_matched(driver_id, at);

        Ok(AssignOutcome::Assigned(ride.clone()))
    }

    async fn begin_trip(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<Ride>, AppError> {
        let Some(mut driver) = self.drivers.get_mut(&driver_id) else {
            return Ok(None);
        };
        let Some(mut ride) = self.rides.get_mut(&ride_id) else {
            return Ok(None);
        };
        if !driver.can_start_ride() || !ride.can_start(driver_id) {
            return Ok(None);
        }

        driver.status = DriverStatus::Busy;
        driver.updated_at = at;
        ride.mark_started(at);

        Ok(Some(ride.clone()))
    }

    async fn finish_trip(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        final_fare: f64,
        driver_earnings: f64,
        at: DateTime<Utc>,
    ) -> Result<Option<Ride>, AppError> {
        let Some(mut driver) = self.drivers.get_mut(&driver_id) else {
            return Ok(None);
        };
        let session = self.open_sessions.get_mut(&driver_id);
        let Some(mut ride) = self.rides.get_mut(&ride_id) else {
            return Ok(None);
        };
        if !driver.can_complete_ride() || !ride.can_complete(driver_id) {
            return Ok(None);
        }

        driver.status = DriverStatus::Available;
        driver.credit_ride(driver_earnings);
        driver.updated_at = at;
        match session {
            Some(mut session) => session.credit_ride(driver_earnings),
            None => {
                warn!(driver_id = %driver_id, ride_id = %ride_id, "completed ride without an open session");
            }
        }
        ride.mark_completed(final_fare, at);

        Ok(Some(ride.clone()))
    }

    async fn cancel_ride(
        &self,
        ride_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Ride>, AppError> {
        // The assigned driver has to be locked before the ride; an assignment
        // landing between the peek and the lock is caught and retried.
        loop {
            let Some(assigned) = self.rides.get(&ride_id).map(|r| r.driver_id) else {
                return Ok(None);
            };
            let mut driver = assigned.and_then(|id| self.drivers.get_mut(&id));
            let Some(mut ride) = self.rides.get_mut(&ride_id) else {
                return Ok(None);
            };
            if ride.driver_id != assigned {
                continue;
            }
            if !ride.can_cancel() {
                return Ok(None);
            }

            ride.mark_cancelled(reason.to_string(), at);
            if let Some(driver) = driver.as_mut() {
                if driver.status == DriverStatus::EnRoute {
                    driver.status = DriverStatus::Available;
                    driver.updated_at = at;
                }
            }

            return Ok(Some(ride.clone()));
        }
    }
}

#[async_trait]
impl DriverRepository for MemoryStore {
    async fn insert_driver(&self, driver: &Driver) -> Result<(), AppError> {
        match self.drivers.entry(driver.id) {
            Entry::Occupied(_) => Err(AppError::Conflict(format!(
                "driver {} already exists",
                driver.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(driver.clone());
                Ok(())
            }
        }
    }

    async fn find_driver(&self, id: Uuid) -> Result<Option<Driver>, AppError> {
        Ok(self.drivers.get(&id).map(|d| d.clone()))
    }

    async fn find_nearby(&self, query: &NearbyQuery) -> Result<Vec<NearbyDriver>, AppError> {
        let eligible: Vec<Driver> = self
            .drivers
            .iter()
            .filter(|d| {
                d.is_verified
                    && d.status == DriverStatus::Available
                    && d.vehicle_type == query.vehicle_type
            })
            .map(|d| d.clone())
            .collect();

        let mut nearby: Vec<NearbyDriver> = eligible
            .into_iter()
            .filter_map(|driver| {
                let coordinate_id = *self.current.get(&(driver.id, EntityType::Driver))?;
                let location = self.coordinates.get(&coordinate_id)?.point();
                let distance_km = haversine_km(&query.point, &location);
                (distance_km <= query.radius_km).then_some(NearbyDriver {
                    driver,
                    location,
                    distance_km,
                })
            })
            .collect();

        nearby.sort_by(|a, b| {
            a.distance_km
                .partial_cmp(&b.distance_km)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    b.driver
                        .rating
                        .partial_cmp(&a.driver.rating)
                        .unwrap_or(Ordering::Equal)
                })
        });
        nearby.truncate(query.limit);

        Ok(nearby)
    }

    async fn open_session(
        &self,
        driver_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<DriverSession>, AppError> {
        let Some(mut driver) = self.drivers.get_mut(&driver_id) else {
            return Ok(None);
        };
        if !driver.can_go_online() {
            return Ok(None);
        }
        let Entry::Vacant(slot) = self.open_sessions.entry(driver_id) else {
            return Ok(None);
        };

        let session = DriverSession::open(driver_id, at);
        slot.insert(session.clone());
        driver.status = DriverStatus::Available;
        driver.updated_at = at;

        Ok(Some(session))
    }

    async fn close_session(
        &self,
        driver_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<DriverSession>, AppError> {
        let Some(mut driver) = self.drivers.get_mut(&driver_id) else {
            return Ok(None);
        };
        if !driver.can_go_offline() {
            return Ok(None);
        }
        let Entry::Occupied(slot) = self.open_sessions.entry(driver_id) else {
            return Ok(None);
        };

        let mut session = slot.remove();
        session.ended_at = Some(at);
        self.closed_sessions.insert(session.id, session.clone());
        driver.status = DriverStatus::Offline;
        driver.updated_at = at;

        Ok(Some(session))
    }

    async fn find_open_session(&self, driver_id: Uuid) -> Result<Option<DriverSession>, AppError> {
        Ok(self.open_sessions.get(&driver_id).map(|s| s.clone()))
    }
}

#[async_trait]
impl LocationRepository for MemoryStore {
    async fn replace_current(&self, coordinate: &Coordinate) -> Result<(), AppError> {
        let mut current = coordinate.clone();
        current.is_current = true;

        match self.current.entry((coordinate.entity_id, coordinate.entity_type)) {
            Entry::Occupied(mut slot) => {
                if let Some(mut previous) = self.coordinates.get_mut(slot.get()) {
                    previous.is_current = false;
                    previous.updated_at = coordinate.created_at;
                }
                self.coordinates.insert(current.id, current);
                slot.insert(coordinate.id);
            }
            Entry::Vacant(slot) => {
                self.coordinates.insert(current.id, current);
                slot.insert(coordinate.id);
            }
        }
        Ok(())
    }

    async fn current(
        &self,
        entity_id: Uuid,
        entity_type: EntityType,
    ) -> Result<Option<Coordinate>, AppError> {
        let Some(coordinate_id) = self.current.get(&(entity_id, entity_type)) else {
            return Ok(None);
        };
        Ok(self.coordinates.get(&*coordinate_id).map(|c| c.clone()))
    }

    async fn insert_coordinate(&self, coordinate: &Coordinate) -> Result<(), AppError> {
        let mut waypoint = coordinate.clone();
        waypoint.is_current = false;
        self.coordinates.insert(waypoint.id, waypoint);
        Ok(())
    }

    async fn find_coordinate(&self, id: Uuid) -> Result<Option<Coordinate>, AppError> {
        Ok(self.coordinates.get(&id).map(|c| c.clone()))
    }

    async fn append_history(&self, entry: &LocationHistory) -> Result<(), AppError> {
        self.history.insert(entry.id, entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use uuid::Uuid;

    use super::MemoryStore;
    use crate::models::coordinate::{Coordinate, EntityType, GeoPoint, Place, TripEstimate};
    use crate::models::driver::{Driver, DriverStatus, VehicleInfo};
    use crate::models::ride::{Ride, RideStatus, VehicleType};
    use crate::store::{
        AssignOutcome, DriverRepository, LocationRepository, NearbyQuery, RideRepository,
    };

    fn driver(status: DriverStatus, rating: f64) -> Driver {
        let now = Utc::now();
        Driver {
            id: Uuid::new_v4(),
            name: "driver".to_string(),
            vehicle_type: VehicleType::Economy,
            vehicle: VehicleInfo {
                make: "Toyota".to_string(),
                model: "Camry".to_string(),
                color: "white".to_string(),
                plate: "A123BC".to_string(),
            },
            status,
            is_verified: true,
            rating,
            total_rides: 0,
            total_earnings: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    fn ride() -> Ride {
        let now = Utc::now();
        Ride {
            id: Uuid::new_v4(),
            ride_number: Ride::number_for(now),
            passenger_id: Uuid::new_v4(),
            driver_id: None,
            vehicle_type: VehicleType::Economy,
            status: RideStatus::Requested,
            priority: 1,
            requested_at: now,
            matched_at: None,
            arrived_at: None,
            started_at: None,
            completed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            estimated_fare: 170.0,
            final_fare: None,
            pickup_coordinate_id: Uuid::new_v4(),
            destination_coordinate_id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
        }
    }

    fn at(lat: f64, lng: f64) -> GeoPoint {
        GeoPoint { lat, lng }
    }

    async fn place(store: &MemoryStore, driver_id: Uuid, point: GeoPoint) {
        let coordinate = Coordinate::current(driver_id, EntityType::Driver, point, "", Utc::now());
        store.replace_current(&coordinate).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_assignments_have_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let ride = ride();
        let ride_id = ride.id;
        store.insert_ride(&ride).await.unwrap();

        let mut drivers = Vec::new();
        for _ in 0..8 {
            let d = driver(DriverStatus::Available, 4.8);
            store.insert_driver(&d).await.unwrap();
            drivers.push(d.id);
        }

        let handles: Vec<_> = drivers
            .iter()
            .map(|&driver_id| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.assign_driver(ride_id, driver_id, Utc::now()).await.unwrap()
                })
            })
            .collect();

        let mut winners = Vec::new();
        for handle in handles {
            if let AssignOutcome::Assigned(r) = handle.await.unwrap() {
                winners.push(r.driver_id.unwrap());
            }
        }

        assert_eq!(winners.len(), 1);
        let stored = store.find_ride(ride.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RideStatus::Matched);
        assert_eq!(stored.driver_id, Some(winners[0]));

        for driver_id in drivers {
            let status = store.find_driver(driver_id).await.unwrap().unwrap().status;
            if driver_id == winners[0] {
                assert_eq!(status, DriverStatus::EnRoute);
            } else {
                assert_eq!(status, DriverStatus::Available);
            }
        }
    }

    #[tokio::test]
    async fn busy_driver_cannot_be_assigned() {
        let store = MemoryStore::new();
        let ride = ride();
        let busy = driver(DriverStatus::Busy, 5.0);
        store.insert_ride(&ride).await.unwrap();
        store.insert_driver(&busy).await.unwrap();

        let outcome = store.assign_driver(ride.id, busy.id, Utc::now()).await.unwrap();
        assert!(matches!(outcome, AssignOutcome::DriverUnavailable));

        let missing = store
            .assign_driver(Uuid::new_v4(), busy.id, Utc::now())
            .await
            .unwrap();
        assert!(matches!(missing, AssignOutcome::RideNotFound));
        assert_eq!(
            store.find_ride(ride.id).await.unwrap().unwrap().status,
            RideStatus::Requested
        );
    }

    #[tokio::test]
    async fn trip_runs_start_to_finish_and_credits_session() {
        let store = MemoryStore::new();
        let ride = ride();
        let d = driver(DriverStatus::Offline, 4.5);
        store.insert_ride(&ride).await.unwrap();
        store.insert_driver(&d).await.unwrap();

        store.open_session(d.id, Utc::now()).await.unwrap().unwrap();
        store.assign_driver(ride.id, d.id, Utc::now()).await.unwrap();

        assert!(store.begin_trip(ride.id, Uuid::new_v4(), Utc::now()).await.unwrap().is_none());
        let started = store.begin_trip(ride.id, d.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(started.status, RideStatus::InProgress);
        assert_eq!(store.find_driver(d.id).await.unwrap().unwrap().status, DriverStatus::Busy);

        let other = self::ride();
        store.insert_ride(&other).await.unwrap();
        assert!(store.begin_trip(other.id, d.id, Utc::now()).await.unwrap().is_none());

        let done = store
            .finish_trip(ride.id, d.id, 170.0, 136.0, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, RideStatus::Completed);
        assert_eq!(done.final_fare, Some(170.0));

        let driver = store.find_driver(d.id).await.unwrap().unwrap();
        assert_eq!(driver.status, DriverStatus::Available);
        assert_eq!(driver.total_rides, 1);
        assert_eq!(driver.total_earnings, 136.0);

        let session = store.find_open_session(d.id).await.unwrap().unwrap();
        assert_eq!(session.total_rides, 1);
        assert_eq!(session.total_earnings, 136.0);
    }

    #[tokio::test]
    async fn cancelling_matched_ride_releases_driver() {
        let store = MemoryStore::new();
        let ride = ride();
        let d = driver(DriverStatus::Available, 4.5);
        store.insert_ride(&ride).await.unwrap();
        store.insert_driver(&d).await.unwrap();
        store.assign_driver(ride.id, d.id, Utc::now()).await.unwrap();

        let cancelled = store
            .cancel_ride(ride.id, "changed plans", Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cancelled.status, RideStatus::Cancelled);
        assert_eq!(cancelled.cancellation_reason.as_deref(), Some("changed plans"));
        assert_eq!(
            store.find_driver(d.id).await.unwrap().unwrap().status,
            DriverStatus::Available
        );

        assert!(store.cancel_ride(ride.id, "again", Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sessions_open_once_and_close_only_when_available() {
        let store = MemoryStore::new();
        let d = driver(DriverStatus::Offline, 4.5);
        store.insert_driver(&d).await.unwrap();

        assert!(store.open_session(d.id, Utc::now()).await.unwrap().is_some());
        assert!(store.open_session(d.id, Utc::now()).await.unwrap().is_none());

        let ride = ride();
        store.insert_ride(&ride).await.unwrap();
        store.assign_driver(ride.id, d.id, Utc::now()).await.unwrap();
        store.begin_trip(ride.id, d.id, Utc::now()).await.unwrap();
        assert!(store.close_session(d.id, Utc::now()).await.unwrap().is_none());

        store
            .finish_trip(ride.id, d.id, 100.0, 80.0, Utc::now())
            .await
            .unwrap();
        let closed = store.close_session(d.id, Utc::now()).await.unwrap().unwrap();
        assert!(closed.ended_at.is_some());
        assert_eq!(closed.total_rides, 1);
        assert!(store.find_open_session(d.id).await.unwrap().is_none());
        assert_eq!(store.sessions_of(d.id).len(), 1);
    }

    #[tokio::test]
    async fn unverified_driver_cannot_go_online() {
        let store = MemoryStore::new();
        let mut d = driver(DriverStatus::Offline, 4.5);
        d.is_verified = false;
        store.insert_driver(&d).await.unwrap();

        assert!(store.open_session(d.id, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nearby_orders_by_distance_then_rating() {
        let store = MemoryStore::new();
        let pickup = at(55.7558, 37.6173);

        let far = driver(DriverStatus::Available, 5.0);
        let near_low = driver(DriverStatus::Available, 4.0);
        let near_high = driver(DriverStatus::Available, 4.9);
        let busy = driver(DriverStatus::Busy, 5.0);
        let mut premium = driver(DriverStatus::Available, 5.0);
        premium.vehicle_type = VehicleType::Premium;
        let out_of_range = driver(DriverStatus::Available, 5.0);

        for d in [&far, &near_low, &near_high, &busy, &premium, &out_of_range] {
            store.insert_driver(d).await.unwrap();
        }
        place(&store, far.id, at(55.7758, 37.6173)).await;
        place(&store, near_low.id, at(55.7578, 37.6173)).await;
        place(&store, near_high.id, at(55.7578, 37.6173)).await;
        place(&store, busy.id, at(55.7558, 37.6173)).await;
        place(&store, premium.id, at(55.7558, 37.6173)).await;
        place(&store, out_of_range.id, at(55.9558, 37.6173)).await;

        let found = store
            .find_nearby(&NearbyQuery {
                point: pickup,
                vehicle_type: VehicleType::Economy,
                radius_km: 5.0,
                limit: 10,
            })
            .await
            .unwrap();

        let ids: Vec<Uuid> = found.iter().map(|n| n.driver.id).collect();
        assert_eq!(ids, vec![near_high.id, near_low.id, far.id]);

        let limited = store
            .find_nearby(&NearbyQuery {
                point: pickup,
                vehicle_type: VehicleType::Economy,
                radius_km: 5.0,
                limit: 1,
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_position_writes_keep_one_current_row() {
        let store = Arc::new(MemoryStore::new());
        let driver_id = Uuid::new_v4();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let point = at(55.75 + i as f64 * 0.001, 37.61);
                    let coordinate =
                        Coordinate::current(driver_id, EntityType::Driver, point, "", Utc::now());
                    store.replace_current(&coordinate).await.unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let rows = store.coordinates_of(driver_id, EntityType::Driver);
        assert_eq!(rows.len(), 16);
        assert_eq!(rows.iter().filter(|c| c.is_current).count(), 1);

        let current = store
            .current(driver_id, EntityType::Driver)
            .await
            .unwrap()
            .unwrap();
        assert!(current.is_current);
    }

    #[tokio::test]
    async fn waypoints_never_become_current() {
        let store = MemoryStore::new();
        let passenger = Uuid::new_v4();
        let destination = Place {
            lat: 55.78,
            lng: 37.62,
            address: "Tverskaya 1".to_string(),
        };
        let waypoint = Coordinate::waypoint(
            passenger,
            EntityType::Passenger,
            &destination,
            TripEstimate::default(),
            Utc::now(),
        );
        store.insert_coordinate(&waypoint).await.unwrap();

        assert!(store.current(passenger, EntityType::Passenger).await.unwrap().is_none());
        let found = store.find_coordinate(waypoint.id).await.unwrap().unwrap();
        assert_eq!(found.address, "Tverskaya 1");
    }
}

//! Persistence seams.
//!
//! Every state change that two actors can race on is a predicate-guarded
//! operation: the predicate is checked and the write applied as one atomic
//! unit, and the caller learns whether the predicate held. `Ok(None)` from a
//! guarded operation means "the row was not in the required state", never an
//! infrastructure failure.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::coordinate::{Coordinate, EntityType, GeoPoint, LocationHistory};
use crate::models::driver::{Driver, DriverSession};
use crate::models::ride::{Ride, VehicleType};

#[derive(Debug, Clone)]
pub enum AssignOutcome {
    Assigned(Ride),
    AlreadyTaken,
    DriverUnavailable,
    RideNotFound,
}

impl AssignOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            AssignOutcome::Assigned(_) => "assigned",
            AssignOutcome::AlreadyTaken => "already_taken",
            AssignOutcome::DriverUnavailable => "driver_unavailable",
            AssignOutcome::RideNotFound => "ride_not_found",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NearbyQuery {
    pub point: GeoPoint,
    pub vehicle_type: VehicleType,
    pub radius_km: f64,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct NearbyDriver {
    pub driver: Driver,
    pub location: GeoPoint,
    pub distance_km: f64,
}

#[async_trait]
pub trait RideRepository: Send + Sync {
    async fn insert_ride(&self, ride: &Ride) -> Result<(), AppError>;

    async fn find_ride(&self, id: Uuid) -> Result<Option<Ride>, AppError>;

    /// Driver AVAILABLE -> EN_ROUTE and ride REQUESTED (unassigned) -> MATCHED,
    /// both or neither.
    async fn assign_driver(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<AssignOutcome, AppError>;

    /// Driver AVAILABLE|EN_ROUTE -> BUSY and ride MATCHED with that driver -> IN_PROGRESS.
    async fn begin_trip(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<Ride>, AppError>;

    /// Driver BUSY -> AVAILABLE with totals credited, ride IN_PROGRESS -> COMPLETED,
    /// and the driver's open session credited.
    async fn finish_trip(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
        final_fare: f64,
        driver_earnings: f64,
        at: DateTime<Utc>,
    ) -> Result<Option<Ride>, AppError>;

    /// Ride REQUESTED|MATCHED -> CANCELLED; an EN_ROUTE driver is released.
    async fn cancel_ride(
        &self,
        ride_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Ride>, AppError>;
}

#[async_trait]
pub trait DriverRepository: Send + Sync {
    async fn insert_driver(&self, driver: &Driver) -> Result<(), AppError>;

    async fn find_driver(&self, id: Uuid) -> Result<Option<Driver>, AppError>;

    /// Verified AVAILABLE drivers of one vehicle class with a current position
    /// inside the radius, nearest first, ties broken by higher rating.
    async fn find_nearby(&self, query: &NearbyQuery) -> Result<Vec<NearbyDriver>, AppError>;

    /// Driver OFFLINE & verified -> AVAILABLE, opening its only session.
    async fn open_session(
        &self,
        driver_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<DriverSession>, AppError>;

    /// Driver AVAILABLE with an open session -> OFFLINE, returning the closed session.
    async fn close_session(
        &self,
        driver_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<DriverSession>, AppError>;

    async fn find_open_session(&self, driver_id: Uuid) -> Result<Option<DriverSession>, AppError>;
}

#[async_trait]
pub trait LocationRepository: Send + Sync {
    /// Marks the entity's previous current row non-current and inserts
    /// `coordinate` as the new current row in one atomic unit.
    async fn replace_current(&self, coordinate: &Coordinate) -> Result<(), AppError>;

    async fn current(
        &self,
        entity_id: Uuid,
        entity_type: EntityType,
    ) -> Result<Option<Coordinate>, AppError>;

    /// Inserts a non-current row such as a trip waypoint.
    async fn insert_coordinate(&self, coordinate: &Coordinate) -> Result<(), AppError>;

    async fn find_coordinate(&self, id: Uuid) -> Result<Option<Coordinate>, AppError>;

    async fn append_history(&self, entry: &LocationHistory) -> Result<(), AppError>;
}

/// One backend serving every repository.
pub trait Store: RideRepository + DriverRepository + LocationRepository {}

impl<T> Store for T where T: RideRepository + DriverRepository + LocationRepository {}

//! Driver-initiated transitions of the ride/driver state machine.
//!
//! Every transition reads first so callers get a precise error (unknown ride,
//! wrong driver, wrong status), then applies the store's guarded operation. A
//! guarded operation that reports "predicate no longer holds" means another
//! writer got there first and surfaces as a conflict. The status-changed event
//! published afterwards is best-effort.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use crate::bus::Publisher;
use crate::engine::fare;
use crate::error::AppError;
use crate::geo;
use crate::models::coordinate::{Coordinate, EntityType, GeoPoint};
use crate::models::driver::{Driver, DriverSession, DriverStatus, SessionSummary};
use crate::models::events::{DriverStatusChanged, Event};
use crate::models::ride::Ride;
use crate::store::{DriverRepository, LocationRepository, RideRepository};

/// What the driver reports when dropping the passenger off.
#[derive(Debug, Clone, Copy, Default)]
pub struct TripReport {
    pub final_location: Option<GeoPoint>,
    pub actual_distance_km: Option<f64>,
    pub actual_duration_minutes: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct CompletedTrip {
    pub ride: Ride,
    pub driver_earnings: f64,
}

pub struct DriverLifecycle {
    rides: Arc<dyn RideRepository>,
    drivers: Arc<dyn DriverRepository>,
    locations: Arc<dyn LocationRepository>,
    publisher: Publisher,
}

impl DriverLifecycle {
    pub fn new(
        rides: Arc<dyn RideRepository>,
        drivers: Arc<dyn DriverRepository>,
        locations: Arc<dyn LocationRepository>,
        publisher: Publisher,
    ) -> Self {
        Self {
            rides,
            drivers,
            locations,
            publisher,
        }
    }

    pub async fn go_online(
        &self,
        driver_id: Uuid,
        position: Option<GeoPoint>,
    ) -> Result<DriverSession, AppError> {
        if let Some(point) = &position {
            geo::validate(point)?;
        }

        let driver = self.driver(driver_id).await?;
        if !driver.is_verified {
            return Err(AppError::Forbidden(format!(
                "driver {driver_id} is not verified"
            )));
        }
        if !driver.can_go_online() {
            return Err(AppError::Conflict(format!(
                "driver {driver_id} is {}, expected OFFLINE",
                driver.status
            )));
        }

        let now = Utc::now();
        let session = self
            .drivers
            .open_session(driver_id, now)
            .await?
            .ok_or_else(|| AppError::Conflict(format!("driver {driver_id} is already online")))?;

        if let Some(point) = position {
            self.record_position(driver_id, point).await;
        }

        info!(driver_id = %driver_id, session_id = %session.id, "driver online");
        self.notify(driver_id, DriverStatus::Available, None).await;
        Ok(session)
    }

    pub async fn go_offline(&self, driver_id: Uuid) -> Result<SessionSummary, AppError> {
        let driver = self.driver(driver_id).await?;
        if !driver.can_go_offline() {
            return Err(AppError::Conflict(format!(
                "driver {driver_id} is {}, expected AVAILABLE",
                driver.status
            )));
        }

        let session = self
            .drivers
            .close_session(driver_id, Utc::now())
            .await?
            .ok_or_else(|| {
                AppError::Conflict(format!("driver {driver_id} has no open session"))
            })?;
        let summary = session.summary();

        info!(
            driver_id = %driver_id,
            session_id = %summary.session_id,
            duration_hours = summary.duration_hours,
            rides_completed = summary.rides_completed,
            earnings = summary.earnings,
            "driver offline"
        );
        self.notify(driver_id, DriverStatus::Offline, None).await;
        Ok(summary)
    }

    pub async fn start_ride(
        &self,
        driver_id: Uuid,
        ride_id: Uuid,
        position: Option<GeoPoint>,
    ) -> Result<Ride, AppError> {
        if let Some(point) = &position {
            geo::validate(point)?;
        }

        let ride = self.assigned_ride(driver_id, ride_id).await?;
        let driver = self.driver(driver_id).await?;
        if !driver.can_start_ride() {
            return Err(AppError::Conflict(format!(
                "driver {driver_id} is {}, cannot start a ride",
                driver.status
            )));
        }
        if !ride.can_start(driver_id) {
            return Err(AppError::Conflict(format!(
                "ride {ride_id} is {}, expected MATCHED",
                ride.status
            )));
        }

        let ride = self
            .rides
            .begin_trip(ride_id, driver_id, Utc::now())
            .await?
            .ok_or_else(|| AppError::Conflict(format!("ride {ride_id} changed state")))?;

        if let Some(point) = position {
            self.record_position(driver_id, point).await;
        }

        info!(driver_id = %driver_id, ride_id = %ride_id, "ride started");
        self.notify(driver_id, DriverStatus::Busy, Some(ride_id)).await;
        Ok(ride)
    }

    pub async fn complete_ride(
        &self,
        driver_id: Uuid,
        ride_id: Uuid,
        report: TripReport,
    ) -> Result<CompletedTrip, AppError> {
        if let Some(point) = &report.final_location {
            geo::validate(point)?;
        }

        let ride = self.assigned_ride(driver_id, ride_id).await?;
        let driver = self.driver(driver_id).await?;
        if !driver.can_complete_ride() {
            return Err(AppError::Conflict(format!(
                "driver {driver_id} is {}, expected BUSY",
                driver.status
            )));
        }
        if !ride.can_complete(driver_id) {
            return Err(AppError::Conflict(format!(
                "ride {ride_id} is {}, expected IN_PROGRESS",
                ride.status
            )));
        }

        // A measured distance re-prices the trip on the ride's own tariff.
        let final_fare = match report.actual_distance_km {
            Some(distance_km) if distance_km > 0.0 => fare::fare_for(distance_km, ride.vehicle_type),
            _ => ride.settled_fare(),
        };
        let driver_earnings = fare::driver_earnings(final_fare);

        let ride = self
            .rides
            .finish_trip(ride_id, driver_id, final_fare, driver_earnings, Utc::now())
            .await?
            .ok_or_else(|| AppError::Conflict(format!("ride {ride_id} changed state")))?;

        if let Some(point) = report.final_location {
            self.record_position(driver_id, point).await;
        }

        info!(
            driver_id = %driver_id,
            ride_id = %ride_id,
            final_fare,
            driver_earnings,
            actual_duration_minutes = report.actual_duration_minutes.unwrap_or_default(),
            "ride completed"
        );
        self.notify(driver_id, DriverStatus::Available, Some(ride_id))
            .await;
        Ok(CompletedTrip {
            ride,
            driver_earnings,
        })
    }

    async fn driver(&self, driver_id: Uuid) -> Result<Driver, AppError> {
        self.drivers
            .find_driver(driver_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("driver {driver_id} not found")))
    }

    async fn assigned_ride(&self, driver_id: Uuid, ride_id: Uuid) -> Result<Ride, AppError> {
        let ride = self
            .rides
            .find_ride(ride_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("ride {ride_id} not found")))?;
        if !ride.is_assigned_to(driver_id) {
            return Err(AppError::Forbidden(format!(
                "driver {driver_id} is not assigned to ride {ride_id}"
            )));
        }
        Ok(ride)
    }

    async fn record_position(&self, driver_id: Uuid, point: GeoPoint) {
        let coordinate = Coordinate::current(driver_id, EntityType::Driver, point, "", Utc::now());
        if let Err(err) = self.locations.replace_current(&coordinate).await {
            error!(driver_id = %driver_id, error = %err, "failed to record driver position");
        }
    }

    async fn notify(&self, driver_id: Uuid, status: DriverStatus, ride_id: Option<Uuid>) {
        let event = Event::DriverStatus(DriverStatusChanged {
            driver_id,
            status,
            ride_id,
            timestamp: Utc::now(),
        });
        if let Err(err) = self.publisher.publish(&event).await {
            error!(driver_id = %driver_id, status = %status, error = %err, "failed to publish driver status");
        }
    }
}

//! Driver responses to ride offers.
//!
//! [`DriverResponder`] turns a driver's `ride_response` frame into a
//! `driver.response.{ride_id}` event. [`ResponseReconciler`] consumes those
//! events and settles the race between drivers accepting the same ride: the
//! store's conditional assignment picks exactly one winner, and only the
//! winner's acceptance reaches the passenger.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::Publisher;
use crate::bus::consumer::MessageHandler;
use crate::error::AppError;
use crate::geo;
use crate::hub::Hub;
use crate::models::coordinate::{EntityType, GeoPoint};
use crate::models::events::{DriverInfo, DriverResponse, Event};
use crate::models::frames::{RideDetails, RideMatched, RideResponseFrame, ServerFrame};
use crate::observability::metrics::Metrics;
use crate::store::{AssignOutcome, DriverRepository, LocationRepository, RideRepository};

pub struct DriverResponder {
    rides: Arc<dyn RideRepository>,
    drivers: Arc<dyn DriverRepository>,
    locations: Arc<dyn LocationRepository>,
    publisher: Publisher,
}

impl DriverResponder {
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

    /// Publishes the authenticated driver's answer to an offer. The driver id
    /// always comes from the connection, never from the frame.
    pub async fn respond(
        &self,
        driver_id: Uuid,
        frame: RideResponseFrame,
    ) -> Result<DriverResponse, AppError> {
        let driver = self
            .drivers
            .find_driver(driver_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("driver {driver_id} not found")))?;
        let ride = self
            .rides
            .find_ride(frame.ride_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("ride {} not found", frame.ride_id)))?;

        let driver_location = match frame.current_location {
            Some(position) => {
                let point = GeoPoint::from(position);
                geo::validate(&point)?;
                Some(point)
            }
            None => self
                .locations
                .current(driver_id, EntityType::Driver)
                .await?
                .map(|c| c.point()),
        };

        let mut estimated_arrival_minutes = None;
        if frame.accepted {
            if let (Some(from), Some(pickup)) = (
                driver_location,
                self.locations.find_coordinate(ride.pickup_coordinate_id).await?,
            ) {
                let distance_km = geo::haversine_km(&from, &pickup.point());
                estimated_arrival_minutes = Some(geo::travel_minutes(distance_km));
            }
        }

        let response = DriverResponse {
            ride_id: ride.id,
            driver_id,
            accepted: frame.accepted,
            estimated_arrival_minutes,
            driver_location,
            driver_info: Some(DriverInfo {
                name: driver.name,
                rating: driver.rating,
                vehicle: Some(driver.vehicle),
            }),
        };

        self.publisher
            .publish(&Event::DriverResponse(response.clone()))
            .await?;

        info!(
            ride_id = %response.ride_id,
            driver_id = %driver_id,
            accepted = response.accepted,
            offer_id = frame.offer_id.as_deref().unwrap_or_default(),
            "driver response published"
        );
        Ok(response)
    }
}

pub struct ResponseReconciler {
    rides: Arc<dyn RideRepository>,
    hub: Hub,
    metrics: Metrics,
}

impl ResponseReconciler {
    pub fn new(rides: Arc<dyn RideRepository>, hub: Hub, metrics: Metrics) -> Self {
        Self {
            rides,
            hub,
            metrics,
        }
    }

    /// Rejections and lost races are settled successfully; only a storage
    /// failure on the conditional assignment is reported, so it is retried.
    pub async fn reconcile(&self, response: &DriverResponse) -> Result<(), AppError> {
        if !response.accepted {
            self.count("rejected");
            info!(ride_id = %response.ride_id, driver_id = %response.driver_id, "driver rejected ride offer");
            return Ok(());
        }

        let outcome = self
            .rides
            .assign_driver(response.ride_id, response.driver_id, Utc::now())
            .await?;
        self.count(outcome.label());

        let ride = match outcome {
            AssignOutcome::Assigned(ride) => ride,
            AssignOutcome::AlreadyTaken => {
                info!(ride_id = %response.ride_id, driver_id = %response.driver_id, "ride already matched, acceptance ignored");
                return Ok(());
            }
            AssignOutcome::DriverUnavailable => {
                warn!(ride_id = %response.ride_id, driver_id = %response.driver_id, "driver cannot take rides, acceptance ignored");
                return Ok(());
            }
            AssignOutcome::RideNotFound => {
                warn!(ride_id = %response.ride_id, driver_id = %response.driver_id, "acceptance for unknown ride");
                return Ok(());
            }
        };

        info!(
            ride_id = %ride.id,
            ride_number = %ride.ride_number,
            driver_id = %response.driver_id,
            passenger_id = %ride.passenger_id,
            "driver assigned"
        );

        let matched = ServerFrame::RideMatched(RideMatched {
            ride_id: ride.id,
            ride_number: ride.ride_number.clone(),
            driver_id: response.driver_id,
            estimated_arrival_minutes: response.estimated_arrival_minutes,
            driver_location: response.driver_location,
            driver_info: response.driver_info.clone(),
            matched_at: ride.matched_at.unwrap_or(ride.updated_at),
        });
        if let Err(err) = self.hub.send_to_user(ride.passenger_id, &matched).await {
            warn!(ride_id = %ride.id, error = %err, "failed to notify passenger of match");
        }

        let details = ServerFrame::RideDetails(RideDetails {
            ride_id: ride.id,
            ride_number: ride.ride_number.clone(),
            passenger_id: ride.passenger_id,
            status: ride.status,
            estimated_fare: ride.estimated_fare,
        });
        if let Err(err) = self.hub.send_to_user(response.driver_id, &details).await {
            warn!(ride_id = %ride.id, error = %err, "failed to send ride details to driver");
        }

        Ok(())
    }

    fn count(&self, outcome: &str) {
        self.metrics
            .assignments_total
            .with_label_values(&[outcome])
            .inc();
    }
}

#[async_trait]
impl MessageHandler for ResponseReconciler {
    async fn handle(&self, event: Event) -> Result<(), AppError> {
        match event {
            Event::DriverResponse(response) => self.reconcile(&response).await,
            other => Err(AppError::BadRequest(format!(
                "reconciler cannot handle {}",
                other.routing_key()
            ))),
        }
    }
}

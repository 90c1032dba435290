//! Message schemas exchanged between services over the bus.
//!
//! Every message kind is one [`Event`] variant. Addressing (exchange and
//! routing key) is derived from the variant, and decoding dispatches on the
//! routing key rather than on fields inside the body.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::coordinate::{GeoPoint, Place};
use crate::models::driver::{DriverStatus, VehicleInfo};
use crate::models::ride::VehicleType;

pub const RIDE_TOPIC: &str = "ride_topic";
pub const DRIVER_TOPIC: &str = "driver_topic";
pub const LOCATION_FANOUT: &str = "location_fanout";

pub const RIDE_REQUESTED_KEY: &str = "ride.requested";
const DRIVER_RESPONSE_PREFIX: &str = "driver.response.";
const DRIVER_STATUS_PREFIX: &str = "driver.status.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RideRequested {
    pub ride_id: Uuid,
    pub ride_number: String,
    pub vehicle_type: VehicleType,
    pub pickup_location: Place,
    pub destination_location: Place,
    pub estimated_fare: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverInfo {
    pub name: String,
    pub rating: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle: Option<VehicleInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverResponse {
    pub ride_id: Uuid,
    pub driver_id: Uuid,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_arrival_minutes: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_location: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_info: Option<DriverInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverStatusChanged {
    pub driver_id: Uuid,
    pub status: DriverStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ride_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationBroadcast {
    pub driver_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ride_id: Option<Uuid>,
    pub location: GeoPoint,
    #[serde(default)]
    pub speed_kmh: f64,
    #[serde(default)]
    pub heading_degrees: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    RideRequested(RideRequested),
    DriverResponse(DriverResponse),
    DriverStatus(DriverStatusChanged),
    LocationUpdated(LocationBroadcast),
}

impl Event {
    pub fn exchange(&self) -> &'static str {
        match self {
            Event::RideRequested(_) => RIDE_TOPIC,
            Event::DriverResponse(_) | Event::DriverStatus(_) => DRIVER_TOPIC,
            Event::LocationUpdated(_) => LOCATION_FANOUT,
        }
    }

    pub fn routing_key(&self) -> String {
        match self {
            Event::RideRequested(_) => RIDE_REQUESTED_KEY.to_string(),
            Event::DriverResponse(resp) => format!("{DRIVER_RESPONSE_PREFIX}{}", resp.ride_id),
            Event::DriverStatus(status) => format!("{DRIVER_STATUS_PREFIX}{}", status.driver_id),
            Event::LocationUpdated(_) => String::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, AppError> {
        let body = match self {
            Event::RideRequested(e) => serde_json::to_vec(e),
            Event::DriverResponse(e) => serde_json::to_vec(e),
            Event::DriverStatus(e) => serde_json::to_vec(e),
            Event::LocationUpdated(e) => serde_json::to_vec(e),
        };
        body.map_err(|err| AppError::Internal(format!("failed to encode event: {err}")))
    }

    /// Decodes a delivery. Any failure here is a malformed message and is
    /// reported as `BadRequest` so consumers dead-letter it.
    pub fn decode(exchange: &str, routing_key: &str, body: &[u8]) -> Result<Event, AppError> {
        if exchange == LOCATION_FANOUT {
            return parse(body).map(Event::LocationUpdated);
        }

        if routing_key == RIDE_REQUESTED_KEY {
            return parse(body).map(Event::RideRequested);
        }

        if let Some(suffix) = routing_key.strip_prefix(DRIVER_RESPONSE_PREFIX) {
            let ride_id = key_id(routing_key, suffix)?;
            let response: DriverResponse = parse(body)?;
            if response.ride_id != ride_id {
                return Err(AppError::BadRequest(format!(
                    "ride id mismatch: routing key says {ride_id}, body says {}",
                    response.ride_id
                )));
            }
            return Ok(Event::DriverResponse(response));
        }

        if let Some(suffix) = routing_key.strip_prefix(DRIVER_STATUS_PREFIX) {
            let driver_id = key_id(routing_key, suffix)?;
            let status: DriverStatusChanged = parse(body)?;
            if status.driver_id != driver_id {
                return Err(AppError::BadRequest(format!(
                    "driver id mismatch: routing key says {driver_id}, body says {}",
                    status.driver_id
                )));
            }
            return Ok(Event::DriverStatus(status));
        }

        Err(AppError::BadRequest(format!(
            "unroutable message: exchange={exchange} key={routing_key}"
        )))
    }
}

fn parse<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, AppError> {
    serde_json::from_slice(body).map_err(|err| AppError::BadRequest(format!("malformed body: {err}")))
}

fn key_id(routing_key: &str, suffix: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(suffix)
        .map_err(|_| AppError::BadRequest(format!("invalid routing key: {routing_key}")))
}

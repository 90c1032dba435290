//! Frames exchanged with live clients over the duplex connection.
//!
//! After the handshake every frame is a `{"type": ..., "data": ...}` envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::coordinate::{GeoPoint, Place};
use crate::models::events::DriverInfo;
use crate::models::ride::RideStatus;

/// First frame a client must send.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthFrame {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthAck {
    pub status: String,
    pub user_id: Uuid,
}

impl AuthAck {
    pub fn authenticated(user_id: Uuid) -> Self {
        Self {
            status: "authenticated".to_string(),
            user_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerFrame {
    RideOffer(RideOffer),
    RideDetails(RideDetails),
    RideStatusUpdate(RideStatusUpdate),
    DriverLocationUpdate(DriverLocationUpdate),
    RideMatched(RideMatched),
    Pong { status: String },
    Error { message: String },
}

impl ServerFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::RideOffer(_) => "ride_offer",
            ServerFrame::RideDetails(_) => "ride_details",
            ServerFrame::RideStatusUpdate(_) => "ride_status_update",
            ServerFrame::DriverLocationUpdate(_) => "driver_location_update",
            ServerFrame::RideMatched(_) => "ride_matched",
            ServerFrame::Pong { .. } => "pong",
            ServerFrame::Error { .. } => "error",
        }
    }

    pub fn to_text(&self) -> Result<String, AppError> {
        serde_json::to_string(self)
            .map_err(|err| AppError::Internal(format!("failed to encode {} frame: {err}", self.kind())))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RideOffer {
    pub offer_id: String,
    pub ride_id: Uuid,
    pub ride_number: String,
    pub pickup_location: Place,
    pub destination_location: Place,
    pub estimated_fare: f64,
    pub driver_earnings: f64,
    pub distance_to_pickup_km: f64,
    pub estimated_ride_duration_min: i32,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RideDetails {
    pub ride_id: Uuid,
    pub ride_number: String,
    pub passenger_id: Uuid,
    pub status: RideStatus,
    pub estimated_fare: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RideStatusUpdate {
    pub ride_id: Uuid,
    pub status: RideStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverLocationUpdate {
    pub ride_id: Uuid,
    pub driver_id: Uuid,
    pub location: GeoPoint,
    pub speed_kmh: f64,
    pub heading_degrees: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RideMatched {
    pub ride_id: Uuid,
    pub ride_number: String,
    pub driver_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_arrival_minutes: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_location: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_info: Option<DriverInfo>,
    pub matched_at: DateTime<Utc>,
}

/// Client-side position in the shape mobile clients send it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

impl From<Position> for GeoPoint {
    fn from(p: Position) -> Self {
        GeoPoint {
            lat: p.latitude,
            lng: p.longitude,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RideResponseFrame {
    #[serde(default)]
    pub offer_id: Option<String>,
    pub ride_id: Uuid,
    pub accepted: bool,
    #[serde(default)]
    pub current_location: Option<Position>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LocationUpdateFrame {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy_meters: Option<f64>,
    #[serde(default)]
    pub speed_kmh: Option<f64>,
    #[serde(default)]
    pub heading_degrees: Option<f64>,
    #[serde(default)]
    pub ride_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Ping,
    RideResponse(RideResponseFrame),
    LocationUpdate(LocationUpdateFrame),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<ClientFrame, AppError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|err| AppError::BadRequest(format!("malformed frame: {err}")))?;

        match envelope.kind.as_str() {
            "ping" => Ok(ClientFrame::Ping),
            "ride_response" => data(envelope.data).map(ClientFrame::RideResponse),
            "location_update" => data(envelope.data).map(ClientFrame::LocationUpdate),
            other => Err(AppError::BadRequest(format!("unsupported frame type: {other}"))),
        }
    }
}

fn data<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T, AppError> {
    serde_json::from_value(value)
        .map_err(|err| AppError::BadRequest(format!("malformed frame data: {err}")))
}

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// A point with a human-readable address, as carried by ride events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Place {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub address: String,
}

impl Place {
    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Driver,
    Passenger,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Driver => "driver",
            EntityType::Passenger => "passenger",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "driver" => Ok(EntityType::Driver),
            "passenger" => Ok(EntityType::Passenger),
            other => Err(AppError::Internal(format!("unknown entity type: {other}"))),
        }
    }
}

/// Optional fare/distance/duration annotation carried by trip waypoints.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct TripEstimate {
    pub fare_amount: Option<f64>,
    pub distance_km: Option<f64>,
    pub duration_minutes: Option<i32>,
}

/// One geotagged row: either an entity's live position (`is_current`) or a
/// trip waypoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coordinate {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub entity_type: EntityType,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(flatten)]
    pub estimate: TripEstimate,
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Coordinate {
    pub fn current(
        entity_id: Uuid,
        entity_type: EntityType,
        point: GeoPoint,
        address: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id,
            entity_type,
            address: address.into(),
            latitude: point.lat,
            longitude: point.lng,
            estimate: TripEstimate::default(),
            is_current: true,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn waypoint(
        entity_id: Uuid,
        entity_type: EntityType,
        place: &Place,
        estimate: TripEstimate,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id,
            entity_type,
            address: place.address.clone(),
            latitude: place.lat,
            longitude: place.lng,
            estimate,
            is_current: false,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.latitude,
            lng: self.longitude,
        }
    }
}

/// Append-only trail of accepted driver positions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationHistory {
    pub id: Uuid,
    pub coordinate_id: Uuid,
    pub driver_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub heading_degrees: Option<f64>,
    pub ride_id: Option<Uuid>,
    pub recorded_at: DateTime<Utc>,
}

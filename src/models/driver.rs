use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::ride::VehicleType;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverStatus {
    Offline,
    Available,
    Busy,
    EnRoute,
}

impl DriverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverStatus::Offline => "OFFLINE",
            DriverStatus::Available => "AVAILABLE",
            DriverStatus::Busy => "BUSY",
            DriverStatus::EnRoute => "EN_ROUTE",
        }
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OFFLINE" => Ok(DriverStatus::Offline),
            "AVAILABLE" => Ok(DriverStatus::Available),
            "BUSY" => Ok(DriverStatus::Busy),
            "EN_ROUTE" => Ok(DriverStatus::EnRoute),
            other => Err(AppError::Internal(format!("unknown driver status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VehicleInfo {
    pub make: String,
    pub model: String,
    pub color: String,
    pub plate: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub id: Uuid,
    pub name: String,
    pub vehicle_type: VehicleType,
    pub vehicle: VehicleInfo,
    pub status: DriverStatus,
    pub is_verified: bool,
    pub rating: f64,
    pub total_rides: i64,
    pub total_earnings: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Driver {
    pub fn can_go_online(&self) -> bool {
        self.status == DriverStatus::Offline && self.is_verified
    }

    /// A driver with a passenger aboard or on the way to one stays online.
    pub fn can_go_offline(&self) -> bool {
        self.status == DriverStatus::Available
    }

    pub fn can_accept_ride(&self) -> bool {
        self.status == DriverStatus::Available && self.is_verified
    }

    pub fn can_start_ride(&self) -> bool {
        matches!(self.status, DriverStatus::Available | DriverStatus::EnRoute)
    }

    pub fn can_complete_ride(&self) -> bool {
        self.status == DriverStatus::Busy
    }

    pub fn credit_ride(&mut self, earnings: f64) {
        self.total_rides += 1;
        self.total_earnings += earnings;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSession {
    pub id: Uuid,
    pub driver_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_rides: i64,
    pub total_earnings: f64,
}

impl DriverSession {
    pub fn open(driver_id: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            driver_id,
            started_at: at,
            ended_at: None,
            total_rides: 0,
            total_earnings: 0.0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn credit_ride(&mut self, earnings: f64) {
        self.total_rides += 1;
        self.total_earnings += earnings;
    }

    pub fn summary(&self) -> SessionSummary {
        let ended_at = self.ended_at.unwrap_or_else(Utc::now);
        let elapsed = ended_at - self.started_at;
        let duration_hours = elapsed
            .num_microseconds()
            .map(|us| us as f64 / 3_600_000_000.0)
            .unwrap_or_else(|| elapsed.num_seconds() as f64 / 3_600.0);

        SessionSummary {
            session_id: self.id,
            duration_hours,
            rides_completed: self.total_rides,
            earnings: self.total_earnings,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub duration_hours: f64,
    pub rides_completed: i64,
    pub earnings: f64,
}

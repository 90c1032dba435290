use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleType {
    Economy,
    Premium,
    Xl,
}

impl VehicleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleType::Economy => "ECONOMY",
            VehicleType::Premium => "PREMIUM",
            VehicleType::Xl => "XL",
        }
    }
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VehicleType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ECONOMY" => Ok(VehicleType::Economy),
            "PREMIUM" => Ok(VehicleType::Premium),
            "XL" => Ok(VehicleType::Xl),
            other => Err(AppError::BadRequest(format!(
                "unknown vehicle type: {other}, expected ECONOMY/PREMIUM/XL"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideStatus {
    Requested,
    Matched,
    InProgress,
    Completed,
    Cancelled,
}

impl RideStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RideStatus::Requested => "REQUESTED",
            RideStatus::Matched => "MATCHED",
            RideStatus::InProgress => "IN_PROGRESS",
            RideStatus::Completed => "COMPLETED",
            RideStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    /// Ride status only moves forward; cancellation is possible until the
    /// trip has started.
    pub fn can_transition_to(&self, next: RideStatus) -> bool {
        matches!(
            (self, next),
            (RideStatus::Requested, RideStatus::Matched)
                | (RideStatus::Matched, RideStatus::InProgress)
                | (RideStatus::InProgress, RideStatus::Completed)
                | (RideStatus::Requested, RideStatus::Cancelled)
                | (RideStatus::Matched, RideStatus::Cancelled)
        )
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RideStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REQUESTED" => Ok(RideStatus::Requested),
            "MATCHED" => Ok(RideStatus::Matched),
            "IN_PROGRESS" => Ok(RideStatus::InProgress),
            "COMPLETED" => Ok(RideStatus::Completed),
            "CANCELLED" => Ok(RideStatus::Cancelled),
            other => Err(AppError::Internal(format!("unknown ride status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ride {
    pub id: Uuid,
    pub ride_number: String,
    pub passenger_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub vehicle_type: VehicleType,
    pub status: RideStatus,
    pub priority: i32,
    pub requested_at: DateTime<Utc>,
    pub matched_at: Option<DateTime<Utc>>,
    pub arrived_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub estimated_fare: f64,
    pub final_fare: Option<f64>,
    pub pickup_coordinate_id: Uuid,
    pub destination_coordinate_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ride {
    /// `RIDE-YYYYMMDD-NNNNNN` with a random six-digit suffix.
    pub fn number_for(at: DateTime<Utc>) -> String {
        let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
        format!("RIDE-{}-{:06}", at.format("%Y%m%d"), suffix)
    }

    pub fn is_assigned_to(&self, driver_id: Uuid) -> bool {
        self.driver_id == Some(driver_id)
    }

    /// The predicate guarding the driver assignment race.
    pub fn can_be_matched(&self) -> bool {
        self.status == RideStatus::Requested && self.driver_id.is_none()
    }

    pub fn can_start(&self, driver_id: Uuid) -> bool {
        self.status.can_transition_to(RideStatus::InProgress) && self.is_assigned_to(driver_id)
    }

    pub fn can_complete(&self, driver_id: Uuid) -> bool {
        self.status.can_transition_to(RideStatus::Completed) && self.is_assigned_to(driver_id)
    }

    pub fn can_cancel(&self) -> bool {
        self.status.can_transition_to(RideStatus::Cancelled)
    }

    pub fn mark_matched(&mut self, driver_id: Uuid, at: DateTime<Utc>) {
        self.driver_id = Some(driver_id);
        self.status = RideStatus::Matched;
        self.matched_at = Some(at);
        self.updated_at = at;
    }

    pub fn mark_started(&mut self, at: DateTime<Utc>) {
        self.status = RideStatus::InProgress;
        self.started_at = Some(at);
        self.updated_at = at;
    }

    pub fn mark_completed(&mut self, final_fare: f64, at: DateTime<Utc>) {
        self.status = RideStatus::Completed;
        self.final_fare = Some(final_fare);
        self.completed_at = Some(at);
        self.updated_at = at;
    }

    pub fn mark_cancelled(&mut self, reason: String, at: DateTime<Utc>) {
        self.status = RideStatus::Cancelled;
        self.cancellation_reason = Some(reason);
        self.cancelled_at = Some(at);
        self.updated_at = at;
    }

    /// Final fare falls back to the estimate when nothing adjusted it.
    pub fn settled_fare(&self) -> f64 {
        self.final_fare.unwrap_or(self.estimated_fare)
    }
}

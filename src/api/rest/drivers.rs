use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::post;
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::auth::Authenticated;
use crate::auth::Role;
use crate::engine::lifecycle::TripReport;
use crate::error::AppError;
use crate::models::coordinate::{Coordinate, GeoPoint};
use crate::models::driver::{DriverStatus, SessionSummary};
use crate::models::frames::LocationUpdateFrame;
use crate::models::ride::RideStatus;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers/:id/online", post(go_online))
        .route("/drivers/:id/offline", post(go_offline))
        .route(
            "/drivers/:id/location",
            post(update_location).get(current_location),
        )
        .route("/drivers/:id/start", post(start_ride))
        .route("/drivers/:id/complete", post(complete_ride))
}

fn point(latitude: Option<f64>, longitude: Option<f64>) -> Result<Option<GeoPoint>, AppError> {
    match (latitude, longitude) {
        (Some(lat), Some(lng)) => Ok(Some(GeoPoint { lat, lng })),
        (None, None) => Ok(None),
        _ => Err(AppError::BadRequest(
            "latitude and longitude must be given together".to_string(),
        )),
    }
}

#[derive(Deserialize, Default)]
pub struct PositionBody {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Serialize)]
pub struct OnlineResponse {
    pub session_id: Uuid,
    pub status: DriverStatus,
    pub message: &'static str,
}

async fn go_online(
    State(state): State<Arc<AppState>>,
    auth: Authenticated,
    Path(id): Path<Uuid>,
    body: Option<Json<PositionBody>>,
) -> Result<Json<OnlineResponse>, AppError> {
    auth.as_driver(id)?;
    let Json(body) = body.unwrap_or_default();
    let position = point(body.latitude, body.longitude)?;

    let session = state.lifecycle.go_online(id, position).await?;
    Ok(Json(OnlineResponse {
        session_id: session.id,
        status: DriverStatus::Available,
        message: "You are now online and ready to accept rides",
    }))
}

#[derive(Serialize)]
pub struct OfflineResponse {
    pub session_id: Uuid,
    pub status: DriverStatus,
    pub session_summary: SessionSummary,
    pub message: &'static str,
}

async fn go_offline(
    State(state): State<Arc<AppState>>,
    auth: Authenticated,
    Path(id): Path<Uuid>,
) -> Result<Json<OfflineResponse>, AppError> {
    auth.as_driver(id)?;

    let summary = state.lifecycle.go_offline(id).await?;
    Ok(Json(OfflineResponse {
        session_id: summary.session_id,
        status: DriverStatus::Offline,
        session_summary: summary,
        message: "You are now offline",
    }))
}

#[derive(Serialize)]
pub struct LocationResponse {
    pub coordinate_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    auth: Authenticated,
    Path(id): Path<Uuid>,
    Json(frame): Json<LocationUpdateFrame>,
) -> Result<Json<LocationResponse>, AppError> {
    auth.as_driver(id)?;

    let coordinate = state.locations.update(id, frame.into()).await?;
    Ok(Json(LocationResponse {
        coordinate_id: coordinate.id,
        updated_at: coordinate.updated_at,
    }))
}

async fn current_location(
    State(state): State<Arc<AppState>>,
    Authenticated(identity): Authenticated,
    Path(id): Path<Uuid>,
) -> Result<Json<Coordinate>, AppError> {
    if identity.role != Role::Admin {
        Authenticated(identity).as_driver(id)?;
    }

    state
        .locations
        .current(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no location yet for driver {id}")))
}

#[derive(Deserialize)]
pub struct StartRideRequest {
    pub ride_id: Uuid,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

#[derive(Serialize)]
pub struct StartRideResponse {
    pub ride_id: Uuid,
    pub status: RideStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub message: &'static str,
}

async fn start_ride(
    State(state): State<Arc<AppState>>,
    auth: Authenticated,
    Path(id): Path<Uuid>,
    Json(payload): Json<StartRideRequest>,
) -> Result<Json<StartRideResponse>, AppError> {
    auth.as_driver(id)?;
    let position = point(payload.latitude, payload.longitude)?;

    let ride = state
        .lifecycle
        .start_ride(id, payload.ride_id, position)
        .await?;
    Ok(Json(StartRideResponse {
        ride_id: ride.id,
        status: ride.status,
        started_at: ride.started_at,
        message: "Ride started successfully",
    }))
}

#[derive(Deserialize)]
pub struct CompleteRideRequest {
    pub ride_id: Uuid,
    #[serde(default)]
    pub final_latitude: Option<f64>,
    #[serde(default)]
    pub final_longitude: Option<f64>,
    #[serde(default)]
    pub actual_distance_km: Option<f64>,
    #[serde(default)]
    pub actual_duration_minutes: Option<i32>,
}

#[derive(Serialize)]
pub struct CompleteRideResponse {
    pub ride_id: Uuid,
    pub status: RideStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub final_fare: Option<f64>,
    pub driver_earnings: f64,
    pub message: &'static str,
}

async fn complete_ride(
    State(state): State<Arc<AppState>>,
    auth: Authenticated,
    Path(id): Path<Uuid>,
    Json(payload): Json<CompleteRideRequest>,
) -> Result<Json<CompleteRideResponse>, AppError> {
    auth.as_driver(id)?;
    let report = TripReport {
        final_location: point(payload.final_latitude, payload.final_longitude)?,
        actual_distance_km: payload.actual_distance_km,
        actual_duration_minutes: payload.actual_duration_minutes,
    };

    let done = state
        .lifecycle
        .complete_ride(id, payload.ride_id, report)
        .await?;
    Ok(Json(CompleteRideResponse {
        ride_id: done.ride.id,
        status: done.ride.status,
        completed_at: done.ride.completed_at,
        final_fare: done.ride.final_fare,
        driver_earnings: done.driver_earnings,
        message: "Ride completed successfully",
    }))
}

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::auth::Authenticated;
use crate::auth::Role;
use crate::engine::rides::RideRequest;
use crate::error::AppError;
use crate::models::coordinate::Place;
use crate::models::ride::{Ride, RideStatus, VehicleType};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/rides", post(create_ride))
        .route("/rides/:id", get(get_ride))
        .route("/rides/:id/cancel", post(cancel_ride))
}

#[derive(Deserialize)]
pub struct CreateRideRequest {
    pub vehicle_type: String,
    pub pickup_lat: f64,
    pub pickup_lng: f64,
    #[serde(default)]
    pub pickup_address: String,
    pub destination_lat: f64,
    pub destination_lng: f64,
    #[serde(default)]
    pub destination_address: String,
    #[serde(default)]
    pub priority: Option<i32>,
}

#[derive(Serialize)]
pub struct CreateRideResponse {
    pub ride_id: Uuid,
    pub ride_number: String,
    pub status: RideStatus,
    pub estimated_fare: f64,
}

async fn create_ride(
    State(state): State<Arc<AppState>>,
    Authenticated(identity): Authenticated,
    Json(payload): Json<CreateRideRequest>,
) -> Result<(StatusCode, Json<CreateRideResponse>), AppError> {
    identity.require_role(Role::Passenger)?;
    let vehicle_type: VehicleType = payload.vehicle_type.parse()?;

    let request = RideRequest {
        pickup: Place {
            lat: payload.pickup_lat,
            lng: payload.pickup_lng,
            address: payload.pickup_address,
        },
        destination: Place {
            lat: payload.destination_lat,
            lng: payload.destination_lng,
            address: payload.destination_address,
        },
        vehicle_type,
        priority: payload.priority,
    };
    let ride = state.rides.request(identity.user_id, request).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateRideResponse {
            ride_id: ride.id,
            ride_number: ride.ride_number,
            status: ride.status,
            estimated_fare: ride.estimated_fare,
        }),
    ))
}

async fn get_ride(
    State(state): State<Arc<AppState>>,
    Authenticated(identity): Authenticated,
    Path(id): Path<Uuid>,
) -> Result<Json<Ride>, AppError> {
    let ride = state.rides.get(&identity, id).await?;
    Ok(Json(ride))
}

#[derive(Deserialize, Default)]
pub struct CancelRideRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

async fn cancel_ride(
    State(state): State<Arc<AppState>>,
    Authenticated(identity): Authenticated,
    Path(id): Path<Uuid>,
    payload: Option<Json<CancelRideRequest>>,
) -> Result<Json<Ride>, AppError> {
    identity.require_role(Role::Passenger)?;
    let Json(payload) = payload.unwrap_or_default();

    let ride = state
        .rides
        .cancel(identity.user_id, id, payload.reason)
        .await?;
    Ok(Json(ride))
}

//! HTTP handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use ridenow_protocol::RideId;
use serde::Serialize;
use tracing::instrument;

use crate::auth::CurrentUser;
use crate::relay::RelayMode;
use crate::rides::{Actor, CreateRideRequest, Ride};
use crate::worker::WorkerStatsSnapshot;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub relay_mode: RelayMode,
    pub sessions: usize,
    pub connected_users: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerStatsSnapshot>,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        relay_mode: state.relay_mode(),
        sessions: state.registry.session_count(),
        connected_users: state.registry.connected_user_count(),
        worker: state.worker_stats.as_ref().map(|stats| stats.snapshot()),
    })
}

/// A created ride and whether it reached the assignment queue.
#[derive(Debug, Serialize)]
pub struct CreateRideResponse {
    #[serde(flatten)]
    pub ride: Ride,
    pub queued: bool,
}

/// Resolve the token subject to a known user.
async fn actor(state: &AppState, user: &CurrentUser) -> ApiResult<Actor> {
    state
        .rides
        .actor(&user.id())
        .await?
        .ok_or_else(|| ApiError::unauthorized("User not found"))
}

/// Create a ride for the authenticated rider.
#[instrument(skip(state, user, request), fields(user_id = %user.id()))]
pub async fn create_ride(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(request): Json<CreateRideRequest>,
) -> ApiResult<(StatusCode, Json<CreateRideResponse>)> {
    let actor = actor(&state, &user).await?;
    let created = state
        .rides
        .request_ride(&actor, &request.pickup, &request.dropoff)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateRideResponse {
            ride: created.ride,
            queued: created.queued,
        }),
    ))
}

/// Rides where the caller is rider or driver.
#[instrument(skip(state, user), fields(user_id = %user.id()))]
pub async fn my_rides(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<Vec<Ride>>> {
    let actor = actor(&state, &user).await?;
    Ok(Json(state.rides.rides_for(&actor).await?))
}

#[instrument(skip(state, user), fields(user_id = %user.id()))]
pub async fn get_ride(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(ride_id): Path<i64>,
) -> ApiResult<Json<Ride>> {
    let actor = actor(&state, &user).await?;
    Ok(Json(state.rides.ride_for(&actor, RideId::new(ride_id)).await?))
}

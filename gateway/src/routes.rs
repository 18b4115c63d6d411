//! HTTP route handlers for the evaluator endpoints

use crate::{auth::AuthClaims, AppError, AppResult, AppState};
use axum::{
    extract::{rejection::JsonRejection, State},
    response::Json,
    Extension,
};
use haven_wards::ControlDecision;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Deserialize)]
pub struct GeofenceCheckRequest {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceCheckResponse {
    pub message: String,
    pub events: usize,
    pub alerts: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlCheckRequest {
    pub app_package_name: String,
    #[serde(default)]
    pub action: String,
}

/// POST /check-geofence - Evaluate one location sample for the caller
///
/// Returns how many entry/exit events and alerts the sample produced
pub async fn check_geofence(
    State(state): State<AppState>,
    Extension(claims): Extension<AuthClaims>,
    payload: Result<Json<GeofenceCheckRequest>, JsonRejection>,
) -> AppResult<Json<GeofenceCheckResponse>> {
    debug!("Handling POST /check-geofence");
    let Json(request) = payload?;

    let outcome = state
        .geofence
        .evaluate(claims.subject(), request.latitude, request.longitude)
        .await
        .map_err(|e| {
            error!("Error checking geofences: {}", e);
            AppError::from(e)
        })?;

    let message = if outcome.zones_checked == 0 {
        "No safe zones configured"
    } else {
        "Geofence check completed"
    };
    info!(
        "Geofence check for {} produced {} events and {} alerts",
        claims.subject(),
        outcome.events.len(),
        outcome.alerts.len()
    );

    Ok(Json(GeofenceCheckResponse {
        message: message.to_string(),
        events: outcome.events.len(),
        alerts: outcome.alerts.len(),
    }))
}

/// POST /check-parental-controls - Gate an app-open intent for the caller
///
/// Returns the decision, the single reason for a denial and today's screen time
pub async fn check_parental_controls(
    State(state): State<AppState>,
    Extension(claims): Extension<AuthClaims>,
    payload: Result<Json<ControlCheckRequest>, JsonRejection>,
) -> AppResult<Json<ControlDecision>> {
    debug!("Handling POST /check-parental-controls");
    let Json(request) = payload?;

    let decision = state
        .controls
        .evaluate(claims.subject(), &request.app_package_name, &request.action)
        .await
        .map_err(|e| {
            error!("Error checking parental controls: {}", e);
            AppError::from(e)
        })?;

    Ok(Json(decision))
}

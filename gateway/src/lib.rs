//! Haven Gateway
//!
//! HTTP JSON front for the geofence and parental control evaluators. The
//! caller's identity always comes from the bearer token, never the body.

pub mod auth;
pub mod config;
pub mod kv;
pub mod routes;

use anyhow::Result;
use axum::{
    extract::rejection::JsonRejection,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderName, Method, StatusCode,
    },
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use haven_domain::{Clock, ControlStore, Error, GeofenceStore, InMemoryStore, SystemClock};
use haven_geofence::GeofenceEvaluator;
use haven_wards::{parse_timezone, ControlPolicyEvaluator, LocalCalendar};
use serde_json::json;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::auth::JwtConfig;
use crate::config::{GatewayConfig, StoreBackend};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub geofence: GeofenceEvaluator,
    pub controls: ControlPolicyEvaluator,
    pub jwt_config: JwtConfig,
}

impl AppState {
    /// Wire both evaluators to one store.
    pub fn new<S>(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        calendar: LocalCalendar,
        jwt_config: JwtConfig,
    ) -> Self
    where
        S: GeofenceStore + ControlStore + 'static,
    {
        Self {
            geofence: GeofenceEvaluator::new(store.clone(), clock.clone()),
            controls: ControlPolicyEvaluator::new(store, clock, calendar),
            jwt_config,
        }
    }

    /// Build state for the configured store backend.
    pub async fn from_config(config: &GatewayConfig) -> Result<Self> {
        let calendar = LocalCalendar::new(parse_timezone(&config.timezone)?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let jwt_config = config.jwt_config()?;

        let state = match config.store {
            StoreBackend::Memory => {
                info!("Using in-memory store; records are lost on restart");
                Self::new(Arc::new(InMemoryStore::new()), clock, calendar, jwt_config)
            }
            StoreBackend::Jetstream => {
                let store = kv::KvStore::connect(
                    &config.nats_url,
                    config.nats_creds_path.as_deref(),
                    &config.kv_bucket,
                )
                .await?;
                Self::new(Arc::new(store), clock, calendar, jwt_config)
            }
        };

        info!(
            "Successfully initialized Haven gateway state (timezone: {:?})",
            calendar.timezone()
        );
        Ok(state)
    }
}

/// Error returned to HTTP callers as `{ "error": message }`
#[derive(Debug)]
pub struct AppError {
    pub status_code: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status_code: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status_code = match &err {
            Error::Authentication(_) => StatusCode::UNAUTHORIZED,
            Error::Validation(_) | Error::Datastore(_) => StatusCode::BAD_REQUEST,
        };
        AppError {
            status_code,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::bad_request(format!("Invalid request body: {}", rejection.body_text()))
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status_code, Json(json!({ "error": self.message }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Health check endpoint
async fn healthz() -> impl IntoResponse {
    "OK"
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            AUTHORIZATION,
            CONTENT_TYPE,
            HeaderName::from_static("x-client-info"),
            HeaderName::from_static("apikey"),
        ])
}

/// Create the Axum application router
pub fn create_app(state: AppState) -> Router {
    let checks = Router::new()
        .route("/check-geofence", post(routes::check_geofence))
        .route("/check-parental-controls", post(routes::check_parental_controls))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::jwt_middleware,
        ));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(checks)
        // Avoid logging request headers so Authorization tokens never reach logs.
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state)
}

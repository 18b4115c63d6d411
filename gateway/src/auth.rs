//! JWT authentication middleware resolving the caller's subject identity

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

/// JWT Claims structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,        // Subject (tracked child's user id)
    pub exp: usize,         // Expiration time (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<usize>, // Issued at (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// Token verification settings
#[derive(Clone, Debug)]
pub struct JwtConfig {
    pub secret: String,
    pub algorithm: Algorithm,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

impl JwtConfig {
    pub fn new(secret: String, algorithm: Algorithm) -> Self {
        Self {
            secret,
            algorithm,
            issuer: None,
            audience: None,
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }
}

/// Parse an HMAC algorithm name.
pub fn parse_algorithm(name: &str) -> Result<Algorithm, String> {
    match name {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        other => Err(format!(
            "unsupported JWT algorithm '{}' (expected HS256, HS384 or HS512)",
            other
        )),
    }
}

/// Validated claims attached to the request
#[derive(Clone, Debug)]
pub struct AuthClaims(pub Claims);

impl AuthClaims {
    pub fn subject(&self) -> &str {
        &self.0.sub
    }
}

/// Rejects requests without a valid bearer token and attaches [`AuthClaims`].
pub async fn jwt_middleware(
    State(state): State<crate::AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = match request.headers().get(AUTHORIZATION) {
        Some(value) => value,
        None => {
            debug!("No Authorization header present - returning 401");
            return unauthorized_response("Missing Authorization header");
        }
    };

    let auth_str = match header.to_str() {
        Ok(s) => s,
        Err(e) => {
            warn!("Failed to parse Authorization header: {}", e);
            return unauthorized_response("Invalid Authorization header");
        }
    };

    let Some(token) = auth_str.strip_prefix("Bearer ") else {
        warn!("Authorization header not in Bearer format");
        return unauthorized_response("Authorization header must use Bearer scheme");
    };

    match verify_jwt(token, &state.jwt_config) {
        Ok(claims) if claims.sub.trim().is_empty() => {
            warn!("JWT token has an empty subject");
            unauthorized_response("Token subject is empty")
        }
        Ok(claims) => {
            debug!("JWT token validated for subject: {}", claims.sub);
            request.extensions_mut().insert(AuthClaims(claims));
            next.run(request).await
        }
        Err(e) => {
            warn!("JWT validation failed: {}", e);
            unauthorized_response("Unauthorized")
        }
    }
}

/// Verify JWT token and extract claims
pub fn verify_jwt(token: &str, config: &JwtConfig) -> Result<Claims, String> {
    let mut validation = Validation::new(config.algorithm);
    validation.validate_exp = true;
    let mut required = vec!["exp"];
    if let Some(issuer) = &config.issuer {
        validation.set_issuer(&[issuer]);
        required.push("iss");
    }
    match &config.audience {
        Some(audience) => {
            validation.set_audience(&[audience]);
            required.push("aud");
        }
        None => validation.validate_aud = false,
    }
    validation.set_required_spec_claims(&required);

    let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

    let token_data = decode::<Claims>(token, &decoding_key, &validation)
        .map_err(|e| format!("Token decode error: {}", e))?;

    Ok(token_data.claims)
}

fn unauthorized_response(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
}

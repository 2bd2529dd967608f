//! Caller authentication.
//!
//! A request identifies its caller either with a `Bearer` JWT or with an
//! `X-API-Key` header matched against `users.api_key`. The resolved user id
//! becomes the creator reference of any broadcast the request creates.

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herald_common::error::AppError;

use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// User UUID
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

/// How the caller proved who they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Jwt,
    ApiKey,
}

impl AuthMethod {
    /// Label used in audit log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMethod::Jwt => "jwt",
            AuthMethod::ApiKey => "api_key",
        }
    }
}

/// Authenticated caller, usable as an Axum extractor.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub method: AuthMethod,
}

pub fn encode_jwt(user_id: Uuid, secret: &str, expiry_hours: u64) -> Result<String, AppError> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (now + Duration::hours(expiry_hours as i64)).timestamp(),
        iat: now.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Auth(format!("Failed to encode JWT: {}", e)))
}

pub fn decode_jwt(token: &str, secret: &str) -> Result<Claims, AppError> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| AppError::Auth(format!("Invalid token: {}", e)))?;

    Ok(token_data.claims)
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let secret = state.config.jwt_secret.clone();
        let pool = state.pool.clone();
        let bearer = header(&parts.headers, "authorization");
        let api_key = header(&parts.headers, "x-api-key");

        async move {
            if let Some(auth) = bearer
                && let Some(token) = auth.strip_prefix("Bearer ")
            {
                let claims = decode_jwt(token.trim(), &secret)?;
                let user_id = Uuid::parse_str(&claims.sub)
                    .map_err(|_| AppError::Auth("Invalid user ID in token".to_string()))?;
                return Ok(AuthUser {
                    user_id,
                    method: AuthMethod::Jwt,
                });
            }

            if let Some(api_key) = api_key {
                let found: Option<(Uuid,)> =
                    sqlx::query_as("SELECT id FROM users WHERE api_key = $1 AND is_active")
                        .bind(&api_key)
                        .fetch_optional(&pool)
                        .await?;

                if let Some((user_id,)) = found {
                    return Ok(AuthUser {
                        user_id,
                        method: AuthMethod::ApiKey,
                    });
                }
                tracing::debug!("Rejected unknown API key");
            }

            Err(AppError::Auth(
                "Missing or invalid credentials. Use 'Bearer <JWT>' or 'X-API-Key: <key>'"
                    .to_string(),
            ))
        }
    }
}

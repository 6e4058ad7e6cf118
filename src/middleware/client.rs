use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::rate_limit::RateRule;
use crate::{AppState, config::Config, error::AppError};

const MEMBER_ROLE: &str = "authenticated";
const UNKNOWN_IP: &str = "0.0.0.0";

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub role: Option<String>,
    pub exp: i64,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then_some(token)
}

pub fn verify_token(config: &Config, token: &str) -> Result<Claims, AppError> {
    let secret = config.jwt_secret.as_deref().ok_or(AppError::Unauthorized)?;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )?;
    Ok(data.claims)
}

fn client_ip(headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header("x-real-ip"))
        .unwrap_or(UNKNOWN_IP)
        .to_string()
}

/// SHA-256 hex digest, the only form in which client keys reach logs.
pub fn hashed_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Rate-limit identity: `member:<sub>` for a verified member token, otherwise
/// `guest:<ip>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub key: String,
    pub is_member: bool,
}

impl ClientIdentity {
    pub fn resolve(config: &Config, headers: &HeaderMap) -> Self {
        let member = bearer_token(headers)
            .and_then(|token| verify_token(config, token).ok())
            .filter(|claims| claims.role.as_deref() == Some(MEMBER_ROLE) && !claims.sub.is_empty());

        match member {
            Some(claims) => Self {
                key: format!("member:{}", claims.sub),
                is_member: true,
            },
            None => Self {
                key: format!("guest:{}", client_ip(headers)),
                is_member: false,
            },
        }
    }

    pub fn rule<'a>(&self, config: &'a Config) -> &'a RateRule {
        if self.is_member {
            &config.member_rate
        } else {
            &config.guest_rate
        }
    }
}

impl FromRequestParts<AppState> for ClientIdentity {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(ClientIdentity::resolve(&state.config, &parts.headers))
    }
}

/// Verified token subject. Reports are scoped to it.
pub struct AuthUser(pub String);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(AppError::Unauthorized)?;
        let claims = verify_token(&state.config, token)?;
        if claims.sub.is_empty() {
            return Err(AppError::Unauthorized);
        }
        Ok(AuthUser(claims.sub))
    }
}

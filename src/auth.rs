//! Bearer-token authentication for sqlgate
//!
//! When a secret is configured every request must carry
//! `Authorization: Bearer <secret>`. Tokens are compared by SHA-256 digest.
//! Without a secret every request is let through.

use actix_web::body::MessageBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::header::AUTHORIZATION;
use actix_web::middleware::Next;
use actix_web::{ResponseError, web};
use log::debug;
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::GatewayError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing authorization header")]
    MissingHeader,

    #[error("Invalid authorization header format")]
    InvalidFormat,

    #[error("Invalid token")]
    InvalidToken,
}

#[derive(Debug, Clone, Default)]
pub struct AuthGuard {
    secret_hash: Option<String>,
}

impl AuthGuard {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            secret_hash: secret.map(hash_token),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret_hash.is_some()
    }

    pub fn check(&self, auth_header: Option<&str>) -> Result<(), AuthError> {
        let Some(expected) = &self.secret_hash else {
            return Ok(());
        };

        let token = extract_token(auth_header)?;
        if hash_token(token) == *expected {
            Ok(())
        } else {
            Err(AuthError::InvalidToken)
        }
    }
}

/// Extract the token from a `Bearer <token>` header
pub fn extract_token(auth_header: Option<&str>) -> Result<&str, AuthError> {
    let header = auth_header.ok_or(AuthError::MissingHeader)?;
    header
        .strip_prefix("Bearer ")
        .ok_or(AuthError::InvalidFormat)
}

/// Hash a token using SHA-256
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Random 32-byte secret, hex encoded
pub fn generate_secret() -> String {
    let random_bytes: [u8; 32] = rand::rng().random();
    hex::encode(random_bytes)
}

/// Middleware rejecting requests that fail the [`AuthGuard`] registered as
/// app data. Runs before routing, so unknown paths are rejected too.
pub async fn require_bearer(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<impl MessageBody>, actix_web::Error> {
    let outcome = match req.app_data::<web::Data<AuthGuard>>() {
        Some(guard) => {
            let header = req
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok());
            guard.check(header)
        }
        None => Ok(()),
    };

    if let Err(err) = outcome {
        debug!("Rejected request to {}: {}", req.path(), err);
        let response = GatewayError::from(err).error_response();
        return Ok(req.into_response(response).map_into_right_body());
    }

    next.call(req).await.map(ServiceResponse::map_into_left_body)
}

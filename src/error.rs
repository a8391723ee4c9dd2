use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

use crate::auth::AuthError;
use crate::executor::QueryError;
use crate::pool::PoolError;
use crate::response;

/// Every way a request can fail. `Display` is the text of the `error` field.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Not Authorized")]
    Unauthorized,

    #[error("Unknown route")]
    UnknownRoute,

    #[error("Not Allowed")]
    MethodNotAllowed,

    #[error("Not acceptable content-type")]
    UnacceptableContentType,

    #[error("Invalid Query")]
    InvalidQuery,

    #[error("Invalid query arguments. Expect [array | object]")]
    InvalidArguments,

    #[error("Payload too large")]
    PayloadTooLarge,

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Query(#[from] QueryError),
}

// Callers learn that auth failed, never why.
impl From<AuthError> for GatewayError {
    fn from(_: AuthError) -> Self {
        GatewayError::Unauthorized
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::UnknownRoute => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::UnacceptableContentType => StatusCode::NOT_ACCEPTABLE,
            GatewayError::InvalidQuery | GatewayError::InvalidArguments => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Pool(_) | GatewayError::Query(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        response::error(self.status_code(), &self.to_string())
    }
}

//! JSON envelope shared by every response, success or failure.
//!
//! Query results must never be cached by intermediaries, so every response
//! carries the same cache-disabling header.

use actix_web::HttpResponse;
use actix_web::http::StatusCode;
use actix_web::http::header::CACHE_CONTROL;
use serde::Serialize;

pub const NO_CACHE: &str = "max-age=0, private, no-cache, no-store, must-revalidate";

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope<'a> {
    pub error: &'a str,
}

pub fn json<T: Serialize>(status: StatusCode, payload: &T) -> HttpResponse {
    HttpResponse::build(status)
        .insert_header((CACHE_CONTROL, NO_CACHE))
        .json(payload)
}

pub fn error(status: StatusCode, message: &str) -> HttpResponse {
    json(status, &ErrorEnvelope { error: message })
}

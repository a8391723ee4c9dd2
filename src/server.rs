use actix_web::http::StatusCode;
use actix_web::http::header::CONTENT_TYPE;
use actix_web::middleware::from_fn;
use actix_web::{HttpRequest, HttpResponse, web};
use log::warn;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::auth::require_bearer;
use crate::error::GatewayError;
use crate::executor::{self, QueryConnection, RowShape};
use crate::pool::{ManageConnection, Pool};
use crate::response;

const JSON_CONTENT_TYPES: [&str; 3] = ["application/json", "text/json", "json"];

pub struct AppState<M: ManageConnection> {
    pub pool: Pool<M>,
}

impl<M: ManageConnection> AppState<M> {
    pub fn new(pool: Pool<M>) -> Self {
        Self { pool }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct QueryParams {
    #[serde(rename = "type")]
    pub shape: Option<String>,
}

/// Decoded `/query` body
#[derive(Debug, PartialEq)]
pub struct QueryRequest {
    pub query: String,
    pub args: Vec<JsonValue>,
}

impl QueryRequest {
    pub fn from_slice(body: &[u8]) -> Result<Self, GatewayError> {
        let value: JsonValue =
            serde_json::from_slice(body).map_err(|_| GatewayError::InvalidQuery)?;
        let JsonValue::Object(mut fields) = value else {
            return Err(GatewayError::InvalidQuery);
        };

        let query = match fields.remove("query") {
            Some(JsonValue::String(query)) => query,
            _ => return Err(GatewayError::InvalidQuery),
        };

        let args = match fields.remove("args") {
            None => Vec::new(),
            Some(JsonValue::Array(args)) => args,
            Some(_) => return Err(GatewayError::InvalidArguments),
        };

        Ok(Self { query, args })
    }
}

fn accepts_json(req: &HttpRequest) -> bool {
    req.headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|content_type| {
            JSON_CONTENT_TYPES
                .iter()
                .any(|prefix| content_type.starts_with(prefix))
        })
}

/// Body read failures: over the size limit, or a broken stream.
fn body_error(err: actix_web::Error) -> GatewayError {
    if err.as_response_error().status_code() == StatusCode::PAYLOAD_TOO_LARGE {
        GatewayError::PayloadTooLarge
    } else {
        GatewayError::InvalidQuery
    }
}

fn row_shape(req: &HttpRequest) -> RowShape {
    let params = web::Query::<QueryParams>::from_query(req.query_string())
        .map(web::Query::into_inner)
        .unwrap_or_default();
    RowShape::from_param(params.shape.as_deref())
}

pub async fn query_handler<M>(
    req: HttpRequest,
    body: Result<web::Bytes, actix_web::Error>,
    state: web::Data<AppState<M>>,
) -> Result<HttpResponse, GatewayError>
where
    M: ManageConnection,
    M::Connection: QueryConnection,
{
    if !accepts_json(&req) {
        return Err(GatewayError::UnacceptableContentType);
    }

    let body = body.map_err(body_error)?;
    let request = QueryRequest::from_slice(&body)?;
    let shape = row_shape(&req);

    // Released when `lease` goes out of scope, whichever way we return
    let mut lease = state.pool.acquire().await?;

    match executor::execute(&mut *lease, &request.query, &request.args, shape).await {
        Ok(result) => Ok(response::json(StatusCode::OK, &result)),
        Err(err) => {
            if err.is_fatal() {
                lease.mark_broken();
            }
            warn!("Query failed: {}", err);
            Err(err.into())
        }
    }
}

pub async fn method_not_allowed() -> Result<HttpResponse, GatewayError> {
    Err(GatewayError::MethodNotAllowed)
}

pub async fn unknown_route() -> Result<HttpResponse, GatewayError> {
    Err(GatewayError::UnknownRoute)
}

pub fn configure_routes<M>(cfg: &mut web::ServiceConfig)
where
    M: ManageConnection,
    M::Connection: QueryConnection,
{
    cfg.service(
        web::scope("")
            .wrap(from_fn(require_bearer))
            .service(
                web::resource("/query")
                    .route(web::post().to(query_handler::<M>))
                    .default_service(web::to(method_not_allowed)),
            )
            .default_service(web::to(unknown_route)),
    );
}

//! Correlation-ID middleware. Extracts an incoming `x-correlation-id` (or
//! `x-request-id`) header or mints a fresh UUID, stores it in request
//! extensions for handlers and error envelopes, and echoes it in the
//! response headers.

use axum::{
    extract::Request,
    http::{header::HeaderValue, HeaderName},
    middleware::Next,
    response::Response,
};
use sentinel_core::error::RequestContext;
use std::str::FromStr;
use uuid::Uuid;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

const ACCEPTED_HEADERS: [&str; 3] = ["x-correlation-id", "x-request-id", "x-trace-id"];

/// Extracted correlation ID, available to handlers via `Extension`.
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

pub async fn correlation_id_middleware(mut request: Request, next: Next) -> Response {
    let correlation_id = ACCEPTED_HEADERS
        .iter()
        .find_map(|name| {
            request
                .headers()
                .get(*name)
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.is_empty() && value.len() <= 128)
                .map(str::to_owned)
        })
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let context = RequestContext::new().with_correlation_id(correlation_id.clone());
    request.extensions_mut().insert(context);
    request
        .extensions_mut()
        .insert(CorrelationId(correlation_id.clone()));

    let mut response = next.run(request).await;

    if let (Ok(name), Ok(value)) = (
        HeaderName::from_str(CORRELATION_ID_HEADER),
        HeaderValue::from_str(&correlation_id),
    ) {
        response.headers_mut().insert(name, value);
    }
    response
}

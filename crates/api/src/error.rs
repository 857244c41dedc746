//! API error wrapper producing the platform's wire-exact error envelope:
//!
//! ```json
//! {"error":{"code":"VALIDATION_ERROR","message":"...","details":{},
//!   "correlationId":"...","timestamp":"ISO-8601"}}
//! ```
//!
//! with statuses 400/401/403/404/429/500. Server-side detail is logged, not
//! leaked: 5xx responses replace the message with a generic one.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sentinel_core::Error;
use tracing::{debug, error, warn};

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    error: Error,
    correlation_id: Option<String>,
}

impl ApiError {
    pub fn new(error: Error) -> Self {
        Self {
            error,
            correlation_id: None,
        }
    }

    /// Attach the correlation ID extracted by the request middleware.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    fn log(&self) {
        let status = self.error.http_status();
        match status {
            500..=599 => error!(
                error_code = %self.error.code,
                error_id = %self.error.context.error_id,
                correlation_id = ?self.correlation_id,
                "internal error: {}",
                self.error
            ),
            429 => warn!(
                error_code = %self.error.code,
                correlation_id = ?self.correlation_id,
                "rate limited: {}",
                self.error
            ),
            _ => debug!(
                error_code = %self.error.code,
                correlation_id = ?self.correlation_id,
                "client error: {}",
                self.error
            ),
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self::new(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.log();

        let status = StatusCode::from_u16(self.error.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // Internal detail never crosses the wire on 5xx.
        let mut envelope = self.error.to_api_envelope(self.correlation_id.as_deref());
        if status.is_server_error() {
            envelope["error"]["message"] =
                serde_json::Value::String("An internal error occurred".to_string());
            envelope["error"]["details"] = serde_json::Value::Null;
        }

        (status, Json(envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::ErrorCode;

    #[test]
    fn server_errors_are_sanitized() {
        let api_error = ApiError::new(Error::new(
            ErrorCode::DatabaseQueryError,
            "relation security_events does not exist",
        ));
        let mut envelope = api_error
            .error
            .to_api_envelope(api_error.correlation_id.as_deref());
        envelope["error"]["message"] =
            serde_json::Value::String("An internal error occurred".to_string());

        assert_eq!(envelope["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(envelope["error"]["message"], "An internal error occurred");
    }

    #[test]
    fn validation_errors_keep_their_message() {
        let api_error = ApiError::new(Error::invalid_input("riskLevel must be one of ..."))
            .with_correlation_id("corr-1");
        let envelope = api_error
            .error
            .to_api_envelope(api_error.correlation_id.as_deref());

        assert_eq!(envelope["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(envelope["error"]["correlationId"], "corr-1");
        assert!(envelope["error"]["message"]
            .as_str()
            .unwrap()
            .contains("riskLevel"));
    }
}

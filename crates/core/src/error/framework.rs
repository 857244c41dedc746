use super::{ErrorCode, ErrorContext, ErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

/// Severity levels for errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Low priority errors that don't affect system functionality
    Low,
    /// Medium priority errors that may degrade a single event's enrichment
    Medium,
    /// High priority errors that affect a pipeline stage or store
    High,
    /// Critical errors that require immediate attention
    Critical,
}

/// Main error type for the monitoring platform
#[derive(Debug, ThisError, Clone)]
#[error("[{code}] {message}")]
pub struct Error {
    /// Standardized error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Optional detailed description
    pub details: Option<String>,
    /// Error context for debugging
    pub context: ErrorContext,
    /// Error severity
    pub severity: ErrorSeverity,
    /// Optional cause chain
    pub cause: Option<Box<Error>>,
}

impl Error {
    /// Create a new error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            context: ErrorContext::new(),
            severity: Self::default_severity_for_code(code),
            cause: None,
        }
    }

    /// Create error with details
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Set error context
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    /// Set error severity
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Chain with another error as cause
    pub fn with_cause(mut self, cause: Error) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Tag the error with its correlation ID
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.context.correlation_id = Some(correlation_id.into());
        self
    }

    /// Add trace to context
    pub fn add_trace(mut self, trace: impl Into<String>) -> Self {
        self.context = self.context.add_trace(trace.into());
        self
    }

    /// Add metadata to context
    pub fn add_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.add_metadata(key.into(), value);
        self
    }

    /// Get HTTP status code
    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    /// Taxonomy class of the underlying code
    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }

    /// Check if error is retryable with backoff
    pub fn is_transient(&self) -> bool {
        self.code.is_transient()
    }

    /// Check if should be logged as error level
    pub fn should_log_as_error(&self) -> bool {
        self.code.should_log_as_error()
            || matches!(self.severity, ErrorSeverity::High | ErrorSeverity::Critical)
    }

    /// Render the REST error envelope.
    ///
    /// Every failing endpoint returns this shape; the correlation ID is the
    /// one propagated from intake (falling back to the error's own).
    pub fn to_api_envelope(&self, correlation_id: Option<&str>) -> serde_json::Value {
        let correlation_id = correlation_id
            .map(str::to_owned)
            .or_else(|| self.context.correlation_id.clone())
            .unwrap_or_else(|| self.context.error_id.clone());

        serde_json::json!({
            "error": {
                "code": self.code.envelope_code(),
                "message": self.message,
                "details": self.details.as_ref().map(|d| serde_json::json!({"description": d}))
                    .unwrap_or(serde_json::Value::Null),
                "correlationId": correlation_id,
                "timestamp": self.context.timestamp.to_rfc3339(),
            }
        })
    }

    /// Convert to full debug JSON (for internal logging only, never for API responses)
    pub fn to_debug_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "details": self.details,
                "context": self.context,
                "severity": self.severity,
                "cause": self.cause.as_ref().map(|c| c.to_debug_json())
            }
        })
    }

    /// Get default severity for error code
    fn default_severity_for_code(code: ErrorCode) -> ErrorSeverity {
        match code {
            ErrorCode::ValidationFailed
            | ErrorCode::InvalidInput
            | ErrorCode::MissingRequiredField
            | ErrorCode::InvalidFormat
            | ErrorCode::ValueOutOfRange
            | ErrorCode::NotFound
            | ErrorCode::DuplicateEvent
            | ErrorCode::VectorSearchEmpty => ErrorSeverity::Low,

            ErrorCode::AlreadyExists
            | ErrorCode::MalformedRecord
            | ErrorCode::RateLimited
            | ErrorCode::QueueFull
            | ErrorCode::ThrottleTimeout
            | ErrorCode::CacheError
            | ErrorCode::EnrichmentUnavailable
            | ErrorCode::LlmSchemaViolation
            | ErrorCode::EnsembleQuorumShortfall => ErrorSeverity::Medium,

            ErrorCode::DatabaseConnectionError
            | ErrorCode::NetworkError
            | ErrorCode::UpstreamError
            | ErrorCode::ServiceUnavailable
            | ErrorCode::CircuitOpen
            | ErrorCode::NoHealthyInstance
            | ErrorCode::ChannelUnavailable
            | ErrorCode::ChannelPermissionDenied
            | ErrorCode::ResourceExhausted => ErrorSeverity::High,

            ErrorCode::InternalError
            | ErrorCode::ConfigurationError
            | ErrorCode::DatabaseTransactionError
            | ErrorCode::PersistenceExhausted
            | ErrorCode::BookmarkCorrupt
            | ErrorCode::CollectionMissing => ErrorSeverity::Critical,

            _ => ErrorSeverity::Medium,
        }
    }
}

impl Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(Serialize)]
        struct ErrorSer {
            code: ErrorCode,
            message: String,
            details: Option<String>,
            context: ErrorContext,
            severity: ErrorSeverity,
        }

        let error_ser = ErrorSer {
            code: self.code,
            message: self.message.clone(),
            details: self.details.clone(),
            context: self.context.clone(),
            severity: self.severity,
        };

        error_ser.serialize(serializer)
    }
}

// Convenience constructors for common errors
impl Error {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AlreadyExists, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RateLimited, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message)
    }
}

// Implement From for common error types
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        let code = match &err {
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() || db_err.is_foreign_key_violation() {
                    ErrorCode::DatabaseConstraintViolation
                } else if db_err
                    .code()
                    .map(|c| c == "40001" || c == "40P01")
                    .unwrap_or(false)
                {
                    // serialization_failure / deadlock_detected
                    ErrorCode::DatabaseDeadlock
                } else {
                    ErrorCode::DatabaseQueryError
                }
            }
            sqlx::Error::PoolTimedOut => ErrorCode::DatabaseConnectionError,
            sqlx::Error::Io(_) => ErrorCode::DatabaseConnectionError,
            sqlx::Error::RowNotFound => ErrorCode::NotFound,
            _ => ErrorCode::DatabaseQueryError,
        };

        Self::new(code, err.to_string()).add_trace("sqlx::Error conversion")
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            ErrorCode::NetworkTimeout
        } else if err.is_connect() {
            ErrorCode::ConnectionRefused
        } else if err.is_status() {
            match err.status().map(|s| s.as_u16()) {
                Some(429) => ErrorCode::RateLimited,
                Some(s) if s >= 500 => ErrorCode::UpstreamError,
                _ => ErrorCode::NetworkError,
            }
        } else {
            ErrorCode::NetworkError
        };

        Self::new(code, err.to_string()).add_trace("reqwest::Error conversion")
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::SerializationError, err.to_string())
            .add_trace("serde_json::Error conversion")
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::new(ErrorCode::ConfigurationError, err.to_string())
            .add_trace("config::ConfigError conversion")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_shape_matches_wire_contract() {
        let err = Error::invalid_input("riskLevel must be one of critical|high|medium|low")
            .with_details("got 'severe'");
        let envelope = err.to_api_envelope(Some("corr-123"));
        let inner = &envelope["error"];

        assert_eq!(inner["code"], "VALIDATION_ERROR");
        assert_eq!(inner["correlationId"], "corr-123");
        assert!(inner["timestamp"].as_str().unwrap().contains('T'));
        assert_eq!(inner["details"]["description"], "got 'severe'");
    }

    #[test]
    fn envelope_falls_back_to_error_context() {
        let err = Error::internal("boom").with_correlation_id("from-intake");
        let envelope = err.to_api_envelope(None);
        assert_eq!(envelope["error"]["correlationId"], "from-intake");
    }

    #[test]
    fn cause_chain_preserved() {
        let cause = Error::new(ErrorCode::NetworkTimeout, "connect timed out");
        let err = Error::new(ErrorCode::UpstreamError, "vector upsert failed").with_cause(cause);
        assert_eq!(err.cause.as_ref().unwrap().code, ErrorCode::NetworkTimeout);
        assert!(err.is_transient());
    }
}

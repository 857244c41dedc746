use serde::{Deserialize, Serialize};
use std::fmt;

/// Standardized error codes for the monitoring platform.
/// These are component-agnostic and represent technical error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // General System Errors (1000-1999)
    InternalError = 1000,
    ConfigurationError = 1001,
    ServiceUnavailable = 1002,
    Timeout = 1003,
    ResourceExhausted = 1004,
    ShuttingDown = 1005,

    // Database Errors (2000-2999)
    DatabaseConnectionError = 2000,
    DatabaseConstraintViolation = 2001,
    DatabaseTransactionError = 2002,
    DatabaseQueryError = 2003,
    DatabaseDeadlock = 2004,
    PersistenceExhausted = 2005,

    // Network & Upstream Errors (3000-3999)
    NetworkError = 3000,
    NetworkTimeout = 3001,
    ConnectionRefused = 3002,
    UpstreamError = 3003,
    SerializationError = 3004,
    CircuitOpen = 3005,
    NoHealthyInstance = 3006,

    // Security Errors (4000-4999)
    Unauthorized = 4000,
    Forbidden = 4001,
    ChannelPermissionDenied = 4002,

    // Input Validation Errors (5000-5999)
    ValidationFailed = 5000,
    InvalidInput = 5001,
    MissingRequiredField = 5002,
    InvalidFormat = 5003,
    ValueOutOfRange = 5004,
    MalformedRecord = 5005,
    InvalidFilter = 5006,
    RuleSyntaxError = 5007,

    // Resource Errors (6000-6999)
    NotFound = 6000,
    AlreadyExists = 6001,
    DuplicateEvent = 6002,
    CollectionMissing = 6003,

    // Rate Limiting & Throttling Errors (7000-7999)
    RateLimited = 7000,
    QueueFull = 7001,
    ThrottleTimeout = 7002,

    // Cache & Storage Errors (8000-8999)
    CacheError = 8000,
    StorageError = 8001,
    BookmarkCorrupt = 8002,

    // Pipeline Stage Errors (9000-9999)
    StageTimeout = 9000,
    ChannelUnavailable = 9001,
    EmbeddingProviderError = 9002,
    LlmProviderError = 9003,
    LlmSchemaViolation = 9004,
    EnsembleQuorumShortfall = 9005,
    EnrichmentUnavailable = 9006,
    VectorSearchEmpty = 9007,
}

/// Failure handling classes from the platform's error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retry with backoff and jitter.
    Transient,
    /// Record the degradation and fall back to a reduced path.
    Degraded,
    /// Reject without retry.
    Validation,
    /// Stop the owning subsystem; others continue.
    FatalSubsystem,
    /// Stop the process.
    FatalProcess,
}

impl ErrorCode {
    /// HTTP status code used by the REST error envelope.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::InternalError
            | ErrorCode::ConfigurationError
            | ErrorCode::DatabaseConnectionError
            | ErrorCode::DatabaseConstraintViolation
            | ErrorCode::DatabaseTransactionError
            | ErrorCode::DatabaseQueryError
            | ErrorCode::DatabaseDeadlock
            | ErrorCode::PersistenceExhausted
            | ErrorCode::NetworkError
            | ErrorCode::NetworkTimeout
            | ErrorCode::ConnectionRefused
            | ErrorCode::UpstreamError
            | ErrorCode::SerializationError
            | ErrorCode::CircuitOpen
            | ErrorCode::NoHealthyInstance
            | ErrorCode::CacheError
            | ErrorCode::StorageError
            | ErrorCode::BookmarkCorrupt
            | ErrorCode::StageTimeout
            | ErrorCode::ChannelUnavailable
            | ErrorCode::EmbeddingProviderError
            | ErrorCode::LlmProviderError
            | ErrorCode::LlmSchemaViolation
            | ErrorCode::EnsembleQuorumShortfall
            | ErrorCode::EnrichmentUnavailable
            | ErrorCode::VectorSearchEmpty
            | ErrorCode::ServiceUnavailable
            | ErrorCode::ShuttingDown
            | ErrorCode::Timeout
            | ErrorCode::ResourceExhausted
            | ErrorCode::CollectionMissing => 500,

            ErrorCode::Unauthorized => 401,

            ErrorCode::Forbidden | ErrorCode::ChannelPermissionDenied => 403,

            ErrorCode::ValidationFailed
            | ErrorCode::InvalidInput
            | ErrorCode::MissingRequiredField
            | ErrorCode::InvalidFormat
            | ErrorCode::ValueOutOfRange
            | ErrorCode::MalformedRecord
            | ErrorCode::InvalidFilter
            | ErrorCode::RuleSyntaxError
            | ErrorCode::AlreadyExists
            | ErrorCode::DuplicateEvent => 400,

            ErrorCode::NotFound => 404,

            ErrorCode::RateLimited | ErrorCode::QueueFull | ErrorCode::ThrottleTimeout => 429,
        }
    }

    /// The wire code carried in the REST error envelope.
    pub fn envelope_code(&self) -> &'static str {
        match self.http_status() {
            400 => "VALIDATION_ERROR",
            401 => "UNAUTHORIZED",
            403 => "FORBIDDEN",
            404 => "NOT_FOUND",
            429 => "RATE_LIMITED",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Error category for metrics and logging.
    pub fn category(&self) -> &'static str {
        match self {
            ErrorCode::InternalError
            | ErrorCode::ConfigurationError
            | ErrorCode::ServiceUnavailable
            | ErrorCode::Timeout
            | ErrorCode::ResourceExhausted
            | ErrorCode::ShuttingDown => "system",

            ErrorCode::DatabaseConnectionError
            | ErrorCode::DatabaseConstraintViolation
            | ErrorCode::DatabaseTransactionError
            | ErrorCode::DatabaseQueryError
            | ErrorCode::DatabaseDeadlock
            | ErrorCode::PersistenceExhausted => "database",

            ErrorCode::NetworkError
            | ErrorCode::NetworkTimeout
            | ErrorCode::ConnectionRefused
            | ErrorCode::UpstreamError
            | ErrorCode::SerializationError
            | ErrorCode::CircuitOpen
            | ErrorCode::NoHealthyInstance => "network",

            ErrorCode::Unauthorized | ErrorCode::Forbidden | ErrorCode::ChannelPermissionDenied => {
                "security"
            }

            ErrorCode::ValidationFailed
            | ErrorCode::InvalidInput
            | ErrorCode::MissingRequiredField
            | ErrorCode::InvalidFormat
            | ErrorCode::ValueOutOfRange
            | ErrorCode::MalformedRecord
            | ErrorCode::InvalidFilter
            | ErrorCode::RuleSyntaxError => "validation",

            ErrorCode::NotFound
            | ErrorCode::AlreadyExists
            | ErrorCode::DuplicateEvent
            | ErrorCode::CollectionMissing => "resource",

            ErrorCode::RateLimited | ErrorCode::QueueFull | ErrorCode::ThrottleTimeout => {
                "rate_limit"
            }

            ErrorCode::CacheError | ErrorCode::StorageError | ErrorCode::BookmarkCorrupt => {
                "storage"
            }

            ErrorCode::StageTimeout
            | ErrorCode::ChannelUnavailable
            | ErrorCode::EmbeddingProviderError
            | ErrorCode::LlmProviderError
            | ErrorCode::LlmSchemaViolation
            | ErrorCode::EnsembleQuorumShortfall
            | ErrorCode::EnrichmentUnavailable
            | ErrorCode::VectorSearchEmpty => "pipeline",
        }
    }

    /// Taxonomy class governing how callers must react.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorCode::NetworkError
            | ErrorCode::NetworkTimeout
            | ErrorCode::ConnectionRefused
            | ErrorCode::UpstreamError
            | ErrorCode::ServiceUnavailable
            | ErrorCode::Timeout
            | ErrorCode::StageTimeout
            | ErrorCode::DatabaseConnectionError
            | ErrorCode::DatabaseDeadlock
            | ErrorCode::DatabaseTransactionError
            | ErrorCode::RateLimited
            | ErrorCode::ResourceExhausted
            | ErrorCode::ChannelUnavailable
            | ErrorCode::LlmProviderError
            | ErrorCode::EmbeddingProviderError => ErrorKind::Transient,

            ErrorCode::LlmSchemaViolation
            | ErrorCode::EnsembleQuorumShortfall
            | ErrorCode::EnrichmentUnavailable
            | ErrorCode::VectorSearchEmpty
            | ErrorCode::CircuitOpen
            | ErrorCode::NoHealthyInstance
            | ErrorCode::ThrottleTimeout
            | ErrorCode::CacheError => ErrorKind::Degraded,

            ErrorCode::ValidationFailed
            | ErrorCode::InvalidInput
            | ErrorCode::MissingRequiredField
            | ErrorCode::InvalidFormat
            | ErrorCode::ValueOutOfRange
            | ErrorCode::MalformedRecord
            | ErrorCode::InvalidFilter
            | ErrorCode::RuleSyntaxError
            | ErrorCode::AlreadyExists
            | ErrorCode::DuplicateEvent
            | ErrorCode::NotFound
            | ErrorCode::QueueFull
            | ErrorCode::Unauthorized
            | ErrorCode::Forbidden => ErrorKind::Validation,

            ErrorCode::ChannelPermissionDenied
            | ErrorCode::CollectionMissing
            | ErrorCode::BookmarkCorrupt => ErrorKind::FatalSubsystem,

            ErrorCode::ConfigurationError => ErrorKind::FatalProcess,

            ErrorCode::InternalError
            | ErrorCode::DatabaseConstraintViolation
            | ErrorCode::DatabaseQueryError
            | ErrorCode::PersistenceExhausted
            | ErrorCode::SerializationError
            | ErrorCode::StorageError
            | ErrorCode::ShuttingDown => ErrorKind::Degraded,
        }
    }

    /// Check whether the error should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Check whether the error should be logged at error level.
    pub fn should_log_as_error(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::Validation | ErrorKind::Degraded
        ) || matches!(self, ErrorCode::PersistenceExhausted | ErrorCode::InternalError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_codes_cover_spec_statuses() {
        assert_eq!(ErrorCode::InvalidInput.envelope_code(), "VALIDATION_ERROR");
        assert_eq!(ErrorCode::Unauthorized.envelope_code(), "UNAUTHORIZED");
        assert_eq!(ErrorCode::Forbidden.envelope_code(), "FORBIDDEN");
        assert_eq!(ErrorCode::NotFound.envelope_code(), "NOT_FOUND");
        assert_eq!(ErrorCode::RateLimited.envelope_code(), "RATE_LIMITED");
        assert_eq!(ErrorCode::InternalError.envelope_code(), "INTERNAL_ERROR");
    }

    #[test]
    fn transient_codes_are_retryable() {
        assert!(ErrorCode::NetworkTimeout.is_transient());
        assert!(ErrorCode::DatabaseDeadlock.is_transient());
        assert!(ErrorCode::LlmProviderError.is_transient());
        assert!(!ErrorCode::MalformedRecord.is_transient());
        assert!(!ErrorCode::LlmSchemaViolation.is_transient());
    }

    #[test]
    fn fatal_classes() {
        assert_eq!(ErrorCode::ConfigurationError.kind(), ErrorKind::FatalProcess);
        assert_eq!(
            ErrorCode::ChannelPermissionDenied.kind(),
            ErrorKind::FatalSubsystem
        );
    }
}

pub mod correlation_id;
pub mod security_headers;

pub use correlation_id::{correlation_id_middleware, CorrelationId, CORRELATION_ID_HEADER};
pub use security_headers::security_headers_middleware;

//! # Error Handling Framework
//!
//! Structured error management for the monitoring platform:
//!
//! - **Coded errors**: every failure carries an [`ErrorCode`] with an HTTP
//!   status, a metrics category, and a taxonomy [`ErrorKind`] that tells the
//!   caller how to react (retry, degrade, reject, stop subsystem, stop
//!   process).
//! - **Rich context**: correlation IDs propagate from pipeline intake to the
//!   REST response envelope and into logs.
//! - **Metrics integration**: [`ErrorMetrics`] tracks counts per category and
//!   kind plus a sliding-window error rate.
//!
//! The REST envelope produced by [`Error::to_api_envelope`] is the single
//! wire format for endpoint failures.

pub mod codes;
pub mod context;
pub mod framework;
pub mod metrics;

pub use codes::{ErrorCode, ErrorKind};
pub use context::{ErrorContext, RequestContext};
pub use framework::{Error, ErrorSeverity, Result};
pub use metrics::ErrorMetrics;

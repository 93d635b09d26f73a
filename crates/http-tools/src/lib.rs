//! Declared API operations over the apiwire credential and fault-tolerance pipeline.
//!
//! An [`ApiDescription`] names services (base URL, auth, retry and breaker settings) and their
//! operations. [`OperationExecutor`] runs one operation for one tenant; [`HttpTransport`] owns the
//! pooled client every call shares.

pub mod config;
pub mod runtime;
pub mod transport;

pub use config::{ApiDescription, OperationConfig, ParamConfig, ParamLocation, ServiceConfig};
pub use runtime::{OperationError, OperationExecutor, OperationResponse, Result};
pub use transport::{HttpTransport, TransportOptions};

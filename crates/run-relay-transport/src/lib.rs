//! HTTP transport for relayed runs.
//!
//! Provides:
//! - Wire types (JSON)
//! - axum router with the SSE attach stream

pub mod http;
pub mod protocol;

pub use http::{ApiError, AppState, router};
pub use protocol::{ErrorBody, Health, RunSnapshot, StartRunResponse};

//! HTTP adapters for the admission core.
//!
//! The core itself knows nothing about HTTP. This module maps decisions onto
//! `RateLimit-*` headers and 429 responses, both as an axum middleware for
//! embedding and as a standalone admission service.

mod middleware;
mod response;
mod server;
mod service;

pub use middleware::{admission_middleware, AdmissionState, AuthenticatedIdentity, OutcomeReporter};
pub use response::apply_quota_headers;
pub use server::HttpServer;
pub use service::{router, CheckRequest, CheckResponse, OutcomeRequest};

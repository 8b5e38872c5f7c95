//! Turnstile - Tiered Request-Admission Control
//!
//! This crate implements the rate limiters that gate traffic into a backend
//! by identity (client address or authenticated user), time window and
//! endpoint class. A single in-process window store backs every limiter;
//! HTTP adapters translate decisions into `RateLimit-*` headers and 429s.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;

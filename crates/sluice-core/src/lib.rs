//! # Sluice Core
//!
//! Core types, traits, and error handling for the sluice forwarding proxy.
//!
//! This crate provides the foundational abstractions shared by the proxy,
//! the configuration loader and the gateway runtime:
//! - Error type and the failure taxonomy used to pick gateway status codes
//! - Proxy and pool settings
//! - Upstream origin parsing and target resolution
//! - Error response bodies

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod error;
pub mod response;
pub mod types;
pub mod upstream;

pub use error::{Error, FailureKind, Result};
pub use response::ErrorResponse;
pub use types::*;
pub use upstream::{Origin, Upstream};

// Re-export commonly used HTTP types
pub use bytes::Bytes;
pub use http::{HeaderMap, Method, Request, Response, StatusCode};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Error, FailureKind, Result};
    pub use crate::response::ErrorResponse;
    pub use crate::types::*;
    pub use crate::upstream::{Origin, Upstream};
}

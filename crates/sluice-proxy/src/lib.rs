//! # Sluice Proxy
//!
//! Forwarding core of sluice:
//! - Pooled, pipelined HTTP/1.1 connections per upstream origin
//! - Header transform pipeline with caller-supplied rewrite hooks
//! - Streaming request and response bodies
//! - Translation of upstream failures into 502/503/504 responses

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod body;
mod codec;
mod connection;
pub mod failure;
pub mod headers;
mod pool;
pub mod proxy;
pub mod stats;

pub use body::{BoxError, ProxyBody, RequestBody};
pub use failure::{failure_response, translate};
pub use headers::{HeaderRewrite, RuleRewrite};
pub use proxy::{create_proxy, ForwardOptions, ForwardOutcome, Proxy, ResponseSink};
pub use stats::{ProxyStats, StatsSnapshot};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::body::{ProxyBody, RequestBody};
    pub use crate::headers::{HeaderRewrite, RuleRewrite};
    pub use crate::proxy::{create_proxy, ForwardOptions, ForwardOutcome, Proxy, ResponseSink};
    pub use crate::stats::StatsSnapshot;
}

//! # Sluice Runtime
//!
//! Gateway front server for the forwarding proxy:
//! - HTTP/1.1 accept loop forwarding every request through one proxy
//! - Optional mount prefix stripped from inbound paths
//! - Graceful shutdown with signal handling

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod gateway;
pub mod shutdown;

pub use gateway::{Gateway, GatewayBuilder};
pub use shutdown::{ShutdownSignal, SignalHandler};

/// Runtime state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// Gateway is built but not serving
    Initializing,
    /// Gateway is accepting connections
    Running,
    /// Gateway stopped accepting and is draining
    ShuttingDown,
    /// Gateway is stopped and the proxy closed
    Stopped,
}

/// Re-export commonly used types
pub mod prelude {
    pub use crate::gateway::{Gateway, GatewayBuilder};
    pub use crate::shutdown::{ShutdownSignal, SignalHandler};
    pub use crate::RuntimeState;
}

//! Shared library for the repeater agent.
//!
//! The repeater sits inside a private network and relays requests from the
//! control plane to targets only it can reach:
//! - Connects outbound to the control plane over a gRPC message bus
//! - Registers, then serves execute-request and network-test commands
//! - Rewrites requests with per-host virtual scripts run in a sandbox
//! - Attaches client certificates by hostname wildcard
//! - Polls scan status with backoff for CI usage

pub mod backoff;
pub mod bus;
pub mod certs;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod headers;
pub mod messages;
pub mod polling;
pub mod request;
pub mod response;
pub mod runtime;
pub mod scans;
pub mod scripts;
pub mod tls;
pub mod wildcard;

pub use error::{Error, Rejection};
pub use runtime::{RepeaterRuntime, RuntimeState, ServiceDefinition, ServiceManager};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Version reported to the control plane during registration.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

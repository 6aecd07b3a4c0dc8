use std::time::Duration;

use thiserror::Error;

use crate::messages::RejectReason;
use crate::runtime::RuntimeState;
use crate::scripts::ScriptError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("gRPC status error: {0}")]
    Status(#[from] tonic::Status),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid bus URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid request metadata: {0}")]
    InvalidMetadata(String),

    #[error("Bus is not connected")]
    NotConnected,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("No reply received within {0:?}")]
    Timeout(Duration),

    #[error("Unable to restore the bus connection after {0} attempts")]
    ReconnectionExhausted(u32),

    #[error("{0}")]
    Rejected(#[from] Rejection),

    #[error("Remote handler failed: {0}")]
    Remote(String),

    #[error("Unexpected registration reply: {0}")]
    UnexpectedReply(String),

    #[error("Unsupported protocol \"{0}\"")]
    UnsupportedProtocol(String),

    #[error("Invalid request: {0}")]
    Request(#[from] crate::request::RequestError),

    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Cannot start the repeater while it is {0}")]
    InvalidState(RuntimeState),

    #[error("Operation cancelled by shutdown")]
    Cancelled,
}

impl Error {
    /// Returns true if continued operation is meaningless and the process
    /// should report failure instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Rejected(_) | Error::ReconnectionExhausted(_))
    }
}

/// Registration refused by the control plane.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct Rejection {
    pub reason: RejectReason,
    message: String,
}

impl Rejection {
    pub fn new(reason: RejectReason, repeater_id: &str) -> Self {
        let message = match reason {
            RejectReason::NotActive => {
                "Access Refused: The current Repeater is not active.".to_string()
            }
            RejectReason::NotFound => {
                "Unauthorized access. Please check your credentials.".to_string()
            }
            RejectReason::Busy => format!(
                "Access Refused: There is an already running Repeater with ID {repeater_id}"
            ),
            RejectReason::RequiresToBeUpdated => {
                "(!) CRITICAL: The current running version is no longer supported".to_string()
            }
        };
        Self { reason, message }
    }
}

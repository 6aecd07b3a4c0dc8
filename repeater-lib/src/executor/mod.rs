//! Protocol executors.
//!
//! An executor turns a [`Request`] into a [`Response`] and never fails:
//! everything that goes wrong on the way to the target is reported as
//! [`Outcome::Failure`](crate::response::Outcome::Failure).

mod http;
mod pool;
mod proxy;
mod transport;

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Error;
use crate::request::{Request, RequestError};
use crate::response::Response;
use crate::scripts::ScriptError;

pub use http::{DEFAULT_WHITELIST_MIMES, HttpExecutorOptions, HttpRequestExecutor, truncate_body};
pub use transport::RawResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("http") {
            Ok(Protocol::Http)
        } else {
            Err(Error::UnsupportedProtocol(s.to_string()))
        }
    }
}

#[async_trait]
pub trait RequestExecutor: Send + Sync {
    fn protocol(&self) -> Protocol;

    async fn execute(&self, request: Request) -> Response;
}

/// Executors available to the send-request handler, resolved by the
/// protocol tag carried on each command.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: Vec<Arc<dyn RequestExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, executor: Arc<dyn RequestExecutor>) -> Self {
        self.executors.retain(|e| e.protocol() != executor.protocol());
        self.executors.push(executor);
        self
    }

    pub fn resolve(&self, tag: &str) -> Result<Arc<dyn RequestExecutor>, Error> {
        let protocol: Protocol = tag.parse()?;
        self.executors
            .iter()
            .find(|e| e.protocol() == protocol)
            .cloned()
            .ok_or_else(|| Error::UnsupportedProtocol(tag.to_string()))
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.executors.iter().map(|e| e.protocol()))
            .finish()
    }
}

/// Why a single request produced no (complete) response.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("getaddrinfo {host}: {source}")]
    Dns {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake failed: {0}")]
    Tls(#[source] io::Error),

    #[error("Timeout awaiting response after {0:?}")]
    Timeout(Duration),

    #[error("socket hang up")]
    ConnectionClosed,

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("Unable to decode response body: {0}")]
    Decode(#[source] io::Error),

    #[error("Protocol \"{0}\" not supported. Expected \"http:\" or \"https:\"")]
    UnsupportedScheme(String),

    #[error("Invalid proxy URL: {0}")]
    InvalidProxy(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("{0}")]
    Script(#[from] ScriptError),

    #[error("{0}")]
    Request(#[from] RequestError),

    /// The response head arrived but the body was cut short.
    #[error("{cause}")]
    Interrupted {
        partial: Box<RawResponse>,
        cause: Box<ExecutionError>,
    },
}

impl ExecutionError {
    /// POSIX-style code reported to the control plane.
    pub fn error_code(&self) -> String {
        match self {
            ExecutionError::Io(e) => io_error_code(e)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{:?}", e.kind())),
            ExecutionError::Dns { source, .. } => dns_error_code(source).to_string(),
            ExecutionError::Tls(e) => io_error_code(e).unwrap_or("EPROTO").to_string(),
            ExecutionError::Timeout(_) => "ETIMEDOUT".to_string(),
            ExecutionError::ConnectionClosed => "ECONNRESET".to_string(),
            ExecutionError::Malformed(_) => "ParseError".to_string(),
            ExecutionError::Decode(_) => "Z_DATA_ERROR".to_string(),
            ExecutionError::UnsupportedScheme(_) => "ERR_INVALID_PROTOCOL".to_string(),
            ExecutionError::InvalidProxy(_) => "InvalidProxy".to_string(),
            ExecutionError::Proxy(_) => "ProxyError".to_string(),
            ExecutionError::Script(_) => "ScriptError".to_string(),
            ExecutionError::Request(_) => "RequestError".to_string(),
            ExecutionError::Interrupted { cause, .. } => cause.error_code(),
        }
    }
}

fn io_error_code(e: &io::Error) -> Option<&'static str> {
    use io::ErrorKind::*;

    let code = match e.kind() {
        ConnectionRefused => "ECONNREFUSED",
        ConnectionReset | UnexpectedEof => "ECONNRESET",
        ConnectionAborted => "ECONNABORTED",
        TimedOut => "ETIMEDOUT",
        BrokenPipe => "EPIPE",
        NetworkUnreachable => "ENETUNREACH",
        NetworkDown => "ENETDOWN",
        HostUnreachable => "EHOSTUNREACH",
        AddrNotAvailable => "EADDRNOTAVAIL",
        _ => return None,
    };
    Some(code)
}

fn dns_error_code(e: &io::Error) -> &'static str {
    let message = e.to_string().to_ascii_lowercase();
    if message.contains("temporary failure") || message.contains("try again") {
        "EAI_AGAIN"
    } else {
        "ENOTFOUND"
    }
}

//! Scan status as reported by the control plane's REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, IntoUrl, Method, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backoff::is_transient_code;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Running,
    Pending,
    Stopped,
    Failed,
    Done,
    Scheduled,
    Queued,
}

impl ScanStatus {
    /// Nothing more will happen to a scan in this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Done | ScanStatus::Stopped | ScanStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCount {
    pub number: u64,
    #[serde(rename = "type")]
    pub severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanState {
    pub status: ScanStatus,
    #[serde(default)]
    pub issues_by_severity: Vec<IssueCount>,
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("Scan API request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP error from scan API: {0}")]
    Status(StatusCode),

    #[error("Invalid scan API URL: {0}")]
    InvalidUrl(String),
}

impl ScanError {
    /// Worth retrying: a server-side error or a connection-level failure.
    pub fn is_transient(&self) -> bool {
        match self {
            ScanError::Status(status) => status.is_server_error(),
            ScanError::Request(e) => {
                e.is_timeout() || e.is_connect() || io_code(e).is_some_and(is_transient_code)
            }
            ScanError::InvalidUrl(_) => false,
        }
    }
}

fn io_code(e: &reqwest::Error) -> Option<&'static str> {
    use std::error::Error as _;
    use std::io::ErrorKind::*;

    let mut source = e.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return match io.kind() {
                ConnectionReset => Some("ECONNRESET"),
                ConnectionRefused => Some("ECONNREFUSED"),
                TimedOut => Some("ETIMEDOUT"),
                NetworkUnreachable => Some("ENETUNREACH"),
                NetworkDown => Some("ENETDOWN"),
                _ => None,
            };
        }
        source = err.source();
    }
    None
}

/// Where the polling engine reads scan state from.
#[async_trait]
pub trait ScanStatusSource: Send + Sync {
    async fn status(&self, scan_id: &str) -> Result<ScanState, ScanError>;
}

pub struct RestScans {
    client: Client,
    base_url: Url,
    api_key: String,
}

impl RestScans {
    pub fn new<T: IntoUrl>(base_url: T, api_key: impl Into<String>) -> Result<Self, ScanError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into_url()?,
            api_key: api_key.into(),
        })
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("authorization", format!("Api-Key {}", self.api_key))
    }

    fn scan_url(&self, scan_id: &str) -> Result<Url, ScanError> {
        self.base_url
            .join(&format!("api/v1/scans/{scan_id}"))
            .map_err(|e| ScanError::InvalidUrl(e.to_string()))
    }
}

#[async_trait]
impl ScanStatusSource for RestScans {
    async fn status(&self, scan_id: &str) -> Result<ScanState, ScanError> {
        let url = self.scan_url(scan_id)?;
        debug!("Fetching scan status from {}", url);

        let resp = self.request(Method::GET, url).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(resp.json().await?)
        } else {
            Err(ScanError::Status(status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the raw request head.
    async fn serve_once(response: &'static str) -> (Url, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        (url, handle)
    }

    #[test]
    fn test_scan_state_deserializes() {
        let state: ScanState = serde_json::from_value(json!({
            "status": "running",
            "issuesBySeverity": [
                {"number": 2, "type": "High"},
                {"number": 1, "type": "Low"}
            ]
        }))
        .unwrap();

        assert_eq!(state.status, ScanStatus::Running);
        assert_eq!(state.issues_by_severity.len(), 2);
        assert_eq!(state.issues_by_severity[0].severity, Severity::High);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ScanStatus::Done.is_terminal());
        assert!(ScanStatus::Stopped.is_terminal());
        assert!(ScanStatus::Failed.is_terminal());
        assert!(!ScanStatus::Running.is_terminal());
        assert!(!ScanStatus::Queued.is_terminal());
    }

    #[test]
    fn test_transient_statuses() {
        assert!(ScanError::Status(StatusCode::BAD_GATEWAY).is_transient());
        assert!(ScanError::Status(StatusCode::INTERNAL_SERVER_ERROR).is_transient());
        assert!(!ScanError::Status(StatusCode::NOT_FOUND).is_transient());
        assert!(!ScanError::InvalidUrl("x".into()).is_transient());
    }

    #[tokio::test]
    async fn test_rest_status_sends_api_key() {
        let body = r#"{"status":"done","issuesBySeverity":[]}"#;
        let response: &'static str = Box::leak(
            format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            )
            .into_boxed_str(),
        );
        let (url, server) = serve_once(response).await;

        let scans = RestScans::new(url, "secret").unwrap();
        let state = scans.status("abc").await.unwrap();
        assert_eq!(state.status, ScanStatus::Done);

        let head = server.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /api/v1/scans/abc "));
        assert!(head.contains("authorization: api-key secret"));
    }

    #[tokio::test]
    async fn test_rest_status_maps_http_errors() {
        let (url, _server) = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;

        let scans = RestScans::new(url, "secret").unwrap();
        let err = scans.status("abc").await.unwrap_err();
        assert!(matches!(err, ScanError::Status(StatusCode::SERVICE_UNAVAILABLE)));
        assert!(err.is_transient());
    }
}

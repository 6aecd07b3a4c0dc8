use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::proxy::Socks5Proxy;
use super::transport::{BodyLimit, RawHttpClient, RawResponse};
use super::{ExecutionError, Protocol, RequestExecutor};
use crate::certs::CertificateStore;
use crate::headers::Headers;
use crate::request::Request;
use crate::response::Response;
use crate::scripts::VirtualScripts;

const SCRIPT_ENTRYPOINT: &str = "handle";

/// Content types passed through whole regardless of size.
pub const DEFAULT_WHITELIST_MIMES: &[&str] = &[
    "text/html",
    "text/plain",
    "text/css",
    "text/javascript",
    "text/markdown",
    "text/xml",
    "application/javascript",
    "application/json",
    "application/xml",
    "application/x-www-form-urlencoded",
    "application/ld+json",
    "application/graphql",
    "application/x-javascript",
    "application/soap+xml",
];

#[derive(Debug, Clone)]
pub struct HttpExecutorOptions {
    pub timeout: Duration,
    /// Body limit in KiB; `-1` disables truncation.
    pub max_content_length: i64,
    pub whitelist_mimes: Vec<String>,
    /// `socks5://` proxy for all target connections.
    pub proxy_url: Option<String>,
    pub reuse_connection: bool,
    /// Added to every request unless the request sets the same header.
    pub headers: Headers,
}

impl Default for HttpExecutorOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_content_length: 100,
            whitelist_mimes: DEFAULT_WHITELIST_MIMES
                .iter()
                .map(|m| m.to_string())
                .collect(),
            proxy_url: None,
            reuse_connection: false,
            headers: Headers::new(),
        }
    }
}

pub struct HttpRequestExecutor {
    options: HttpExecutorOptions,
    scripts: Arc<VirtualScripts>,
    certificates: CertificateStore,
    client: RawHttpClient,
}

impl HttpRequestExecutor {
    pub fn new(
        options: HttpExecutorOptions,
        scripts: Arc<VirtualScripts>,
        certificates: CertificateStore,
    ) -> Result<Self, ExecutionError> {
        let proxy = options
            .proxy_url
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(Socks5Proxy::parse)
            .transpose()?;
        let limit = BodyLimit::new(options.max_content_length, &options.whitelist_mimes);
        let client = RawHttpClient::new(options.timeout, proxy, options.reuse_connection, limit)?;

        Ok(Self {
            options,
            scripts,
            certificates,
            client,
        })
    }

    /// Run the request through the script registered for its host, if any.
    async fn transform(&self, request: Request) -> Result<Request, ExecutionError> {
        let Some(script) = self.scripts.find(request.hostname()) else {
            return Ok(request);
        };

        let args = serde_json::to_value(request.to_options())
            .map_err(|e| crate::request::RequestError::Malformed(e.to_string()))?;
        let result = script.exec(SCRIPT_ENTRYPOINT, &args).await?;
        Ok(Request::from_value(result)?)
    }

    async fn dispatch(&self, request: Request) -> Result<(Request, RawResponse), (Request, ExecutionError)> {
        let mut request = request;
        if !self.options.headers.is_empty() {
            request.merge_headers(&self.options.headers);
        }

        let fallback = request.clone();
        let mut request = match self.transform(request).await {
            Ok(request) => request,
            Err(e) => return Err((fallback, e)),
        };

        if !self.certificates.is_empty() {
            request.attach_certificate(&self.certificates);
        }

        debug!(
            "Executing HTTP request: {} {} ({} headers)",
            request.method(),
            request.url(),
            request.headers().len()
        );

        match self.client.send(&request).await {
            Ok(raw) => Ok((request, raw)),
            Err(e) => Err((request, e)),
        }
    }

    fn success(&self, request: &Request, raw: RawResponse) -> Response {
        let RawResponse {
            status,
            mut headers,
            body,
            ..
        } = raw;
        let body = truncate_body(
            status,
            request.method(),
            &mut headers,
            body,
            self.options.max_content_length,
            &self.options.whitelist_mimes,
        );
        Response::success(
            self.protocol(),
            status,
            headers,
            String::from_utf8_lossy(&body).into_owned(),
        )
    }
}

#[async_trait]
impl RequestExecutor for HttpRequestExecutor {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    async fn execute(&self, request: Request) -> Response {
        match self.dispatch(request).await {
            Ok((request, raw)) => self.success(&request, raw),
            Err((request, ExecutionError::Interrupted { partial, cause })) => {
                warn!(
                    "Response from {} was cut short ({}), forwarding what arrived",
                    request.url(),
                    cause
                );
                self.success(&request, *partial)
            }
            Err((request, e)) => {
                let message = e.to_string();
                error!(
                    "Error executing request: \"{} {} HTTP/1.1\"",
                    request.method(),
                    request.url()
                );
                error!("Cause: {}", message);
                Response::failure(self.protocol(), message, e.error_code())
            }
        }
    }
}

/// Apply the body size limit to a response.
///
/// `204` responses and `HEAD` requests are left untouched. Otherwise the
/// body is cut to `max_content_length` KiB unless its content type starts
/// with one of `whitelist_mimes`, and `content-length` is rewritten to the
/// final byte length.
pub fn truncate_body(
    status: u16,
    method: &str,
    headers: &mut Headers,
    mut body: Vec<u8>,
    max_content_length: i64,
    whitelist_mimes: &[String],
) -> Vec<u8> {
    if status == 204 || method.eq_ignore_ascii_case("HEAD") {
        return body;
    }

    if let Some(limit) = limit_bytes(max_content_length)
        && !is_whitelisted(headers, whitelist_mimes)
        && body.len() > limit
    {
        debug!("Truncate original response body to {} bytes", limit);
        body.truncate(limit);
    }

    headers.set("content-length", body.len().to_string());
    body
}

/// `max_content_length` in bytes; `None` for the `-1` (unlimited) setting.
pub(crate) fn limit_bytes(max_content_length: i64) -> Option<usize> {
    (max_content_length != -1).then(|| {
        usize::try_from(max_content_length.max(0))
            .unwrap_or(usize::MAX)
            .saturating_mul(1024)
    })
}

/// Whether the response content type is exempt from the size limit. A
/// missing content type counts as `text/plain`.
pub(crate) fn is_whitelisted(headers: &Headers, whitelist_mimes: &[String]) -> bool {
    let mime_type = headers
        .get("content-type")
        .and_then(|v| v.parse::<mime::Mime>().ok())
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| "text/plain".to_string());
    whitelist_mimes
        .iter()
        .any(|m| mime_type.starts_with(&m.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn whitelist() -> Vec<String> {
        vec!["text/html".to_string(), "application/json".to_string()]
    }

    fn headers(content_type: &str) -> Headers {
        [("Content-Type", content_type)].into_iter().collect()
    }

    #[test]
    fn test_large_body_is_truncated() {
        let mut h = headers("application/octet-stream");
        let body = truncate_body(200, "GET", &mut h, vec![b'a'; 2048], 1, &whitelist());
        assert_eq!(body.len(), 1024);
        assert_eq!(h.get("content-length"), Some("1024"));
    }

    #[test]
    fn test_whitelisted_type_is_kept() {
        let mut h = headers("application/json; charset=utf-8");
        let body = truncate_body(200, "GET", &mut h, vec![b'a'; 4096], 1, &whitelist());
        assert_eq!(body.len(), 4096);
        assert_eq!(h.get("content-length"), Some("4096"));
    }

    #[test]
    fn test_no_content_and_head_are_untouched() {
        let mut h = headers("image/png");
        h.append("Content-Length", "999");
        let body = truncate_body(204, "GET", &mut h, vec![b'a'; 2048], 1, &whitelist());
        assert_eq!(body.len(), 2048);
        assert_eq!(h.get("content-length"), Some("999"));

        let body = truncate_body(200, "head", &mut h, vec![b'a'; 2048], 1, &whitelist());
        assert_eq!(body.len(), 2048);
        assert_eq!(h.get("content-length"), Some("999"));
    }

    #[test]
    fn test_unlimited() {
        let mut h = headers("image/png");
        let body = truncate_body(200, "GET", &mut h, vec![0; 1 << 20], -1, &whitelist());
        assert_eq!(body.len(), 1 << 20);
    }

    #[test]
    fn test_missing_content_type_defaults_to_text_plain() {
        let mut h = Headers::new();
        let list = vec!["text/plain".to_string()];
        let body = truncate_body(200, "GET", &mut h, vec![b'a'; 2048], 1, &list);
        assert_eq!(body.len(), 2048);

        let mut h = headers("%%garbage%%");
        let body = truncate_body(200, "GET", &mut h, vec![b'a'; 2048], 1, &list);
        assert_eq!(body.len(), 2048);
    }

    #[test]
    fn test_small_body_gets_content_length() {
        let mut h = headers("image/gif");
        let body = truncate_body(200, "GET", &mut h, b"abc".to_vec(), 1, &whitelist());
        assert_eq!(body, b"abc");
        assert_eq!(h.get("content-length"), Some("3"));
    }
}

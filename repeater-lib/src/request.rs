use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::{Regex, RegexBuilder};
use rustls::ClientConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::certs::{CertificateStore, MaterialKind, client_config_from_pfx};
use crate::headers::Headers;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Url must be declared explicitly.")]
    MissingUrl,

    #[error("Invalid URL.")]
    InvalidUrl,

    #[error("Body must be string.")]
    BodyNotText,

    #[error("Malformed request options: {0}")]
    Malformed(String),
}

/// Serializable form of a request. This is what transformation scripts
/// receive and must return.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// CA material as UTF-8 text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
    /// PKCS#12 archive, base64-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pfx: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id_regex: Option<String>,
}

/// TLS material attached to a request.
///
/// CA material is carried for completeness but never enforced, since peer
/// verification is disabled for targets.
#[derive(Debug, Clone, Default)]
pub struct TlsMaterial {
    pub ca: Option<Arc<[u8]>>,
    pub pfx: Option<Arc<[u8]>>,
    pub passphrase: Option<String>,
    pub client_config: Option<Arc<ClientConfig>>,
}

#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    url: Url,
    headers: Headers,
    body: Option<String>,
    correlation_id_regex: Option<Regex>,
    tls: TlsMaterial,
}

impl Request {
    pub fn new(options: RequestOptions) -> Result<Self, RequestError> {
        let method = options
            .method
            .filter(|m| !m.is_empty())
            .map(|m| m.to_ascii_uppercase())
            .unwrap_or_else(|| "GET".to_string());

        let url = match options.url.as_deref() {
            None | Some("") => return Err(RequestError::MissingUrl),
            Some(raw) => Url::parse(raw).map_err(|_| RequestError::InvalidUrl)?,
        };

        let body = match options.body {
            None | Some(Value::Null) => None,
            Some(Value::String(body)) => Some(body),
            Some(_) => return Err(RequestError::BodyNotText),
        };

        // An invalid pattern is ignored, not an error.
        let correlation_id_regex = options
            .correlation_id_regex
            .filter(|p| !p.is_empty())
            .and_then(|p| RegexBuilder::new(&p).case_insensitive(true).build().ok());

        let mut tls = TlsMaterial {
            ca: options.ca.map(|ca| Arc::from(ca.into_bytes())),
            passphrase: options.passphrase,
            ..Default::default()
        };
        if let Some(pfx) = options.pfx {
            let bytes = BASE64
                .decode(pfx.as_bytes())
                .map_err(|e| RequestError::Malformed(format!("pfx: {e}")))?;
            match client_config_from_pfx(&bytes, tls.passphrase.as_deref()) {
                Ok(config) => tls.client_config = Some(config),
                Err(e) => warn!("Error Loading Certificate: {}", e),
            }
            tls.pfx = Some(Arc::from(bytes));
        }

        Ok(Self {
            method,
            url,
            headers: options.headers,
            body,
            correlation_id_regex,
            tls,
        })
    }

    pub fn from_value(value: Value) -> Result<Self, RequestError> {
        let options: RequestOptions =
            serde_json::from_value(value).map_err(|e| RequestError::Malformed(e.to_string()))?;
        Self::new(options)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn hostname(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn correlation_id_regex(&self) -> Option<&Regex> {
        self.correlation_id_regex.as_ref()
    }

    pub fn tls(&self) -> &TlsMaterial {
        &self.tls
    }

    /// Add process-level default headers. Headers already on the request win.
    pub fn merge_headers(&mut self, defaults: &Headers) {
        self.headers.merge_defaults(defaults);
    }

    /// Attach the certificate best matching this request's hostname.
    /// Returns false (after a warning) when nothing matches.
    pub fn attach_certificate(&mut self, store: &CertificateStore) -> bool {
        let hostname = self.hostname().to_string();
        let Some(cert) = store.find(&hostname) else {
            warn!("Warning: certificate for {} not found.", hostname);
            return false;
        };

        match cert.kind() {
            MaterialKind::Ca => {
                self.tls.ca = Some(Arc::from(cert.bytes()));
            }
            MaterialKind::ClientPfx => {
                self.tls.pfx = Some(Arc::from(cert.bytes()));
                self.tls.passphrase = cert.passphrase().map(str::to_string);
                self.tls.client_config = cert.client_config().cloned();
            }
        }
        true
    }

    pub fn to_options(&self) -> RequestOptions {
        RequestOptions {
            method: Some(self.method.clone()),
            url: Some(self.url.to_string()),
            headers: self.headers.clone(),
            body: self.body.clone().map(Value::String),
            ca: self
                .tls
                .ca
                .as_ref()
                .map(|ca| String::from_utf8_lossy(ca).into_owned()),
            pfx: self.tls.pfx.as_ref().map(|pfx| BASE64.encode(pfx)),
            passphrase: self.tls.passphrase.clone(),
            correlation_id_regex: self
                .correlation_id_regex
                .as_ref()
                .map(|r| r.as_str().to_string()),
        }
    }
}

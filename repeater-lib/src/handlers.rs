//! Commands the control plane sends to a registered repeater.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use url::Url;

use crate::Result;
use crate::bus::{Handler, decode};
use crate::executor::ExecutorRegistry;
use crate::messages::{
    BusMessage, ExecuteScript, ForwardResponse, NetworkTest, NetworkTestResult, NetworkTestType,
    RegisterScripts,
};
use crate::request::{Request, RequestOptions};
use crate::scripts::VirtualScripts;

const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Installs scripts pushed by the control plane.
pub struct RegisterScriptsHandler {
    scripts: Arc<VirtualScripts>,
}

impl RegisterScriptsHandler {
    pub fn new(scripts: Arc<VirtualScripts>) -> Self {
        Self { scripts }
    }
}

#[async_trait]
impl Handler for RegisterScriptsHandler {
    fn message_type(&self) -> &'static str {
        RegisterScripts::TYPE
    }

    async fn handle(&self, payload: Value) -> Result<Value> {
        let RegisterScripts { script } = decode(payload)?;
        let entries = script.map(|s| s.into_entries()).unwrap_or_default();
        let count = entries.len();

        if self.scripts.replace_remote(entries) {
            info!("Installed {} remote script(s)", count);
        }
        Ok(Value::Null)
    }
}

/// Reachability probe from the repeater's network.
pub struct NetworkTestHandler {
    timeout: Duration,
}

impl NetworkTestHandler {
    pub fn new() -> Self {
        Self {
            timeout: PING_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn ping(&self, urls: &[&str]) -> NetworkTestResult {
        let mut lines = Vec::with_capacity(urls.len());
        for raw in urls {
            let line = match self.probe(raw).await {
                Ok(elapsed) => format!("{raw}: reachable ({} ms)", elapsed.as_millis()),
                Err(e) => format!("{raw}: unreachable ({e})"),
            };
            debug!("{}", line);
            lines.push(line);
        }
        NetworkTestResult::Output {
            output: lines.join("\n"),
        }
    }

    async fn probe(&self, raw: &str) -> std::result::Result<Duration, String> {
        let url = Url::parse(raw).map_err(|e| e.to_string())?;
        let host = url.host_str().ok_or("no host")?;
        let port = url.port_or_known_default().ok_or("no port")?;

        let started = tokio::time::Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.timeout)),
        }
    }
}

impl Default for NetworkTestHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for NetworkTestHandler {
    fn message_type(&self) -> &'static str {
        NetworkTest::TYPE
    }

    async fn handle(&self, payload: Value) -> Result<Value> {
        let test: NetworkTest = decode(payload)?;
        let urls = test.input.urls();
        info!("Network test requested: {:?} for {} url(s)", test.kind, urls.len());

        let result = match test.kind {
            NetworkTestType::Ping => self.ping(&urls).await,
            NetworkTestType::Traceroute => NetworkTestResult::Error {
                error: "traceroute is not supported by this repeater".to_string(),
            },
        };
        Ok(serde_json::to_value(result)?)
    }
}

/// Executes a request against a target on the local network.
pub struct SendRequestHandler {
    executors: ExecutorRegistry,
}

impl SendRequestHandler {
    pub fn new(executors: ExecutorRegistry) -> Self {
        Self { executors }
    }
}

#[async_trait]
impl Handler for SendRequestHandler {
    fn message_type(&self) -> &'static str {
        ExecuteScript::TYPE
    }

    async fn handle(&self, payload: Value) -> Result<Value> {
        let command: ExecuteScript = decode(payload)?;
        let executor = self.executors.resolve(&command.protocol)?;

        let request = Request::new(RequestOptions {
            method: command.method,
            url: Some(command.url),
            headers: command.headers,
            body: command.body.map(Value::String),
            correlation_id_regex: command.correlation_id_regex,
            ..Default::default()
        })?;

        let response = executor.execute(request).await;
        if let Some(code) = response.error_code() {
            warn!("Request failed with {}", code);
        }
        Ok(serde_json::to_value(ForwardResponse::from(response))?)
    }
}

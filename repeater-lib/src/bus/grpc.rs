//! [`Bus`] over a single bidirectional gRPC stream.
//!
//! Every message travels as a [`BusFrame`] carrying a JSON payload. Commands
//! are matched to their replies by `correlation_id`. When the stream drops
//! the bus reconnects on its own with exponential backoff; only when that
//! budget is spent does the registered failure callback fire.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use repeater_proto::{BusFrame, FrameKind, RepeaterBusClient};
use rustls::pki_types::ServerName;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Streaming;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint, Uri};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Bus, Handler, Message, ReconnectionFailureCallback};
use crate::Result;
use crate::backoff::Backoff;
use crate::error::Error;
use crate::tls::{ALPN_H2, insecure_client_config};

const OUTBOUND_BUFFER: usize = 256;
const ERROR_MESSAGE_TYPE: &str = "Error";

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// gRPC endpoint of the control plane, e.g. `https://app.example.com:443`.
    pub url: String,
    pub api_key: String,
    pub repeater_id: String,
    /// Accept any server certificate.
    pub insecure: bool,
    /// How long `send` waits for a reply.
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

pub struct GrpcBus {
    inner: Arc<Inner>,
}

struct Inner {
    config: BusConfig,
    outbound: Mutex<Option<mpsc::Sender<BusFrame>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Value>>>>,
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
    on_failure: Mutex<Option<ReconnectionFailureCallback>>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl GrpcBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                outbound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                on_failure: Mutex::new(None),
                cancel: CancellationToken::new(),
                supervisor: Mutex::new(None),
            }),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

impl Inner {
    async fn channel(&self) -> Result<Channel> {
        let url = &self.config.url;
        let https = url.starts_with("https://");

        if https && self.config.insecure {
            warn!("Using INSECURE TLS for the bus (accepting any certificate)");
            return insecure_channel(url).await;
        }

        let mut endpoint =
            Endpoint::from_shared(url.clone()).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        if https {
            endpoint = endpoint.tls_config(ClientTlsConfig::new().with_native_roots())?;
        }
        Ok(endpoint.connect().await?)
    }

    /// Connect and open the bidirectional stream.
    async fn open_stream(&self) -> Result<(mpsc::Sender<BusFrame>, Streaming<BusFrame>)> {
        let channel = self.channel().await?;
        let mut client = RepeaterBusClient::new(channel);

        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let mut request = tonic::Request::new(ReceiverStream::new(rx));
        let auth = MetadataValue::try_from(format!("Api-Key {}", self.config.api_key))
            .map_err(|e| Error::InvalidMetadata(e.to_string()))?;
        let id = MetadataValue::try_from(self.config.repeater_id.as_str())
            .map_err(|e| Error::InvalidMetadata(e.to_string()))?;
        request.metadata_mut().insert("authorization", auth);
        request.metadata_mut().insert("x-repeater-id", id);

        let inbound = client.connect(request).await?.into_inner();
        debug!("Bus stream established with {}", self.config.url);
        Ok((tx, inbound))
    }

    async fn open_with_backoff(&self) -> Result<Streaming<BusFrame>> {
        let policy = &self.config.reconnect;
        let backoff = Backoff::new(policy.max_attempts, |e: &Error| {
            !matches!(e, Error::InvalidUrl(_) | Error::InvalidMetadata(_))
        })
        .with_delays(policy.initial_delay, policy.max_delay);

        let attempt = backoff.execute(|| async move {
            self.open_stream().await.inspect_err(|e| {
                warn!("Bus connection attempt failed: {}", e);
            })
        });

        let (tx, inbound) = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            result = attempt => result?,
        };
        *lock(&self.outbound) = Some(tx);
        Ok(inbound)
    }

    async fn transmit(&self, frame: BusFrame) -> Result<()> {
        let tx = lock(&self.outbound).clone().ok_or(Error::NotConnected)?;
        tx.send(frame).await.map_err(|_| Error::ConnectionLost)
    }

    /// Drop the outbound half and fail every in-flight request.
    fn detach(&self) {
        lock(&self.outbound).take();
        let pending: Vec<_> = lock(&self.pending).drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(Error::ConnectionLost));
        }
    }

    fn fail(&self, err: Error) {
        if let Some(callback) = lock(&self.on_failure).take() {
            callback(err);
        }
    }

    /// Read frames until the stream ends. Returns a description of why.
    async fn pump(self: &Arc<Self>, inbound: &mut Streaming<BusFrame>) -> Option<String> {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                frame = inbound.message() => frame,
            };
            match frame {
                Ok(Some(frame)) => self.dispatch(frame),
                Ok(None) => return Some("stream closed by the control plane".to_string()),
                Err(status) => return Some(status.to_string()),
            }
        }
    }

    fn dispatch(self: &Arc<Self>, frame: BusFrame) {
        match FrameKind::try_from(frame.kind) {
            Ok(FrameKind::Reply) => self.resolve(frame),
            Ok(FrameKind::Command) => self.spawn_handler(frame, true),
            Ok(FrameKind::Event) => self.spawn_handler(frame, false),
            Err(_) => warn!("Ignoring frame {} of unknown kind {}", frame.id, frame.kind),
        }
    }

    fn resolve(&self, frame: BusFrame) {
        let Some(tx) = lock(&self.pending).remove(&frame.correlation_id) else {
            debug!("Dropping reply for unknown request {}", frame.correlation_id);
            return;
        };
        let payload = parse_payload(&frame.payload);
        let result = match payload {
            Ok(value) if frame.message_type == ERROR_MESSAGE_TYPE => {
                let message = value
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string());
                Err(Error::Remote(message))
            }
            other => other,
        };
        let _ = tx.send(result);
    }

    fn spawn_handler(self: &Arc<Self>, frame: BusFrame, reply: bool) {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&frame.message_type)
            .cloned();
        let inner = Arc::clone(self);

        tokio::spawn(async move {
            let result = match handler {
                Some(handler) => match parse_payload(&frame.payload) {
                    Ok(payload) => handler.handle(payload).await,
                    Err(e) => Err(e),
                },
                None => Err(Error::Remote(format!(
                    "No handler subscribed for \"{}\"",
                    frame.message_type
                ))),
            };

            if !reply {
                if let Err(e) = result {
                    warn!("Handling {} failed: {}", frame.message_type, e);
                }
                return;
            }

            let (message_type, payload) = match result {
                Ok(value) => (frame.message_type.clone(), value),
                Err(e) => {
                    warn!("Handling {} failed: {}", frame.message_type, e);
                    (
                        ERROR_MESSAGE_TYPE.to_string(),
                        json!({ "error": e.to_string() }),
                    )
                }
            };
            let reply = BusFrame {
                id: Uuid::new_v4().to_string(),
                correlation_id: frame.id,
                message_type,
                payload: payload.to_string().into_bytes(),
                kind: FrameKind::Reply as i32,
            };
            if let Err(e) = inner.transmit(reply).await {
                warn!("Unable to send reply: {}", e);
            }
        });
    }

    /// Keep the stream alive until cancelled or reconnection is exhausted.
    async fn supervise(self: Arc<Self>, mut inbound: Streaming<BusFrame>) {
        loop {
            let Some(reason) = self.pump(&mut inbound).await else {
                return;
            };
            warn!("Bus connection lost: {}", reason);
            self.detach();

            match self.open_with_backoff().await {
                Ok(stream) => {
                    info!("Bus connection restored");
                    inbound = stream;
                }
                Err(Error::Cancelled) => return,
                Err(e) => {
                    error!("Unable to restore the bus connection: {}", e);
                    self.fail(Error::ReconnectionExhausted(self.config.reconnect.max_attempts));
                    return;
                }
            }
        }
    }
}

fn parse_payload(payload: &[u8]) -> Result<Value> {
    if payload.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(payload)?)
}

fn frame(kind: FrameKind, message: Message) -> BusFrame {
    BusFrame {
        id: Uuid::new_v4().to_string(),
        correlation_id: String::new(),
        message_type: message.message_type,
        payload: message.payload.to_string().into_bytes(),
        kind: kind as i32,
    }
}

#[async_trait]
impl Bus for GrpcBus {
    async fn init(&self) -> Result<()> {
        if lock(&self.inner.outbound).is_some() {
            return Ok(());
        }
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        info!("Connecting to the control plane at {}", self.inner.config.url);
        let inbound = self.inner.open_with_backoff().await?;
        let handle = tokio::spawn(Arc::clone(&self.inner).supervise(inbound));
        *lock(&self.inner.supervisor) = Some(handle);
        Ok(())
    }

    async fn publish(&self, message: Message) -> Result<()> {
        debug!("Publishing {}", message.message_type);
        self.inner.transmit(frame(FrameKind::Event, message)).await
    }

    async fn send(&self, message: Message) -> Result<Value> {
        let frame = frame(FrameKind::Command, message);
        let id = frame.id.clone();
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id.clone(), tx);

        if let Err(e) = self.inner.transmit(frame).await {
            lock(&self.inner.pending).remove(&id);
            return Err(e);
        }

        let timeout = self.inner.config.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Err(_) => {
                lock(&self.inner.pending).remove(&id);
                Err(Error::Timeout(timeout))
            }
        }
    }

    async fn subscribe(&self, handler: Arc<dyn Handler>) -> Result<()> {
        debug!("Subscribing to {}", handler.message_type());
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(handler.message_type().to_string(), handler);
        Ok(())
    }

    fn on_reconnection_failure(&self, callback: ReconnectionFailureCallback) {
        *lock(&self.inner.on_failure) = Some(callback);
    }

    async fn destroy(&self) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Ok(());
        }
        self.inner.cancel.cancel();
        self.inner.detach();

        let handle = lock(&self.inner.supervisor).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        debug!("Bus destroyed");
        Ok(())
    }
}

/// Create a gRPC channel with TLS that accepts any server certificate.
async fn insecure_channel(url: &str) -> Result<Channel> {
    use hyper_util::rt::TokioIo;
    use std::task::{Context, Poll};
    use tower::Service;

    let uri: Uri = url
        .parse()
        .map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
    let host = uri
        .host()
        .ok_or_else(|| Error::InvalidUrl(format!("{url}: no host")))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = uri.port_u16().unwrap_or(443);

    let tls = insecure_client_config(&[ALPN_H2])
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    #[derive(Clone)]
    struct InsecureConnector {
        tls: TlsConnector,
        host: String,
        port: u16,
    }

    impl Service<Uri> for InsecureConnector {
        type Response = TokioIo<tokio_rustls::client::TlsStream<tokio::net::TcpStream>>;
        type Error = Box<dyn std::error::Error + Send + Sync>;
        type Future = std::pin::Pin<
            Box<
                dyn std::future::Future<Output = std::result::Result<Self::Response, Self::Error>>
                    + Send,
            >,
        >;

        fn poll_ready(
            &mut self,
            _cx: &mut Context<'_>,
        ) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _uri: Uri) -> Self::Future {
            let tls = self.tls.clone();
            let host = self.host.clone();
            let port = self.port;

            Box::pin(async move {
                let tcp = tokio::net::TcpStream::connect((host.as_str(), port)).await?;
                let server_name = ServerName::try_from(host)?;
                let stream = tls.connect(server_name, tcp).await?;
                Ok(TokioIo::new(stream))
            })
        }
    }

    let connector = InsecureConnector {
        tls: TlsConnector::from(Arc::new(tls)),
        host: host.clone(),
        port,
    };

    // TLS is done by the connector, so tonic must see a plain-text scheme.
    let endpoint = Endpoint::from_shared(format!("http://{}:{}", uri.host().unwrap_or(&host), port))
        .map_err(|e| Error::InvalidUrl(e.to_string()))?;
    Ok(endpoint.connect_with_connector(connector).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> BusConfig {
        BusConfig {
            url: url.to_string(),
            api_key: "key".to_string(),
            repeater_id: "r-1".to_string(),
            insecure: false,
            request_timeout: Duration::from_secs(1),
            reconnect: ReconnectPolicy {
                initial_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                max_attempts: 2,
            },
        }
    }

    #[tokio::test]
    async fn test_publish_before_init_fails() {
        let bus = GrpcBus::new(config("http://127.0.0.1:1"));
        let message = Message {
            message_type: "Anything".to_string(),
            payload: Value::Null,
        };
        assert!(matches!(
            bus.publish(message).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_init_fails_when_unreachable() {
        let bus = GrpcBus::new(config("http://127.0.0.1:1"));
        assert!(bus.init().await.is_err());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let bus = GrpcBus::new(config("http://127.0.0.1:1"));
        bus.destroy().await.unwrap();
        bus.destroy().await.unwrap();
        assert!(matches!(bus.init().await, Err(Error::Cancelled)));
    }

    #[test]
    fn test_empty_payload_is_null() {
        assert_eq!(parse_payload(b"").unwrap(), Value::Null);
        assert_eq!(parse_payload(br#"{"a":1}"#).unwrap(), json!({"a": 1}));
    }
}

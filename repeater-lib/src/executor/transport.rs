//! Raw HTTP/1.1 client.
//!
//! Request heads are written by hand so header names and values reach the
//! target exactly as the caller supplied them, including casing, order,
//! repeats and bytes a conforming client would refuse to send. Responses are
//! parsed with `httparse`; redirects are never followed and TLS peers are
//! never verified.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};
use url::{Host, Position, Url};

use super::ExecutionError;
use super::http::{is_whitelisted, limit_bytes};
use super::pool::{ConnectionPool, PoolKey};
use super::proxy::Socks5Proxy;
use crate::headers::Headers;
use crate::request::Request;
use crate::tls::{ALPN_HTTP1, insecure_client_config};

const MAX_HEADERS: usize = 256;
const MAX_HEAD_BYTES: usize = 64 * 1024;
const READ_CHUNK: usize = 8 * 1024;
/// Slack past the truncation point so the truncated body is still full.
const BODY_LIMIT_MARGIN: usize = 64 * 1024;

pub(crate) trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub(crate) type BoxedIo = Box<dyn Io>;

/// A response as read off the wire, body already decompressed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// Bounds how much of a response body is read and inflated. Bodies the
/// executor would truncate anyway stop being read shortly past the limit.
#[derive(Debug, Clone, Default)]
pub(crate) struct BodyLimit {
    /// Truncation point in bytes; `None` is unlimited.
    max_bytes: Option<usize>,
    whitelist_mimes: Vec<String>,
}

impl BodyLimit {
    pub(crate) fn new(max_content_length: i64, whitelist_mimes: &[String]) -> Self {
        Self {
            max_bytes: limit_bytes(max_content_length),
            whitelist_mimes: whitelist_mimes.to_vec(),
        }
    }

    fn cap_for(&self, headers: &Headers) -> Option<usize> {
        let max = self.max_bytes?;
        if is_whitelisted(headers, &self.whitelist_mimes) {
            return None;
        }
        Some(max.saturating_add(BODY_LIMIT_MARGIN))
    }
}

/// Where a request goes.
#[derive(Debug, Clone)]
struct Target {
    https: bool,
    /// Host for DNS / SOCKS, without IPv6 brackets.
    connect_host: String,
    port: u16,
    /// Value of the `Host` header.
    authority: String,
}

impl Target {
    fn from_url(url: &Url) -> Result<Self, ExecutionError> {
        let https = match url.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(ExecutionError::UnsupportedScheme(format!("{other}:"))),
        };
        let connect_host = match url.host() {
            Some(Host::Domain(d)) => d.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(ExecutionError::UnsupportedScheme(url.scheme().to_string())),
        };
        let port = url.port_or_known_default().unwrap_or(if https { 443 } else { 80 });
        let authority = url[Position::BeforeHost..Position::AfterPort].to_string();

        Ok(Self {
            https,
            connect_host,
            port,
            authority,
        })
    }

    fn pool_key(&self) -> PoolKey {
        PoolKey {
            https: self.https,
            host: self.connect_host.clone(),
            port: self.port,
        }
    }
}

pub(crate) struct RawHttpClient {
    timeout: Duration,
    proxy: Option<Socks5Proxy>,
    pool: Option<ConnectionPool>,
    tls: Arc<ClientConfig>,
    limit: BodyLimit,
}

impl RawHttpClient {
    pub(crate) fn new(
        timeout: Duration,
        proxy: Option<Socks5Proxy>,
        reuse_connection: bool,
        limit: BodyLimit,
    ) -> Result<Self, ExecutionError> {
        let tls = insecure_client_config(&[ALPN_HTTP1])
            .map_err(|e| ExecutionError::Tls(std::io::Error::other(e)))?;
        // Connections through the proxy are never pooled.
        let pool = (reuse_connection && proxy.is_none()).then(|| ConnectionPool::new(timeout));
        Ok(Self {
            timeout,
            proxy,
            pool,
            tls: Arc::new(tls),
            limit,
        })
    }

    /// Send `request` and read the complete response.
    pub(crate) async fn send(&self, request: &Request) -> Result<RawResponse, ExecutionError> {
        let target = Target::from_url(request.url())?;
        tokio::time::timeout(self.timeout, self.exchange(request, &target))
            .await
            .map_err(|_| ExecutionError::Timeout(self.timeout))?
    }

    async fn exchange(
        &self,
        request: &Request,
        target: &Target,
    ) -> Result<RawResponse, ExecutionError> {
        // Client certificates are bound to one request; keep those
        // connections out of the pool.
        let pool = self
            .pool
            .as_ref()
            .filter(|_| request.tls().client_config.is_none());
        let keep_alive = pool.is_some()
            && request
                .headers()
                .get("connection")
                .is_none_or(|v| !v.eq_ignore_ascii_case("close"));
        let head = encode_head(request, target, keep_alive);

        if let Some(pool) = pool
            && let Some(stream) = pool.take(&target.pool_key())
        {
            trace!("Reusing pooled connection to {}", target.authority);
            match self.round_trip(stream, &head, request, target, Some(pool)).await {
                // The server closed the idle connection; retry once on a fresh one.
                Err(ExecutionError::ConnectionClosed) => {
                    debug!("Pooled connection to {} was closed", target.authority)
                }
                other => return other,
            }
        }

        let stream = self.connect(request, target).await?;
        self.round_trip(stream, &head, request, target, pool).await
    }

    async fn round_trip(
        &self,
        mut stream: BoxedIo,
        head: &[u8],
        request: &Request,
        target: &Target,
        pool: Option<&ConnectionPool>,
    ) -> Result<RawResponse, ExecutionError> {
        stream.write_all(head).await?;
        if let Some(body) = request.body() {
            stream.write_all(body.as_bytes()).await?;
        }
        stream.flush().await?;

        let is_head = request.method().eq_ignore_ascii_case("HEAD");
        let (response, reusable) = read_response(&mut stream, is_head, &self.limit).await?;

        if let Some(pool) = pool
            && reusable
        {
            pool.put(target.pool_key(), stream);
        }
        Ok(response)
    }

    async fn connect(&self, request: &Request, target: &Target) -> Result<BoxedIo, ExecutionError> {
        let tcp: BoxedIo = match &self.proxy {
            Some(proxy) => Box::new(proxy.connect(&target.connect_host, target.port).await?),
            None => Box::new(connect_tcp(&target.connect_host, target.port).await?),
        };

        if !target.https {
            return Ok(tcp);
        }

        let config = request
            .tls()
            .client_config
            .clone()
            .unwrap_or_else(|| self.tls.clone());
        let server_name = ServerName::try_from(target.connect_host.clone())
            .map_err(|e| ExecutionError::Tls(std::io::Error::other(e)))?;
        let stream = TlsConnector::from(config)
            .connect(server_name, tcp)
            .await
            .map_err(ExecutionError::Tls)?;
        Ok(Box::new(stream))
    }
}

pub(crate) async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, ExecutionError> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| ExecutionError::Dns {
            host: host.to_string(),
            source,
        })?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(match last_err {
        Some(e) => ExecutionError::Io(e),
        None => ExecutionError::Dns {
            host: host.to_string(),
            source: std::io::Error::other("no addresses found"),
        },
    })
}

/// Serialize the request line and headers.
///
/// Caller headers are written verbatim. `Host`, `Content-Length`,
/// `Accept-Encoding` and `Connection` are added only when absent.
fn encode_head(request: &Request, target: &Target, keep_alive: bool) -> Vec<u8> {
    let url = request.url();
    let path = &url[Position::BeforePath..Position::AfterQuery];
    let path = if path.is_empty() { "/" } else { path };

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(request.method().as_bytes());
    head.push(b' ');
    head.extend_from_slice(path.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\n");

    let headers = request.headers();
    let mut push = |name: &str, value: &str| {
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    };

    if !headers.contains("host") {
        push("Host", &target.authority);
    }
    for (name, value) in headers.iter() {
        if !name.is_empty() {
            push(name, value);
        }
    }
    if let Some(body) = request.body()
        && !headers.contains("content-length")
        && !headers.contains("transfer-encoding")
    {
        push("Content-Length", &body.len().to_string());
    }
    if !headers.contains("accept-encoding") {
        push("Accept-Encoding", "gzip, deflate");
    }
    if !headers.contains("connection") {
        push("Connection", if keep_alive { "keep-alive" } else { "close" });
    }

    head.extend_from_slice(b"\r\n");
    head
}

/// Buffered reader over a stream that may be handed back to the pool.
struct WireReader<'a, S> {
    stream: &'a mut S,
    buf: Vec<u8>,
    pos: usize,
}

impl<'a, S: AsyncRead + Unpin> WireReader<'a, S> {
    fn new(stream: &'a mut S) -> Self {
        Self {
            stream,
            buf: Vec::with_capacity(READ_CHUNK),
            pos: 0,
        }
    }

    fn available(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    fn consume(&mut self, n: usize) {
        self.pos += n;
    }

    /// Read more bytes. Returns 0 at EOF.
    async fn fill(&mut self) -> std::io::Result<usize> {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut chunk).await?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    async fn fill_or_eof(&mut self) -> Result<(), ExecutionError> {
        if self.fill().await? == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        Ok(())
    }

    async fn line(&mut self) -> Result<String, ExecutionError> {
        loop {
            if let Some(end) = self.available().iter().position(|b| *b == b'\n') {
                let line = String::from_utf8_lossy(&self.available()[..end])
                    .trim_end_matches('\r')
                    .to_string();
                self.consume(end + 1);
                return Ok(line);
            }
            self.fill_or_eof().await?;
        }
    }

    // The body readers below never grow `out` past `cap` and return true
    // when they stopped because of it.

    async fn take(
        &mut self,
        n: usize,
        out: &mut Vec<u8>,
        cap: usize,
    ) -> Result<bool, ExecutionError> {
        let room = cap.saturating_sub(out.len());
        let mut left = n.min(room);
        while left > 0 {
            if self.available().is_empty() {
                self.fill_or_eof().await?;
            }
            let len = left.min(self.available().len());
            out.extend_from_slice(&self.available()[..len]);
            self.consume(len);
            left -= len;
        }
        Ok(n > room)
    }

    async fn take_to_end(
        &mut self,
        out: &mut Vec<u8>,
        cap: usize,
    ) -> Result<bool, ExecutionError> {
        loop {
            let len = self.available().len().min(cap.saturating_sub(out.len()));
            out.extend_from_slice(&self.available()[..len]);
            self.consume(len);
            if out.len() >= cap {
                return Ok(true);
            }
            if self.fill().await? == 0 {
                return Ok(false);
            }
        }
    }

    async fn take_chunked(
        &mut self,
        out: &mut Vec<u8>,
        cap: usize,
    ) -> Result<bool, ExecutionError> {
        loop {
            let line = self.line().await?;
            let size = line.split(';').next().unwrap_or_default().trim();
            let size = usize::from_str_radix(size, 16)
                .map_err(|_| ExecutionError::Malformed(format!("invalid chunk size {size:?}")))?;
            if size == 0 {
                // Trailers end with an empty line.
                while !self.line().await?.is_empty() {}
                return Ok(false);
            }
            if self.take(size, out, cap).await? {
                return Ok(true);
            }
            self.line().await?;
        }
    }
}

#[derive(Clone, Copy)]
enum Framing {
    Empty,
    Chunked,
    Length(usize),
    UntilClose,
}

/// Read one response. The flag reports whether the connection can carry
/// another request.
pub(crate) async fn read_response<S: AsyncRead + Unpin>(
    stream: &mut S,
    head_request: bool,
    limit: &BodyLimit,
) -> Result<(RawResponse, bool), ExecutionError> {
    let mut reader = WireReader::new(stream);

    let mut response = loop {
        let parsed = parse_head(reader.available())?;
        match parsed {
            Some((len, response)) => {
                reader.consume(len);
                // Interim responses (100 Continue and friends) precede the real one.
                if (100..200).contains(&response.status) && response.status != 101 {
                    continue;
                }
                break response;
            }
            None => {
                if reader.available().len() > MAX_HEAD_BYTES {
                    return Err(ExecutionError::Malformed("response head too large".into()));
                }
                let had_bytes = !reader.available().is_empty();
                if reader.fill().await? == 0 {
                    return Err(if had_bytes {
                        ExecutionError::Malformed("incomplete response head".into())
                    } else {
                        ExecutionError::ConnectionClosed
                    });
                }
            }
        }
    };

    let framing = framing(&response, head_request)?;
    let cap = limit.cap_for(&response.headers);
    let max = cap.unwrap_or(usize::MAX);
    let mut body = Vec::new();
    let read = match framing {
        Framing::Empty => Ok(false),
        Framing::Chunked => reader.take_chunked(&mut body, max).await,
        Framing::Length(n) => reader.take(n, &mut body, max).await,
        Framing::UntilClose => reader.take_to_end(&mut body, max).await,
    };

    let capped = matches!(read, Ok(true));
    if capped {
        debug!("Stopped reading response body at {} bytes", body.len());
    }
    let complete = read.is_ok() && !capped;

    // Unread bytes are left on a capped connection.
    let reusable = complete
        && !matches!(framing, Framing::UntilClose)
        && response
            .headers
            .get("connection")
            .is_none_or(|v| !v.eq_ignore_ascii_case("close"));

    // A body cut short may not decompress; keep what arrived as-is.
    response.body = match decode_body(&response.headers, &body, cap, !complete) {
        Ok(Some(decoded)) => decoded,
        Ok(None) => body,
        Err(e) if complete => return Err(ExecutionError::Decode(e)),
        Err(_) => body,
    };

    match read {
        Ok(_) => Ok((response, reusable)),
        Err(cause) => Err(ExecutionError::Interrupted {
            partial: Box::new(response),
            cause: Box::new(cause),
        }),
    }
}

fn parse_head(buf: &[u8]) -> Result<Option<(usize, RawResponse)>, ExecutionError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let response = RawResponse {
                status: parsed.code.unwrap_or_default(),
                reason: parsed.reason.unwrap_or_default().to_string(),
                headers: parsed
                    .headers
                    .iter()
                    .map(|h| (h.name, String::from_utf8_lossy(h.value).into_owned()))
                    .collect(),
                body: Vec::new(),
            };
            Ok(Some((len, response)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(ExecutionError::Malformed(e.to_string())),
    }
}

fn framing(response: &RawResponse, head_request: bool) -> Result<Framing, ExecutionError> {
    if head_request || matches!(response.status, 204 | 304) || response.status < 200 {
        return Ok(Framing::Empty);
    }

    let chunked = response
        .headers
        .get_all("transfer-encoding")
        .flat_map(|v| v.split(','))
        .last()
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return Ok(Framing::Chunked);
    }

    match response.headers.get("content-length") {
        Some(len) => len
            .trim()
            .parse()
            .map(Framing::Length)
            .map_err(|_| ExecutionError::Malformed(format!("invalid content-length {len:?}"))),
        None => Ok(Framing::UntilClose),
    }
}

/// Decompress according to `content-encoding`, producing at most `cap`
/// bytes. `None` means the body is used as-is. With `partial`, whatever
/// inflated before an error is kept.
fn decode_body(
    headers: &Headers,
    body: &[u8],
    cap: Option<usize>,
    partial: bool,
) -> std::io::Result<Option<Vec<u8>>> {
    if body.is_empty() {
        return Ok(None);
    }
    let encoding = headers
        .get("content-encoding")
        .map(|v| v.trim().to_ascii_lowercase());

    let cap = cap.map_or(u64::MAX, |c| c as u64);
    let mut decoded = Vec::with_capacity(body.len().saturating_mul(2).min(cap as usize));
    let result = match encoding.as_deref() {
        Some("gzip") | Some("x-gzip") => GzDecoder::new(body).take(cap).read_to_end(&mut decoded),
        Some("deflate") => {
            // Servers disagree on whether "deflate" means zlib-wrapped or raw.
            match ZlibDecoder::new(body).take(cap).read_to_end(&mut decoded) {
                Err(_) if decoded.is_empty() => {
                    DeflateDecoder::new(body).take(cap).read_to_end(&mut decoded)
                }
                other => other,
            }
        }
        _ => return Ok(None),
    };

    match result {
        Ok(_) => Ok(Some(decoded)),
        Err(_) if partial && !decoded.is_empty() => Ok(Some(decoded)),
        Err(e) => Err(e),
    }
}

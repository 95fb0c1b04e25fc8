//! Upstream dispatch: pooled TLS connections to the real hosts, verbatim
//! header forwarding, streamed bodies, and the 502/504 translation the
//! client sees when the far side misbehaves.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{client, TlsConnector};

use crate::http::{
    build_forward_head, parse_response_head, BodyKind, HttpError, HttpStream, RequestHead,
};
use crate::resolve::{ResolveError, Resolver};
use crate::tls;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const RESPONSE_HEAD_TIMEOUT: Duration = Duration::from_secs(30);
pub const RESPONSE_TOTAL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const POOL_MAX_IDLE: usize = 4;
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(60);
const POOL_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

pub type UpstreamStream = client::TlsStream<TcpStream>;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("dns lookup for {0} failed: {1}")]
    Dns(String, ResolveError),
    #[error("connect to {0} failed: {1}")]
    Connect(String, String),
    #[error("tls handshake with {0} failed: {1}")]
    Tls(String, String),
    #[error("upstream closed before responding")]
    ClosedEarly,
    #[error("timed out waiting for response headers from {0}")]
    HeaderTimeout(String),
    #[error("malformed client request: {0}")]
    BadRequest(HttpError),
    #[error("upstream protocol error: {0}")]
    Protocol(HttpError),
    /// Response bytes already reached the client; nothing can be sent,
    /// the connection is just torn down.
    #[error("transfer aborted: {0}")]
    Aborted(String),
}

impl UpstreamError {
    /// Status line for errors that happen before any response byte reaches
    /// the client. `None` means close silently.
    pub fn status(&self) -> Option<(u16, &'static str)> {
        match self {
            UpstreamError::Dns(..)
            | UpstreamError::Connect(..)
            | UpstreamError::Tls(..)
            | UpstreamError::ClosedEarly
            | UpstreamError::Protocol(_) => Some((502, "Bad Gateway")),
            UpstreamError::HeaderTimeout(_) => Some((504, "Gateway Timeout")),
            UpstreamError::BadRequest(_) => Some((400, "Bad Request")),
            UpstreamError::Aborted(_) => None,
        }
    }
}

/// Dials upstream hosts on :443 with the web trust roots.
pub struct UpstreamDialer {
    resolver: Resolver,
    connector: TlsConnector,
}

impl UpstreamDialer {
    pub fn new(upstream_dns: SocketAddr) -> Self {
        Self {
            resolver: Resolver::new(upstream_dns),
            connector: TlsConnector::from(tls::upstream_client_config()),
        }
    }

    pub async fn connect(&self, host: &str) -> Result<UpstreamStream, UpstreamError> {
        let addr = self
            .resolver
            .resolve(host)
            .await
            .map_err(|e| UpstreamError::Dns(host.to_string(), e))?;

        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((addr, 443)))
            .await
            .map_err(|_| UpstreamError::Connect(host.to_string(), "connect timed out".into()))?
            .map_err(|e| UpstreamError::Connect(host.to_string(), e.to_string()))?;

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| UpstreamError::Tls(host.to_string(), e.to_string()))?;

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, self.connector.connect(server_name, tcp))
            .await
            .map_err(|_| UpstreamError::Tls(host.to_string(), "handshake timed out".into()))?
            .map_err(|e| UpstreamError::Tls(host.to_string(), e.to_string()))?;

        tracing::debug!(host = %host, addr = %addr, "upstream connection established");
        Ok(stream)
    }
}

struct Idle<S> {
    stream: S,
    opened: Instant,
}

/// Per-target pool of idle upstream connections. Each checkout is exclusive
/// for one request/response exchange; waiting longer than the lock bound
/// means the caller dials a fresh connection instead.
pub struct ConnectionPool<S> {
    shelves: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Vec<Idle<S>>>>>>,
}

impl<S> ConnectionPool<S> {
    pub fn new() -> Self {
        Self {
            shelves: Mutex::new(HashMap::new()),
        }
    }

    fn shelf(&self, host: &str) -> Arc<tokio::sync::Mutex<Vec<Idle<S>>>> {
        let mut shelves = self.shelves.lock().unwrap();
        shelves
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Vec::new())))
            .clone()
    }

    /// Pops the freshest usable idle connection, discarding expired ones.
    pub async fn checkout(&self, host: &str) -> Option<(S, Instant)> {
        let shelf = self.shelf(host);
        let mut idle = tokio::time::timeout(POOL_LOCK_TIMEOUT, shelf.lock())
            .await
            .ok()?;
        while let Some(entry) = idle.pop() {
            if entry.opened.elapsed() < POOL_MAX_LIFETIME {
                return Some((entry.stream, entry.opened));
            }
        }
        None
    }

    /// Returns a connection for reuse; full or contended shelves just drop it.
    pub async fn checkin(&self, host: &str, stream: S, opened: Instant) {
        if opened.elapsed() >= POOL_MAX_LIFETIME {
            return;
        }
        let shelf = self.shelf(host);
        let Ok(mut idle) = tokio::time::timeout(POOL_LOCK_TIMEOUT, shelf.lock()).await else {
            return;
        };
        if idle.len() < POOL_MAX_IDLE {
            idle.push(Idle { stream, opened });
        }
    }
}

impl<S> Default for ConnectionPool<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one proxied exchange.
pub struct Proxied {
    /// Whether the client connection can carry another request.
    pub client_keep_alive: bool,
}

/// Forwards one request to `target_host`, streaming both bodies through.
/// Any error reported with a status has not sent a byte to the client yet.
pub async fn forward<S>(
    client: &mut HttpStream<S>,
    req: &RequestHead,
    target_host: &str,
    path_override: Option<&str>,
    dialer: &UpstreamDialer,
    pool: &ConnectionPool<UpstreamStream>,
) -> Result<Proxied, UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request_body = req.body_kind().map_err(UpstreamError::BadRequest)?;
    let head = build_forward_head(req, target_host, path_override, request_body);

    // One retry for bodyless idempotent requests whose pooled connection
    // died before producing a single response byte.
    let retryable = request_body == BodyKind::Empty && matches!(req.method.as_str(), "GET" | "HEAD");
    let mut attempts = 0;

    loop {
        attempts += 1;
        let pooled = pool.checkout(target_host).await;
        let reused = pooled.is_some();
        let (stream, opened) = match pooled {
            Some(entry) => entry,
            None => (dialer.connect(target_host).await?, Instant::now()),
        };
        let mut upstream = HttpStream::new(stream);
        let retry_allowed = reused && retryable && attempts == 1;

        match exchange(client, &mut upstream, &head, req, request_body).await {
            Ok(ExchangeOutcome {
                client_keep_alive,
                upstream_reusable,
            }) => {
                if upstream_reusable && upstream.buffer_is_empty() {
                    let (stream, _) = upstream.into_parts();
                    pool.checkin(target_host, stream, opened).await;
                }
                return Ok(Proxied { client_keep_alive });
            }
            Err(e) => {
                let before_response = matches!(
                    e,
                    UpstreamError::ClosedEarly | UpstreamError::Connect(..)
                );
                if retry_allowed && before_response {
                    tracing::debug!(host = %target_host, error = %e, "pooled connection was dead, retrying");
                    continue;
                }
                return Err(e);
            }
        }
    }
}

struct ExchangeOutcome {
    client_keep_alive: bool,
    upstream_reusable: bool,
}

async fn exchange<S>(
    client: &mut HttpStream<S>,
    upstream: &mut HttpStream<UpstreamStream>,
    head: &[u8],
    req: &RequestHead,
    request_body: BodyKind,
) -> Result<ExchangeOutcome, UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if upstream.write_all(head).await.is_err() {
        return Err(UpstreamError::ClosedEarly);
    }

    if request_body != BodyKind::Empty {
        // The client went away mid-upload: abort upstream, nothing to send.
        client
            .copy_body(upstream.stream_mut(), request_body)
            .await
            .map_err(|e| UpstreamError::Aborted(format!("client body transfer failed: {}", e)))?;
    }

    let resp_bytes =
        match tokio::time::timeout(RESPONSE_HEAD_TIMEOUT, upstream.read_head()).await {
            Err(_) => return Err(UpstreamError::HeaderTimeout(host_of(req))),
            Ok(Err(HttpError::Io(_) | HttpError::UnexpectedEof)) | Ok(Ok(None)) => {
                return Err(UpstreamError::ClosedEarly)
            }
            Ok(Err(e)) => return Err(UpstreamError::Protocol(e)),
            Ok(Ok(Some(bytes))) => bytes,
        };

    let resp = parse_response_head(&resp_bytes).map_err(UpstreamError::Protocol)?;
    let response_body = resp
        .body_kind(&req.method)
        .map_err(UpstreamError::Protocol)?;

    // From here on bytes flow to the client; failures close silently.
    client
        .write_all(&resp_bytes)
        .await
        .map_err(|e| UpstreamError::Aborted(format!("client write failed: {}", e)))?;

    match tokio::time::timeout(
        RESPONSE_TOTAL_TIMEOUT,
        upstream.copy_body(client.stream_mut(), response_body),
    )
    .await
    {
        Err(_) => {
            return Err(UpstreamError::Aborted(
                "response exceeded the total deadline".into(),
            ))
        }
        Ok(Err(e)) => {
            return Err(UpstreamError::Aborted(format!(
                "response body transfer failed: {}",
                e
            )))
        }
        Ok(Ok(())) => {}
    }

    Ok(ExchangeOutcome {
        client_keep_alive: response_body.delimited() && !req.wants_close(),
        upstream_reusable: response_body.delimited() && !resp.wants_close(),
    })
}

fn host_of(req: &RequestHead) -> String {
    req.header("host").unwrap_or("upstream").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The pool is generic over the stream type, so its bookkeeping is
    /// exercised with plain markers instead of sockets.
    #[tokio::test]
    async fn test_pool_checkout_returns_checked_in_connection() {
        let pool: ConnectionPool<u32> = ConnectionPool::new();
        assert!(pool.checkout("osu.ppy.sh").await.is_none());

        pool.checkin("osu.ppy.sh", 7, Instant::now()).await;
        let (conn, _) = pool.checkout("osu.ppy.sh").await.unwrap();
        assert_eq!(conn, 7);
        assert!(pool.checkout("osu.ppy.sh").await.is_none());
    }

    #[tokio::test]
    async fn test_pool_is_per_target() {
        let pool: ConnectionPool<u32> = ConnectionPool::new();
        pool.checkin("a.ppy.sh", 1, Instant::now()).await;
        assert!(pool.checkout("b.ppy.sh").await.is_none());
        assert!(pool.checkout("a.ppy.sh").await.is_some());
    }

    #[tokio::test]
    async fn test_pool_caps_idle_connections() {
        let pool: ConnectionPool<u32> = ConnectionPool::new();
        for i in 0..10 {
            pool.checkin("osu.ppy.sh", i, Instant::now()).await;
        }
        let mut held = 0;
        while pool.checkout("osu.ppy.sh").await.is_some() {
            held += 1;
        }
        assert_eq!(held, POOL_MAX_IDLE);
    }

    #[tokio::test]
    async fn test_pool_evicts_expired_connections() {
        let pool: ConnectionPool<u32> = ConnectionPool::new();
        let expired = Instant::now() - POOL_MAX_LIFETIME - Duration::from_secs(1);
        pool.checkin("osu.ppy.sh", 1, expired).await;
        assert!(pool.checkout("osu.ppy.sh").await.is_none());

        // checkin of an already-expired connection is a drop.
        let pool: ConnectionPool<u32> = ConnectionPool::new();
        pool.checkin("osu.ppy.sh", 1, expired).await;
        pool.checkin("osu.ppy.sh", 2, Instant::now()).await;
        let (conn, _) = pool.checkout("osu.ppy.sh").await.unwrap();
        assert_eq!(conn, 2);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            UpstreamError::Dns("x".into(), ResolveError::NoRecords("x".into())).status(),
            Some((502, "Bad Gateway"))
        );
        assert_eq!(
            UpstreamError::Connect("x".into(), "refused".into()).status(),
            Some((502, "Bad Gateway"))
        );
        assert_eq!(
            UpstreamError::HeaderTimeout("x".into()).status(),
            Some((504, "Gateway Timeout"))
        );
        assert_eq!(UpstreamError::Aborted("gone".into()).status(), None);
    }
}

//! Accept loop and per-connection driver. Every accepted connection runs as
//! its own task; a failing connection never takes the listener down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ProxyConfig;
use crate::counters::Counters;
use crate::http::{
    build_forward_head_buffered, parse_request_head, redirect_response, simple_response,
    HttpError, HttpStream, RequestHead,
};
use crate::routing::{self, Route, RouteTable};
use crate::splice::{self, Splicer};
use crate::tls::{self, AcceptError};
use crate::upstream::{self, ConnectionPool, UpstreamDialer, UpstreamStream};

/// Connections with no bytes in either direction for this long are closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How long in-flight connections get to finish after stop.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The Bancho login request is tiny; anything beyond this is not a login.
const BANCHO_BODY_CAP: usize = 1024 * 1024;

/// Shared state for one proxy run.
pub struct ServerContext {
    pub config: ProxyConfig,
    pub table: RouteTable,
    pub tls_config: Arc<rustls::ServerConfig>,
    pub counters: Arc<Counters>,
    pub dialer: UpstreamDialer,
    pub pool: ConnectionPool<UpstreamStream>,
}

impl ServerContext {
    pub fn new(
        config: ProxyConfig,
        table: RouteTable,
        tls_config: Arc<rustls::ServerConfig>,
        counters: Arc<Counters>,
    ) -> Self {
        let dialer = UpstreamDialer::new(config.upstream_dns);
        Self {
            config,
            table,
            tls_config,
            counters,
            dialer,
            pool: ConnectionPool::new(),
        }
    }
}

/// Runs the accept loop until `shutdown` fires, then drains in-flight
/// connections for [`DRAIN_TIMEOUT`] and aborts the stragglers.
pub async fn serve(listener: TcpListener, ctx: Arc<ServerContext>, shutdown: CancellationToken) {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        // Reap finished connection tasks as we go.
                        while tasks.try_join_next().is_some() {}

                        let ctx = ctx.clone();
                        let token = shutdown.clone();
                        tasks.spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, ctx, token).await {
                                tracing::warn!(peer = %peer, error = %e, "connection closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }

    drop(listener);

    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("drain timed out, aborting remaining connections");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    tracing::info!("accept loop stopped");
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let accepted = tokio::time::timeout(
        tls::HANDSHAKE_TIMEOUT,
        tls::accept_with_sni(stream, ctx.tls_config.clone()),
    )
    .await;

    let (tls_stream, sni) = match accepted {
        Err(_) => {
            tracing::warn!(peer = %peer, "tls handshake timed out");
            return Ok(());
        }
        Ok(Err(AcceptError::MissingSni)) => {
            // rustls already answered with the unrecognized_name alert;
            // nothing to route without a name.
            tracing::warn!(peer = %peer, "rejected connection without sni");
            return Ok(());
        }
        Ok(Err(e)) => {
            tracing::warn!(peer = %peer, error = %e, "tls accept failed");
            return Ok(());
        }
        Ok(Ok(pair)) => pair,
    };

    tracing::debug!(peer = %peer, sni = %sni, "client connection established");
    let mut client = HttpStream::new(tls_stream);

    loop {
        let head_bytes = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = tokio::time::timeout(IDLE_TIMEOUT, client.read_head()) => match read {
                Err(_) => {
                    tracing::debug!(peer = %peer, "client idle, closing");
                    break;
                }
                Ok(Ok(None)) => break,
                Ok(Ok(Some(bytes))) => bytes,
                Ok(Err(e @ (HttpError::Malformed(_) | HttpError::HeadTooLarge))) => {
                    tracing::warn!(peer = %peer, error = %e, "malformed request");
                    let _ = client.write_all(&simple_response(400, "Bad Request", true)).await;
                    break;
                }
                Ok(Err(_)) => break,
            },
        };

        let req = match parse_request_head(&head_bytes) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "malformed request head");
                let _ = client.write_all(&simple_response(400, "Bad Request", true)).await;
                break;
            }
        };

        ctx.counters.inc_requests();
        let route = ctx.table.classify(&sni, &req.method, &req.target);
        tracing::debug!(
            peer = %peer,
            method = %req.method,
            path = %req.target,
            route = ?route,
            "request classified"
        );

        match route {
            Route::BanchoSplice => {
                splice_bancho(client, req, &ctx, shutdown).await;
                return Ok(());
            }
            Route::MirrorRedirect { location } => {
                discard_body(&mut client, &req).await?;
                if routing::is_beatmap_download(&req.target) {
                    ctx.counters.inc_beatmaps();
                }
                client.write_all(&redirect_response(&location)).await?;
                if req.wants_close() {
                    break;
                }
            }
            Route::MirrorForward { target_host, path } => {
                if !proxy_request(&mut client, &req, &target_host, Some(&path), &ctx).await? {
                    break;
                }
            }
            Route::UpstreamPassthrough { target_host } => {
                if !proxy_request(&mut client, &req, &target_host, None, &ctx).await? {
                    break;
                }
            }
            Route::Misdirected => {
                tracing::warn!(peer = %peer, sni = %sni, "request for a host we do not answer for");
                discard_body(&mut client, &req).await?;
                client
                    .write_all(&simple_response(421, "Misdirected Request", true))
                    .await?;
                break;
            }
        }
    }

    // Send close_notify before dropping the stream.
    let _ = client.stream_mut().shutdown().await;
    Ok(())
}

/// Forwards one exchange; returns whether the client connection survives.
async fn proxy_request<S>(
    client: &mut HttpStream<S>,
    req: &RequestHead,
    target_host: &str,
    path_override: Option<&str>,
    ctx: &ServerContext,
) -> anyhow::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match upstream::forward(client, req, target_host, path_override, &ctx.dialer, &ctx.pool).await
    {
        Ok(outcome) => Ok(outcome.client_keep_alive),
        Err(e) => {
            match e.status() {
                Some((code, reason)) => {
                    tracing::warn!(host = %target_host, error = %e, status = code, "upstream request failed");
                    let _ = client.write_all(&simple_response(code, reason, true)).await;
                }
                None => {
                    tracing::warn!(host = %target_host, error = %e, "transfer aborted");
                }
            }
            Ok(false)
        }
    }
}

/// Reads and drops a request body so the next pipelined head lines up.
async fn discard_body<S>(client: &mut HttpStream<S>, req: &RequestHead) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let kind = match req.body_kind() {
        Ok(kind) => kind,
        Err(_) => return Ok(()),
    };
    let mut sink = tokio::io::sink();
    client.copy_body(&mut sink, kind).await?;
    Ok(())
}

/// Forwards the Bancho login POST, relays the response head, then turns the
/// connection into a full-duplex byte relay with the server->client
/// direction running through the splicer.
async fn splice_bancho<S>(
    mut client: HttpStream<S>,
    req: RequestHead,
    ctx: &ServerContext,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = ctx.table.bancho_target().to_string();

    let body = match req.body_kind() {
        Ok(kind) => match client.read_body(kind, BANCHO_BODY_CAP).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "bancho login body rejected");
                let _ = client.write_all(&simple_response(400, "Bad Request", true)).await;
                return;
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "bancho login framing rejected");
            let _ = client.write_all(&simple_response(400, "Bad Request", true)).await;
            return;
        }
    };

    let stream = match ctx.dialer.connect(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(host = %target, error = %e, "bancho upstream unreachable");
            let (code, reason) = e.status().unwrap_or((502, "Bad Gateway"));
            let _ = client.write_all(&simple_response(code, reason, true)).await;
            return;
        }
    };
    let mut upstream_conn = HttpStream::new(stream);

    let head = build_forward_head_buffered(&req, &target, body.len());
    if upstream_conn.write_all(&head).await.is_err()
        || (!body.is_empty() && upstream_conn.write_all(&body).await.is_err())
    {
        let _ = client.write_all(&simple_response(502, "Bad Gateway", true)).await;
        return;
    }

    // Relay the login response head verbatim; inspection starts with the
    // first body byte.
    let resp_bytes = match tokio::time::timeout(
        upstream::RESPONSE_HEAD_TIMEOUT,
        upstream_conn.read_head(),
    )
    .await
    {
        Err(_) => {
            tracing::warn!(host = %target, "bancho login response timed out");
            let _ = client.write_all(&simple_response(504, "Gateway Timeout", true)).await;
            return;
        }
        Ok(Ok(Some(bytes))) => bytes,
        Ok(_) => {
            tracing::warn!(host = %target, "bancho upstream closed during login");
            let _ = client.write_all(&simple_response(502, "Bad Gateway", true)).await;
            return;
        }
    };
    if client.write_all(&resp_bytes).await.is_err() {
        return;
    }

    let inject = ctx.config.inject_supporter;
    tracing::info!(host = %target, inject = inject, "bancho session established");

    let (client_stream, client_pending) = client.into_parts();
    let (upstream_stream, upstream_pending) = upstream_conn.into_parts();
    let (mut client_read, mut client_write) = tokio::io::split(client_stream);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream_stream);

    let client_to_server = async {
        if !client_pending.is_empty() {
            upstream_write.write_all(&client_pending).await?;
        }
        splice::copy_plain(&mut client_read, &mut upstream_write, IDLE_TIMEOUT).await
    };

    let counters = &ctx.counters;
    let server_to_client = async {
        if inject {
            let mut splicer = Splicer::new(true);
            if !upstream_pending.is_empty() {
                let mut out = Vec::with_capacity(upstream_pending.len());
                counters.add_injected(splicer.feed(&upstream_pending, &mut out));
                client_write.write_all(&out).await?;
            }
            splice::copy_spliced(
                &mut upstream_read,
                &mut client_write,
                &mut splicer,
                counters,
                IDLE_TIMEOUT,
            )
            .await
        } else {
            if !upstream_pending.is_empty() {
                client_write.write_all(&upstream_pending).await?;
            }
            splice::copy_plain(&mut upstream_read, &mut client_write, IDLE_TIMEOUT).await
        }
    };

    // Either side closing (or shutdown) tears down both directions.
    tokio::select! {
        result = client_to_server => match result {
            Ok(bytes) => tracing::debug!(bytes, "bancho client side closed"),
            Err(e) => tracing::warn!(error = %e, "bancho client->server relay failed"),
        },
        result = server_to_client => match result {
            Ok(bytes) => tracing::debug!(bytes, "bancho server side closed"),
            Err(e) => tracing::warn!(error = %e, "bancho server->client relay failed"),
        },
        _ = shutdown.cancelled() => {
            tracing::debug!("bancho session closed by shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::RouteTable;
    use crate::trust;

    use rustls::pki_types::ServerName;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Upstream verification is irrelevant here; the test talks to our own
    /// listener with its freshly generated certificate.
    #[derive(Debug)]
    struct NoCertVerifier;

    impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            rustls::crypto::aws_lc_rs::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    async fn start_test_server() -> (SocketAddr, CancellationToken, Arc<ServerContext>) {
        let dir = tempfile::tempdir().unwrap();
        let config = ProxyConfig::default();
        let bundle = trust::ensure(dir.path(), &config.certificate_domains()).unwrap();
        let tls_config = tls::server_config(&bundle).unwrap();
        let table = RouteTable::new(&config).unwrap();
        let counters = Arc::new(Counters::new());

        let ctx = Arc::new(ServerContext::new(config, table, tls_config, counters));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();

        tokio::spawn(serve(listener, ctx.clone(), token.clone()));
        (addr, token, ctx)
    }

    async fn tls_client(
        addr: SocketAddr,
        sni: &str,
    ) -> tokio_rustls::client::TlsStream<TcpStream> {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

        let tcp = TcpStream::connect(addr).await.unwrap();
        let name = ServerName::try_from(sni.to_string()).unwrap();
        connector.connect(name, tcp).await.unwrap()
    }

    #[tokio::test]
    async fn test_beatmap_download_redirects_to_mirror() {
        let (addr, token, ctx) = start_test_server().await;

        let mut stream = tls_client(addr, "osu.ppy.sh").await;
        stream
            .write_all(b"GET /d/1234 HTTP/1.1\r\nHost: osu.ppy.sh\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8(response).unwrap();

        assert!(text.starts_with("HTTP/1.1 302 Found\r\n"), "got: {}", text);
        assert!(text.contains("Location: https://direct.rai.moe/d/1234\r\n"));

        let snapshot = ctx.counters.snapshot();
        assert_eq!(snapshot.requests_proxied, 1);
        assert_eq!(snapshot.beatmaps_downloaded, 1);

        token.cancel();
    }

    #[tokio::test]
    async fn test_unknown_sni_gets_421() {
        let (addr, token, _ctx) = start_test_server().await;

        let mut stream = tls_client(addr, "example.com").await;
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 421 Misdirected Request\r\n"), "got: {}", text);

        token.cancel();
    }

    #[tokio::test]
    async fn test_persistent_connection_carries_two_requests() {
        let (addr, token, ctx) = start_test_server().await;

        let mut stream = tls_client(addr, "osu.ppy.sh").await;
        stream
            .write_all(b"GET /d/1 HTTP/1.1\r\nHost: osu.ppy.sh\r\n\r\n")
            .await
            .unwrap();

        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(std::str::from_utf8(&buf[..n]).unwrap().starts_with("HTTP/1.1 302"));

        stream
            .write_all(b"GET /d/2n HTTP/1.1\r\nHost: osu.ppy.sh\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        let text = String::from_utf8(rest).unwrap();
        assert!(text.contains("Location: https://direct.rai.moe/d/2n\r\n"));

        assert_eq!(ctx.counters.snapshot().requests_proxied, 2);
        token.cancel();
    }

    #[tokio::test]
    async fn test_malformed_request_gets_400() {
        let (addr, token, _ctx) = start_test_server().await;

        let mut stream = tls_client(addr, "osu.ppy.sh").await;
        stream.write_all(b"NOT-HTTP\r\n\r\n").await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8(response).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "got: {}", text);

        token.cancel();
    }

    #[tokio::test]
    async fn test_client_hello_without_sni_gets_unrecognized_name_alert() {
        let (addr, token, _ctx) = start_test_server().await;

        // A real ClientHello, just without the server_name extension.
        let mut tcp = TcpStream::connect(addr).await.unwrap();
        tcp.write_all(&tls::test_support::client_hello(None))
            .await
            .unwrap();

        // The fatal alert is the only thing on the wire, then the socket
        // closes.
        let mut response = Vec::new();
        tcp.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, tls::test_support::UNRECOGNIZED_NAME_ALERT);

        token.cancel();
    }

    #[tokio::test]
    async fn test_non_tls_connection_is_dropped() {
        let (addr, token, _ctx) = start_test_server().await;

        // Plaintext HTTP on the TLS port: the handshake fails and the
        // connection is closed without an HTTP response. At most a tls
        // alert record comes back.
        let mut tcp = TcpStream::connect(addr).await.unwrap();
        tcp.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let mut response = Vec::new();
        tcp.read_to_end(&mut response).await.unwrap();
        assert!(response.is_empty() || response[0] == 0x15, "got: {:?}", response);

        token.cancel();
    }
}

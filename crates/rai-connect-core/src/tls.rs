//! TLS termination. The handshake is driven through
//! `tokio_rustls::LazyConfigAcceptor`, which parses the ClientHello before
//! any certificate is selected - the router needs the SNI, and it must be
//! known before the first HTTP byte arrives. The listener presents one
//! locally-trusted certificate for every alias; a hello that carries no
//! server name is declined by the certificate resolver, which rustls
//! answers with a fatal `unrecognized_name` alert.

use std::sync::Arc;
use std::time::Duration;

use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{server, LazyConfigAcceptor};

use crate::trust::CertificateBundle;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("client hello carries no server name")]
    MissingSni,
    #[error("tls handshake failed: {0}")]
    Handshake(#[from] std::io::Error),
}

/// Serves the shared certificate for any named request; a hello without
/// SNI resolves to nothing, which rustls rejects with `unrecognized_name`.
#[derive(Debug)]
struct RequireSni {
    key: Arc<CertifiedKey>,
}

impl ResolvesServerCert for RequireSni {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        if client_hello.server_name().is_none() {
            return None;
        }
        Some(self.key.clone())
    }
}

/// Server config presenting the shared certificate, HTTP/1.1 only.
pub fn server_config(bundle: &CertificateBundle) -> Result<Arc<ServerConfig>, rustls::Error> {
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&bundle.key_der)?;
    let key = Arc::new(CertifiedKey::new(
        vec![bundle.cert_der.clone()],
        signing_key,
    ));

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(RequireSni { key }));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Client config for dialing the real upstream hosts, anchored on the
/// bundled web roots rather than our own certificate.
pub fn upstream_client_config() -> Arc<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
}

/// Accepts one TLS connection and returns the finished stream together with
/// the SNI the client asked for.
pub async fn accept_with_sni<IO>(
    stream: IO,
    config: Arc<ServerConfig>,
) -> Result<(server::TlsStream<IO>, String), AcceptError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let acceptor = LazyConfigAcceptor::new(Acceptor::default(), stream);
    let start = acceptor.await?;

    let sni = start.client_hello().server_name().map(str::to_string);
    match sni {
        Some(name) => {
            let tls = start.into_stream(config).await?;
            Ok((tls, name))
        }
        None => {
            // Drive the refused handshake anyway: the alert has to reach
            // the peer before the connection is dropped.
            let _ = start.into_stream(config).await;
            Err(AcceptError::MissingSni)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{client_hello, UNRECOGNIZED_NAME_ALERT};
    use super::*;
    use crate::trust;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_bundle() -> (tempfile::TempDir, CertificateBundle) {
        let dir = tempfile::tempdir().unwrap();
        let bundle = trust::ensure(
            dir.path(),
            &["osu.ppy.sh".to_string(), "localhost".to_string()],
        )
        .unwrap();
        (dir, bundle)
    }

    #[test]
    fn test_server_config_builds_from_generated_bundle() {
        let (_dir, bundle) = test_bundle();
        let config = server_config(&bundle).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_alert_bytes_are_unrecognized_name() {
        // alert(21), fatal(2), unrecognized_name(112)
        assert_eq!(UNRECOGNIZED_NAME_ALERT[0], 21);
        assert_eq!(UNRECOGNIZED_NAME_ALERT[5], 2);
        assert_eq!(UNRECOGNIZED_NAME_ALERT[6], 112);
    }

    #[tokio::test]
    async fn test_hello_without_sni_is_answered_with_alert() {
        let (_dir, bundle) = test_bundle();
        let config = server_config(&bundle).unwrap();

        let (mut client, server) = tokio::io::duplex(16 * 1024);
        let accept = tokio::spawn(async move { accept_with_sni(server, config).await });

        client.write_all(&client_hello(None)).await.unwrap();

        // The exact alert record comes back, then the connection closes.
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, UNRECOGNIZED_NAME_ALERT);

        let result = accept.await.unwrap();
        assert!(matches!(result, Err(AcceptError::MissingSni)));
    }

    #[tokio::test]
    async fn test_non_tls_bytes_fail_the_accept() {
        let (_dir, bundle) = test_bundle();
        let config = server_config(&bundle).unwrap();

        let (mut client, server) = tokio::io::duplex(4096);
        let accept = tokio::spawn(async move { accept_with_sni(server, config).await });

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let result = accept.await.unwrap();
        assert!(matches!(result, Err(AcceptError::Handshake(_))));
    }
}

//! HTTPS listener serving the same router as the plain HTTP listener.

use crate::error::{GatewayError, Result};
use axum::extract::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rustls::ServerConfig;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, info, warn};

/// Env values may carry PEM with literal `\n` sequences.
fn unescape_pem(pem: &str) -> String {
    pem.replace("\\n", "\n")
}

/// Build a rustls server config from PEM-encoded certificate chain and private key.
pub fn server_config(cert_pem: &str, key_pem: &str) -> Result<Arc<ServerConfig>> {
    let cert_pem = unescape_pem(cert_pem);
    let key_pem = unescape_pem(key_pem);

    let certs = CertificateDer::pem_slice_iter(cert_pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Tls(format!("invalid certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(GatewayError::Tls("no certificate found".to_string()));
    }
    let key = PrivateKeyDer::from_pem_slice(key_pem.as_bytes())
        .map_err(|e| GatewayError::Tls(format!("invalid private key: {}", e)))?;

    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Accept TLS connections until `shutdown` is cancelled.
///
/// Each connection is served with WebSocket upgrades enabled and the peer address made
/// available to handlers as [`ConnectInfo`].
pub async fn serve_tls(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    app: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(config);
    info!("HTTPS listening on {}", listener.local_addr()?);

    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("HTTPS accept failed: {}", e);
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(e) => {
                    debug!("TLS handshake with {} failed: {}", remote, e);
                    return;
                }
            };

            let service = hyper::service::service_fn(move |mut request: Request<Incoming>| {
                request.extensions_mut().insert(ConnectInfo(remote));
                app.clone().call(request)
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(tls), service)
                .await
            {
                debug!("HTTPS connection from {} ended: {}", remote, e);
            }
        });
    }

    info!("HTTPS listener stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unescape_pem() {
        assert_eq!(
            unescape_pem("-----BEGIN X-----\\nAAAA\\n-----END X-----"),
            "-----BEGIN X-----\nAAAA\n-----END X-----"
        );
    }

    #[test]
    fn test_rejects_missing_material() {
        assert!(matches!(server_config("", ""), Err(GatewayError::Tls(_))));
        assert!(matches!(
            server_config("not a pem", "not a pem"),
            Err(GatewayError::Tls(_))
        ));
    }
}

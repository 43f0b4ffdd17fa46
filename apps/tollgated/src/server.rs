//! Listener plumbing.
//!
//! The plain listener serves HTTP/1.1 and cleartext HTTP/2 (prior
//! knowledge) through axum's auto-negotiating connection builder; the TLS
//! listener runs its own accept loop so each connection is handed to
//! rustls before hyper sees it. Both drain by refusing new connections
//! once the shutdown signal fires.

use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::{self, ServerConfig};
use tower::Service as _;
use tracing::{debug, warn};

pub async fn serve_plain(
    listener: TcpListener,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    })
    .await
    .context("serve")
}

pub fn load_tls_config(cert_file: &Path, key_file: &Path) -> anyhow::Result<Arc<ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        std::fs::File::open(cert_file)
            .with_context(|| format!("open {}", cert_file.display()))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .context("parse certificate chain")?;
    if certs.is_empty() {
        anyhow::bail!("no certificates in {}", cert_file.display());
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(
        std::fs::File::open(key_file).with_context(|| format!("open {}", key_file.display()))?,
    ))
    .context("parse private key")?
    .with_context(|| format!("no private key in {}", key_file.display()))?;

    // Pick the crypto provider explicitly; with several enabled through
    // transitive features, the plain builder would panic.
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("tls protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("tls certificate/key mismatch")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

pub async fn serve_tls(
    listener: TcpListener,
    app: Router,
    tls: Arc<ServerConfig>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let acceptor = TlsAcceptor::from(tls);
    let mut make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    loop {
        let (tcp, remote) = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };

        let tower_service = match make_service.call(remote).await {
            Ok(service) => service,
            Err(infallible) => match infallible {},
        };
        let acceptor = acceptor.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(%remote, error = %e, "tls handshake failed");
                    return;
                }
            };
            let hyper_service = TowerToHyperService::new(tower_service);
            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(tls_stream), hyper_service)
                .await
            {
                debug!(%remote, error = %e, "connection error");
            }
        });
    }
    Ok(())
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use tollgate_mint::{
    Challenger, FileKvStore, KvSecretStore, LightningClient, Mint, StaticServiceLimiter,
    fake::FakeLightningClient,
};
use tollgated::config::{Config, LightningBackend};
use tollgated::lnd::LndRestClient;
use tollgated::proxy::Proxy;
use tollgated::server;
use tollgated::tor;

/// Grace period for settlements the node has confirmed but the
/// subscription has not delivered yet, so a client that pays and
/// immediately retries is not bounced once.
const SETTLEMENT_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(
    name = "tollgated",
    version,
    about = "Pay-per-request reverse proxy gating backends behind Lightning invoices"
)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, env = "TOLLGATE_CONFIG", default_value = "tollgate.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hyper=warn".into()),
        )
        .init();

    let args = Args::parse();
    let cfg = Config::load(&args.config)
        .with_context(|| format!("load config {}", args.config.display()))?;

    let kv = Arc::new(
        FileKvStore::open(&cfg.data_dir)
            .await
            .context("open data directory")?,
    );
    let secrets = Arc::new(KvSecretStore::new(Arc::clone(&kv)));

    let lightning: Arc<dyn LightningClient> = match cfg.lightning.backend {
        LightningBackend::Fake => {
            info!("using the in-process fake Lightning backend");
            if cfg.lightning.auto_settle {
                Arc::new(FakeLightningClient::auto_settling())
            } else {
                Arc::new(FakeLightningClient::new())
            }
        }
        LightningBackend::Lnd => Arc::new(LndRestClient::from_config(&cfg.lightning)?),
    };

    let challenger = Arc::new(Challenger::new(lightning));
    challenger.start().await.context("start challenger")?;

    let limiter = StaticServiceLimiter::new(
        cfg.services
            .iter()
            .map(|s| s.terms())
            .collect::<anyhow::Result<Vec<_>>>()?,
    );
    let mint = Arc::new(
        Mint::new(Arc::clone(&challenger), secrets, Arc::new(limiter))
            .with_settlement_wait(SETTLEMENT_WAIT),
    );

    let app = Proxy::new(&cfg, mint)?.router();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut servers = tokio::task::JoinSet::new();

    let listener = TcpListener::bind(cfg.listen_addr)
        .await
        .with_context(|| format!("bind {}", cfg.listen_addr))?;
    if cfg.insecure {
        info!(addr = %cfg.listen_addr, "listening (cleartext)");
        servers.spawn(server::serve_plain(
            listener,
            app.clone(),
            shutdown_rx.clone(),
        ));
    } else {
        // validate() guarantees both paths are present here.
        let tls = server::load_tls_config(
            cfg.tls_cert_file.as_deref().context("tls_cert_file")?,
            cfg.tls_key_file.as_deref().context("tls_key_file")?,
        )?;
        info!(addr = %cfg.listen_addr, "listening (tls)");
        servers.spawn(server::serve_tls(
            listener,
            app.clone(),
            tls,
            shutdown_rx.clone(),
        ));
    }

    // The control connection must outlive the select below: Tor tears
    // the onion services down when it closes.
    let mut _tor_controller = None;
    if let Some(tor_cfg) = cfg.tor.as_ref().filter(|t| t.v2 || t.v3) {
        // Onion services already encrypt end to end, so the Tor-side
        // listener speaks cleartext HTTP/2 on loopback only.
        let addr = SocketAddr::from(([127, 0, 0, 1], tor_cfg.listen_port));
        let tor_listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind tor listener {addr}"))?;
        info!(%addr, "tor-side listener up (cleartext h2)");
        servers.spawn(server::serve_plain(
            tor_listener,
            app.clone(),
            shutdown_rx.clone(),
        ));

        let controller = tor::ControlPortController::connect(&tor_cfg.control).await?;
        let onions = tor::OnionStore::new(Arc::clone(&kv));
        tor::publish_onion_services(&controller, &onions, tor_cfg)
            .await
            .context("publish onion services")?;
        _tor_controller = Some(controller);
    }

    let mut fatal: Option<anyhow::Error> = None;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        Some(result) = servers.join_next() => match result {
            Ok(Ok(())) => error!("listener exited unexpectedly"),
            Ok(Err(e)) => {
                error!(error = %e, "listener failed");
                fatal = Some(e);
            }
            Err(e) => {
                error!(error = %e, "listener task panicked");
                fatal = Some(e.into());
            }
        },
    }

    // Drain: stop accepting first, then tear down the challenger.
    let _ = shutdown_tx.send(true);
    while servers.join_next().await.is_some() {}
    challenger.stop().await;
    info!("shutdown complete");

    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

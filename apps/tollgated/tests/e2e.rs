//! End-to-end tests: a real proxy listener in front of a real upstream,
//! with the in-process Lightning backend standing in for the node.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

use tollgate_lsat::{Macaroon, TokenId, wire};
use tollgate_mint::fake::FakeLightningClient;
use tollgate_mint::{Challenger, LightningClient, MemSecretStore, Mint, StaticServiceLimiter};
use tollgated::config::{
    Config, LightningBackend, LightningConfig, Protocol, ServiceConfig, StaticConfig,
};
use tollgated::proxy::Proxy;

struct TestEnv {
    proxy_addr: SocketAddr,
    http: reqwest::Client,
    lightning: Arc<FakeLightningClient>,
    mint: Arc<Mint>,
    upstream_addr: SocketAddr,
}

impl TestEnv {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.proxy_addr)
    }

    /// Settles the invoice behind a challenge and returns the
    /// `Authorization` header value that pays for it.
    async fn pay(&self, www_authenticate: &str) -> String {
        let (macaroon_b64, _invoice) = wire::parse_www_authenticate(www_authenticate).unwrap();
        let macaroon = Macaroon::deserialize(&macaroon_b64).unwrap();
        let id = TokenId::decode(macaroon.identifier()).unwrap();
        self.lightning.settle(id.payment_hash).await;
        let preimage = self.lightning.preimage_for(id.payment_hash).await.unwrap();
        format!("LSAT {macaroon_b64}:{}", hex::encode(preimage))
    }
}

fn service(name: &str, path_regexp: &str, auth: &str) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        address: String::new(), // patched to the upstream address in start()
        protocol: Protocol::Http,
        tls_cert_path: None,
        host_regexp: None,
        path_regexp: Some(path_regexp.to_string()),
        auth: auth.parse().unwrap(),
        headers: HashMap::new(),
        price_msat: 1000,
        capabilities: Vec::new(),
        constraints: Vec::new(),
    }
}

/// The upstream echoes its request path and headers back as JSON.
async fn upstream_handler(req: Request<Body>) -> Json<serde_json::Value> {
    let mut headers = serde_json::Map::new();
    for (name, value) in req.headers() {
        headers.insert(
            name.to_string(),
            serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
        );
    }
    Json(serde_json::json!({
        "path": req.uri().path(),
        "headers": headers,
    }))
}

async fn start(mut services: Vec<ServiceConfig>, static_root: Option<&std::path::Path>) -> TestEnv {
    let upstream_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            upstream_listener,
            Router::new().fallback(upstream_handler),
        )
        .await
        .unwrap();
    });

    for svc in &mut services {
        if svc.address.is_empty() {
            svc.address = upstream_addr.to_string();
        }
    }

    let data_dir = std::env::temp_dir();
    let mut cfg = Config {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        insecure: true,
        tls_cert_file: None,
        tls_key_file: None,
        data_dir,
        lightning: LightningConfig {
            backend: LightningBackend::Fake,
            address: None,
            tls_cert_path: None,
            macaroon_path: None,
            auto_settle: false,
        },
        tor: None,
        services,
        static_files: static_root.map(|root| StaticConfig {
            serve: true,
            root: root.to_path_buf(),
        }),
    };
    cfg.validate().unwrap();

    let lightning = Arc::new(FakeLightningClient::new());
    let challenger = Arc::new(Challenger::new(
        Arc::clone(&lightning) as Arc<dyn LightningClient>
    ));
    challenger.start().await.unwrap();

    let limiter = StaticServiceLimiter::new(
        cfg.services.iter().map(|s| s.terms().unwrap()),
    );
    let mint = Arc::new(
        Mint::new(
            challenger,
            Arc::new(MemSecretStore::new()),
            Arc::new(limiter),
        )
        .with_settlement_wait(Duration::from_secs(2)),
    );

    let app = Proxy::new(&cfg, Arc::clone(&mint)).unwrap().router();
    let proxy_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            proxy_listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestEnv {
        proxy_addr,
        http: reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap(),
        lightning,
        mint,
        upstream_addr,
    }
}

#[tokio::test]
async fn happy_path_challenge_pay_retry() {
    let env = start(vec![service("svc1", "^/foo", "on")], None).await;

    // No credentials: a challenge with an invoice and empty body.
    let resp = env.http.get(env.url("/foo")).send().await.unwrap();
    assert_eq!(resp.status(), 402);
    let challenge = resp
        .headers()
        .get("www-authenticate")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(!challenge.is_empty());
    let (_, invoice) = wire::parse_www_authenticate(&challenge).unwrap();
    assert!(invoice.starts_with("lnfake1000m"), "{invoice}");
    assert!(resp.bytes().await.unwrap().is_empty());

    // Pay and retry: the upstream answers.
    let authorization = env.pay(&challenge).await;
    let resp = env
        .http
        .get(env.url("/foo"))
        .header("Authorization", &authorization)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["path"], "/foo");

    // The token keeps working.
    let resp = env
        .http
        .get(env.url("/foo"))
        .header("Authorization", &authorization)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn freebie_quota_is_exact() {
    let env = start(vec![service("svc1", "^/", "freebie 2")], None).await;

    for _ in 0..2 {
        let resp = env.http.get(env.url("/anything")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
    }
    let resp = env.http.get(env.url("/anything")).send().await.unwrap();
    assert_eq!(resp.status(), 402);
}

#[tokio::test]
async fn token_for_service_a_is_challenged_at_service_b() {
    let env = start(
        vec![
            service("svc1", "^/svc1", "on"),
            service("svc2", "^/svc2", "on"),
        ],
        None,
    )
    .await;

    let resp = env.http.get(env.url("/svc1")).send().await.unwrap();
    let challenge = resp
        .headers()
        .get("www-authenticate")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let (_, svc1_invoice) = wire::parse_www_authenticate(&challenge).unwrap();
    let authorization = env.pay(&challenge).await;

    // Good for svc1.
    let resp = env
        .http
        .get(env.url("/svc1"))
        .header("Authorization", &authorization)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Challenged at svc2, with an svc2 invoice rather than the old one.
    let resp = env
        .http
        .get(env.url("/svc2"))
        .header("Authorization", &authorization)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 402);
    let challenge = resp
        .headers()
        .get("www-authenticate")
        .unwrap()
        .to_str()
        .unwrap();
    let (_, svc2_invoice) = wire::parse_www_authenticate(challenge).unwrap();
    assert_ne!(svc2_invoice, svc1_invoice);
}

#[tokio::test]
async fn revocation_invalidates_working_credentials() {
    let env = start(vec![service("svc1", "^/", "on")], None).await;

    let resp = env.http.get(env.url("/x")).send().await.unwrap();
    let challenge = resp
        .headers()
        .get("www-authenticate")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let authorization = env.pay(&challenge).await;

    let resp = env
        .http
        .get(env.url("/x"))
        .header("Authorization", &authorization)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    // Operator revokes the token's secret.
    let (macaroon_b64, _) = wire::parse_www_authenticate(&challenge).unwrap();
    let macaroon = Macaroon::deserialize(&macaroon_b64).unwrap();
    env.mint.revoke_lsat(&macaroon).await.unwrap();

    let resp = env
        .http
        .get(env.url("/x"))
        .header("Authorization", &authorization)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 402);
}

#[tokio::test]
async fn file_headers_are_materialized_for_the_backend() {
    let dir = tempfile::tempdir().unwrap();
    let key_file = dir.path().join("k");
    std::fs::write(&key_file, [0xde, 0xad]).unwrap();

    let mut svc = service("svc1", "^/", "off");
    svc.headers.insert(
        "X-Auth".to_string(),
        format!("!file+hex:{}", key_file.display()),
    );
    let env = start(vec![svc], None).await;

    let resp = env.http.get(env.url("/echo")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["headers"]["x-auth"], "dead");
}

#[tokio::test]
async fn backend_sees_its_own_address_as_host() {
    let env = start(vec![service("svc1", "^/", "off")], None).await;
    let resp = env.http.get(env.url("/host-check")).send().await.unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["headers"]["host"], env.upstream_addr.to_string());
}

#[tokio::test]
async fn static_fallback_serves_and_refuses_traversal() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<html>static</html>").unwrap();

    let env = start(
        vec![service("svc1", "^/api/", "off")],
        Some(dir.path()),
    )
    .await;

    // Unmatched path falls back to the static root.
    let resp = env.http.get(env.url("/index.html")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "<html>static</html>");

    // Traversal attempts get a 400 before touching the filesystem. Sent
    // raw because HTTP clients normalize dot segments away.
    let mut stream = tokio::net::TcpStream::connect(env.proxy_addr).await.unwrap();
    stream
        .write_all(b"GET /../secret.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let response = String::from_utf8_lossy(&raw);
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
}

#[tokio::test]
async fn no_match_and_no_static_root_is_a_404() {
    let env = start(vec![service("svc1", "^/api/", "off")], None).await;
    let resp = env.http.get(env.url("/elsewhere")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn malformed_credentials_are_challenged_not_erred() {
    let env = start(vec![service("svc1", "^/", "on")], None).await;

    for bad in ["", "LSAT :", "LSAT", "Bearer whatever", "LSAT a:b"] {
        let resp = env
            .http
            .get(env.url("/foo"))
            .header("Authorization", bad)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 402, "for header {bad:?}");
        let challenge = resp.headers().get("www-authenticate").unwrap();
        assert!(!challenge.to_str().unwrap().is_empty());
    }
}

#[tokio::test]
async fn correct_macaroon_with_wrong_preimage_is_challenged() {
    let env = start(vec![service("svc1", "^/", "on")], None).await;

    let resp = env.http.get(env.url("/foo")).send().await.unwrap();
    let challenge = resp
        .headers()
        .get("www-authenticate")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let (macaroon_b64, _) = wire::parse_www_authenticate(&challenge).unwrap();

    let macaroon = Macaroon::deserialize(&macaroon_b64).unwrap();
    let id = TokenId::decode(macaroon.identifier()).unwrap();
    env.lightning.settle(id.payment_hash).await;

    // Paid, but presenting the wrong preimage.
    let resp = env
        .http
        .get(env.url("/foo"))
        .header(
            "Authorization",
            format!("LSAT {macaroon_b64}:{}", hex::encode([0u8; 32])),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 402);
}

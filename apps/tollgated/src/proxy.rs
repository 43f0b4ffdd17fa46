//! Request routing and backend dispatch.
//!
//! Services are matched in declared order against the `Host` header and
//! URL path; the first match wins. Matched requests pass through the
//! authenticator, get the service's header overrides applied, and are
//! streamed to the backend. Unmatched requests fall through to the
//! static file root when one is configured.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use axum::http::{Method, Request, Response, StatusCode, Uri, header};
use regex::Regex;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use tollgate_lsat::wire;
use tollgate_mint::Mint;

use crate::auth::{Authenticator, Decision};
use crate::config::{AuthLevel, Config, Protocol, ServiceConfig};
use crate::freebie::FreebieStore;

/// Headers that describe the connection rather than the message; never
/// forwarded in either direction (RFC 7230 §6.1).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub struct ProxyService {
    pub name: String,
    pub auth: AuthLevel,
    pub freebies: Option<FreebieStore>,
    host_re: Option<Regex>,
    path_re: Option<Regex>,
    backend_base: String,
    client: reqwest::Client,
    header_overrides: Vec<(HeaderName, HeaderValue)>,
}

impl ProxyService {
    pub fn from_config(cfg: &ServiceConfig) -> anyhow::Result<Self> {
        let host_re = cfg
            .host_regexp
            .as_deref()
            .map(Regex::new)
            .transpose()
            .with_context(|| format!("service {}: host regexp", cfg.name))?;
        let path_re = cfg
            .path_regexp
            .as_deref()
            .map(Regex::new)
            .transpose()
            .with_context(|| format!("service {}: path regexp", cfg.name))?;

        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .use_rustls_tls();
        let backend_base = match cfg.protocol {
            Protocol::Http => format!("http://{}", cfg.address),
            Protocol::Https => {
                if let Some(path) = &cfg.tls_cert_path {
                    // Pin the configured certificate; system roots are
                    // deliberately not consulted for this backend.
                    let pem = std::fs::read(path).with_context(|| {
                        format!("service {}: read {}", cfg.name, path.display())
                    })?;
                    let cert = reqwest::Certificate::from_pem(&pem)
                        .with_context(|| format!("service {}: parse backend cert", cfg.name))?;
                    builder = builder
                        .tls_built_in_root_certs(false)
                        .add_root_certificate(cert);
                }
                format!("https://{}", cfg.address)
            }
        };
        let client = builder
            .build()
            .with_context(|| format!("service {}: build backend client", cfg.name))?;

        let header_overrides = cfg
            .headers
            .iter()
            .map(|(name, value)| {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .with_context(|| format!("service {}: header name {name:?}", cfg.name))?;
                let value = HeaderValue::from_str(value)
                    .with_context(|| format!("service {}: header value for {name}", cfg.name))?;
                Ok((name, value))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let freebies = match cfg.auth {
            AuthLevel::Freebie(count) => Some(FreebieStore::new(count)),
            _ => None,
        };

        Ok(Self {
            name: cfg.name.clone(),
            auth: cfg.auth,
            freebies,
            host_re,
            path_re,
            backend_base,
            client,
            header_overrides,
        })
    }

    fn matches(&self, host: &str, path: &str) -> bool {
        if let Some(re) = &self.host_re
            && !re.is_match(host)
        {
            return false;
        }
        if let Some(re) = &self.path_re
            && !re.is_match(path)
        {
            return false;
        }
        true
    }
}

pub struct Proxy {
    services: Vec<ProxyService>,
    authenticator: Authenticator,
    static_files: Option<StaticFiles>,
}

impl Proxy {
    pub fn new(cfg: &Config, mint: Arc<Mint>) -> anyhow::Result<Self> {
        let services = cfg
            .services
            .iter()
            .map(ProxyService::from_config)
            .collect::<anyhow::Result<Vec<_>>>()?;
        let static_files = cfg
            .static_files
            .as_ref()
            .filter(|s| s.serve)
            .map(|s| StaticFiles {
                root: s.root.clone(),
            });
        Ok(Self {
            services,
            authenticator: Authenticator::new(mint),
            static_files,
        })
    }

    pub fn router(self) -> Router {
        Router::new()
            .fallback(handle)
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::new(self))
    }
}

async fn handle(
    State(proxy): State<Arc<Proxy>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response<Body> {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(host_without_port)
        .unwrap_or("");
    let path = req.uri().path().to_string();

    let Some(service) = proxy.services.iter().find(|s| s.matches(host, &path)) else {
        if let Some(static_files) = &proxy.static_files {
            return static_files.serve(req.method(), req.uri()).await;
        }
        debug!(host, path, "no service matched");
        return empty_status(StatusCode::NOT_FOUND);
    };

    match proxy
        .authenticator
        .accept(req.headers(), remote.ip(), service)
        .await
    {
        Ok(Decision::Allow) => {}
        Ok(Decision::Challenge { macaroon, invoice }) => {
            return challenge_response(&macaroon, &invoice);
        }
        Err(e) => {
            warn!(service = %service.name, error = %e, "cannot mint challenge");
            return retry_later();
        }
    }

    forward(service, req).await
}

async fn forward(service: &ProxyService, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", service.backend_base, path_and_query);

    let mut headers = strip_hop_by_hop(&parts.headers);
    // The backend sees its own address as Host, and bodies are re-framed
    // as they are streamed through.
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    for (name, value) in &service.header_overrides {
        headers.insert(name.clone(), value.clone());
    }

    let upstream = service
        .client
        .request(parts.method, url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await;
    let upstream = match upstream {
        Ok(resp) => resp,
        Err(e) => {
            warn!(service = %service.name, error = %e, "backend dispatch failed");
            return empty_status(StatusCode::BAD_GATEWAY);
        }
    };

    let status = upstream.status();
    let mut headers = strip_hop_by_hop(upstream.headers());
    headers.remove(header::CONTENT_LENGTH);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn challenge_response(macaroon_b64: &str, invoice: &str) -> Response<Body> {
    let value = wire::format_www_authenticate(macaroon_b64, invoice);
    Response::builder()
        .status(StatusCode::PAYMENT_REQUIRED)
        .header(header::WWW_AUTHENTICATE, value)
        .body(Body::empty())
        .unwrap_or_else(|_| empty_status(StatusCode::PAYMENT_REQUIRED))
}

fn retry_later() -> Response<Body> {
    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header(RETRY_AFTER, "10")
        .body(Body::empty())
        .unwrap_or_else(|_| empty_status(StatusCode::SERVICE_UNAVAILABLE))
}

fn empty_status(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

fn host_without_port(host: &str) -> &str {
    if host.starts_with('[') {
        // Bracketed IPv6 literal, with or without a port.
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Copies `headers` minus the fixed hop-by-hop set and anything named by
/// a `Connection` header.
fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let connection_named: HashSet<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();

    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) || connection_named.contains(lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    async fn serve(&self, method: &Method, uri: &Uri) -> Response<Body> {
        if method != Method::GET && method != Method::HEAD {
            return empty_status(StatusCode::METHOD_NOT_ALLOWED);
        }

        let Ok(decoded) = percent_encoding::percent_decode_str(uri.path()).decode_utf8() else {
            return empty_status(StatusCode::BAD_REQUEST);
        };

        let mut rel = PathBuf::new();
        for segment in decoded.split('/') {
            if segment.is_empty() || segment == "." {
                continue;
            }
            if segment == ".." || segment.contains('\\') {
                return empty_status(StatusCode::BAD_REQUEST);
            }
            rel.push(segment);
        }
        let mut path = self.root.join(rel);
        if decoded.ends_with('/') || decoded == "" || path == self.root {
            path.push("index.html");
        }

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "static read failed");
                return empty_status(StatusCode::NOT_FOUND);
            }
        };

        let content_type = content_type_for(&path);
        let body = if method == Method::HEAD {
            Body::empty()
        } else {
            Body::from(bytes)
        };
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .body(body)
            .unwrap_or_else(|_| empty_status(StatusCode::INTERNAL_SERVER_ERROR))
    }
}

fn content_type_for(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain; charset=utf-8",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, host_re: Option<&str>, path_re: Option<&str>) -> ProxyService {
        ProxyService::from_config(&ServiceConfig {
            name: name.to_string(),
            address: "127.0.0.1:19999".to_string(),
            protocol: Protocol::Http,
            tls_cert_path: None,
            host_regexp: host_re.map(str::to_string),
            path_regexp: path_re.map(str::to_string),
            auth: AuthLevel::Off,
            headers: Default::default(),
            price_msat: 0,
            capabilities: Vec::new(),
            constraints: Vec::new(),
        })
        .unwrap()
    }

    #[test]
    fn matching_requires_both_present_regexes() {
        let svc = service("svc", Some("^api\\."), Some("^/v1/"));
        assert!(svc.matches("api.example.com", "/v1/users"));
        assert!(!svc.matches("www.example.com", "/v1/users"));
        assert!(!svc.matches("api.example.com", "/v2/users"));
    }

    #[test]
    fn absent_regex_matches_everything() {
        let svc = service("svc", None, Some("^/only$"));
        assert!(svc.matches("anything", "/only"));
        assert!(!svc.matches("anything", "/other"));
    }

    #[test]
    fn host_port_is_ignored_for_matching() {
        assert_eq!(host_without_port("api.example.com:8443"), "api.example.com");
        assert_eq!(host_without_port("api.example.com"), "api.example.com");
        assert_eq!(host_without_port("[::1]:8080"), "[::1]");
        assert_eq!(host_without_port("[::1]"), "[::1]");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "close, x-drop-me".parse().unwrap());
        headers.insert("keep-alive", "timeout=5".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("upgrade", "h2c".parse().unwrap());
        headers.insert("x-drop-me", "1".parse().unwrap());
        headers.insert("x-keep-me", "2".parse().unwrap());
        headers.insert(header::AUTHORIZATION, "LSAT a:b".parse().unwrap());

        let out = strip_hop_by_hop(&headers);
        assert!(out.get("x-keep-me").is_some());
        assert!(out.get(header::AUTHORIZATION).is_some());
        assert!(out.get(header::CONNECTION).is_none());
        assert!(out.get("keep-alive").is_none());
        assert!(out.get("transfer-encoding").is_none());
        assert!(out.get("upgrade").is_none());
        // Named by the Connection header, so dropped too.
        assert!(out.get("x-drop-me").is_none());
    }

    #[tokio::test]
    async fn static_files_reject_traversal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html>hi</html>").unwrap();
        let files = StaticFiles {
            root: dir.path().to_path_buf(),
        };

        let ok = files
            .serve(&Method::GET, &Uri::from_static("/index.html"))
            .await;
        assert_eq!(ok.status(), StatusCode::OK);

        let root = files.serve(&Method::GET, &Uri::from_static("/")).await;
        assert_eq!(root.status(), StatusCode::OK);

        let missing = files
            .serve(&Method::GET, &Uri::from_static("/nope.html"))
            .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        for bad in ["/../etc/passwd", "/a/../../etc/passwd", "/%2e%2e/secret"] {
            let resp = files
                .serve(&Method::GET, &Uri::try_from(bad).unwrap())
                .await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{bad}");
        }

        let post = files
            .serve(&Method::POST, &Uri::from_static("/index.html"))
            .await;
        assert_eq!(post.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn content_types_cover_common_web_files() {
        assert_eq!(
            content_type_for(std::path::Path::new("a/index.html")),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            content_type_for(std::path::Path::new("a/data.bin")),
            "application/octet-stream"
        );
    }
}

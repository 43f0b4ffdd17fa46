//! YAML configuration for the daemon.
//!
//! Loading validates everything up front: regexes compile, auth levels
//! parse, TLS material is named when required, and `!file` header
//! directives are resolved to their encoded file contents. After a
//! successful load the service table never changes again.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context as _;
use serde::Deserialize;

use tollgate_lsat::Caveat;
use tollgate_mint::ServiceTerms;

const FILE_PREFIX: &str = "!file";
const FILE_PREFIX_HEX: &str = "!file+hex";
const FILE_PREFIX_BASE64: &str = "!file+base64";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the public listener binds to.
    pub listen_addr: SocketAddr,

    /// Serve cleartext (with HTTP/2 prior knowledge) instead of TLS.
    #[serde(default)]
    pub insecure: bool,

    pub tls_cert_file: Option<PathBuf>,
    pub tls_key_file: Option<PathBuf>,

    /// Root directory for persisted state (secrets, onion keys).
    pub data_dir: PathBuf,

    pub lightning: LightningConfig,

    pub tor: Option<TorConfig>,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    #[serde(rename = "static")]
    pub static_files: Option<StaticConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LightningBackend {
    /// In-process backend that settles on demand. Tests and demos only.
    Fake,
    /// lnd over its REST interface.
    Lnd,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LightningConfig {
    pub backend: LightningBackend,
    /// REST base URL, e.g. `https://127.0.0.1:8080`.
    pub address: Option<String>,
    pub tls_cert_path: Option<PathBuf>,
    pub macaroon_path: Option<PathBuf>,
    /// Fake backend only: settle every invoice at creation.
    #[serde(default)]
    pub auto_settle: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TorConfig {
    /// Control port address, e.g. `127.0.0.1:9051`.
    pub control: String,
    /// Port the onion service advertises.
    pub virtual_port: u16,
    /// Local port the cleartext Tor-side listener binds to.
    pub listen_port: u16,
    #[serde(default)]
    pub v2: bool,
    #[serde(default)]
    pub v3: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Http,
    Https,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,

    /// Backend host:port.
    pub address: String,

    pub protocol: Protocol,

    /// Pin the backend's certificate instead of consulting system roots.
    pub tls_cert_path: Option<PathBuf>,

    pub host_regexp: Option<String>,
    pub path_regexp: Option<String>,

    pub auth: AuthLevel,

    /// Headers always presented to the backend, overwriting client
    /// headers of the same name. Values may use `!file+hex:<path>` or
    /// `!file+base64:<path>` to materialize file contents at startup.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub price_msat: u64,

    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Extra caveats minted into tokens, as `condition=value` entries.
    /// `valid_until` values are lifetimes in seconds.
    #[serde(default)]
    pub constraints: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticConfig {
    #[serde(default)]
    pub serve: bool,
    pub root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthLevel {
    Off,
    On,
    Freebie(u32),
}

impl AuthLevel {
    pub fn is_freebie(self) -> bool {
        matches!(self, AuthLevel::Freebie(_))
    }
}

impl FromStr for AuthLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("off") {
            return Ok(AuthLevel::Off);
        }
        if s.eq_ignore_ascii_case("on") {
            return Ok(AuthLevel::On);
        }
        if let Some(count) = s
            .strip_prefix("freebie")
            .or_else(|| s.strip_prefix("Freebie"))
        {
            let count: u32 = count
                .trim()
                .parse()
                .with_context(|| format!("invalid freebie count in {s:?}"))?;
            if count == 0 {
                anyhow::bail!("freebie count must be at least 1");
            }
            return Ok(AuthLevel::Freebie(count));
        }
        anyhow::bail!("invalid auth level {s:?}, expected 'on', 'off' or 'freebie N'")
    }
}

impl<'de> Deserialize<'de> for AuthLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        let mut cfg: Config = serde_yaml::from_str(&raw).context("parse config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks cross-field invariants and resolves header directives.
    pub fn validate(&mut self) -> anyhow::Result<()> {
        if !self.insecure && (self.tls_cert_file.is_none() || self.tls_key_file.is_none()) {
            anyhow::bail!("tls_cert_file and tls_key_file are required unless insecure is set");
        }

        if self.lightning.backend == LightningBackend::Lnd {
            for (field, present) in [
                ("lightning.address", self.lightning.address.is_some()),
                ("lightning.tls_cert_path", self.lightning.tls_cert_path.is_some()),
                ("lightning.macaroon_path", self.lightning.macaroon_path.is_some()),
            ] {
                if !present {
                    anyhow::bail!("{field} is required for the lnd backend");
                }
            }
        }

        for service in &mut self.services {
            if service.name.is_empty() {
                anyhow::bail!("service with empty name");
            }
            if service.host_regexp.is_none() && service.path_regexp.is_none() {
                anyhow::bail!(
                    "service {}: at least one of host_regexp/path_regexp is required",
                    service.name
                );
            }
            for re in [&service.host_regexp, &service.path_regexp]
                .into_iter()
                .flatten()
            {
                regex::Regex::new(re)
                    .with_context(|| format!("service {}: bad regexp {re:?}", service.name))?;
            }
            for constraint in &service.constraints {
                Caveat::parse(constraint).map_err(|e| {
                    anyhow::anyhow!("service {}: bad constraint: {e}", service.name)
                })?;
            }
            resolve_headers(&mut service.headers)
                .with_context(|| format!("service {}: resolve headers", service.name))?;
        }

        Ok(())
    }
}

impl ServiceConfig {
    /// The mint-relevant slice of this service.
    pub fn terms(&self) -> anyhow::Result<ServiceTerms> {
        let constraints = self
            .constraints
            .iter()
            .map(|c| Caveat::parse(c))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("service {}: bad constraint: {e}", self.name))?;
        Ok(ServiceTerms {
            name: self.name.clone(),
            price_msat: self.price_msat,
            capabilities: self.capabilities.clone(),
            constraints,
        })
    }
}

/// Replaces `!file+hex:<path>` / `!file+base64:<path>` header values with
/// the encoded file contents. Files are read exactly once, here; resolved
/// values no longer carry the prefix, so resolution is idempotent.
pub fn resolve_headers(headers: &mut HashMap<String, String>) -> anyhow::Result<()> {
    use base64::Engine as _;

    for value in headers.values_mut() {
        if !value.starts_with(FILE_PREFIX) {
            continue;
        }
        // Exactly one colon: prefix and path, nothing else.
        let parts: Vec<&str> = value.split(':').collect();
        let (prefix, file_name) = match parts.as_slice() {
            [prefix, file_name] => (*prefix, *file_name),
            _ => anyhow::bail!("invalid header directive, must be '!file+hex:path'"),
        };
        let bytes = std::fs::read(file_name)
            .with_context(|| format!("read header file {file_name}"))?;
        let encoded = match prefix {
            FILE_PREFIX_HEX => hex::encode(bytes),
            FILE_PREFIX_BASE64 => base64::engine::general_purpose::STANDARD.encode(bytes),
            other => anyhow::bail!("unsupported file directive {other:?}"),
        };
        *value = encoded;
    }
    Ok(())
}

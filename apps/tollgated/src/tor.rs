//! Onion service glue.
//!
//! The proxy owns three pieces here: the [`TorController`] seam, keeping
//! onion private keys in the KV store so the same address survives
//! restarts, and publishing one onion service per enabled version.
//! [`ControlPortController`] is the stock controller — a minimal client
//! for the two control-port commands the daemon needs; deployments whose
//! control port requires cookie or password authentication substitute
//! their own implementation behind the trait.
//!
//! Onion traffic terminates at the local cleartext listener and passes
//! through the same authenticator as everything else; there is no
//! authentication bypass for requests arriving over Tor.

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::info;

use tollgate_mint::{KvError, KvStore};

use crate::config::TorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnionVersion {
    V2,
    V3,
}

impl OnionVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            OnionVersion::V2 => "v2",
            OnionVersion::V3 => "v3",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OnionServiceConfig {
    pub version: OnionVersion,
    pub virtual_port: u16,
    pub target_ports: Vec<u16>,
    /// Reuse this private key instead of generating a fresh identity.
    pub private_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct AddOnionResult {
    pub onion_address: String,
    /// Present when the controller generated a fresh key.
    pub private_key: Option<Vec<u8>>,
}

#[async_trait]
pub trait TorController: Send + Sync {
    async fn add_onion(&self, cfg: OnionServiceConfig) -> anyhow::Result<AddOnionResult>;
}

/// Control-port client speaking the two commands the proxy needs:
/// `AUTHENTICATE` (null method only) and `ADD_ONION`.
///
/// The connection is held open for the controller's lifetime; Tor tears
/// onion services down when it closes, so their lifetime tracks the
/// daemon's.
pub struct ControlPortController {
    conn: Mutex<BufStream<TcpStream>>,
}

impl ControlPortController {
    pub async fn connect(control_addr: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(control_addr)
            .await
            .with_context(|| format!("connect tor control port {control_addr}"))?;
        let controller = Self {
            conn: Mutex::new(BufStream::new(stream)),
        };
        controller
            .send_command("AUTHENTICATE")
            .await
            .context("authenticate to tor")?;
        Ok(controller)
    }

    /// Sends one command and collects the `250` reply lines, minus their
    /// status prefix. Any other status code fails the command.
    async fn send_command(&self, command: &str) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn.lock().await;
        conn.write_all(command.as_bytes()).await?;
        conn.write_all(b"\r\n").await?;
        conn.flush().await?;

        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = conn.read_line(&mut line).await?;
            if n == 0 {
                anyhow::bail!("control connection closed mid-reply");
            }
            let line = line.trim_end();
            if line.len() < 4 {
                anyhow::bail!("short control reply: {line:?}");
            }
            let (code, rest) = line.split_at(3);
            if code != "250" {
                anyhow::bail!("control command failed: {line}");
            }
            lines.push(rest[1..].to_string());
            // A space after the status code marks the final line.
            if rest.starts_with(' ') {
                return Ok(lines);
            }
        }
    }
}

#[async_trait]
impl TorController for ControlPortController {
    async fn add_onion(&self, cfg: OnionServiceConfig) -> anyhow::Result<AddOnionResult> {
        let key_spec = match &cfg.private_key {
            Some(blob) => String::from_utf8(blob.clone())
                .context("stored onion key is not a control-port key blob")?,
            None => match cfg.version {
                OnionVersion::V2 => "NEW:RSA1024".to_string(),
                OnionVersion::V3 => "NEW:ED25519-V3".to_string(),
            },
        };

        let mut command = format!("ADD_ONION {key_spec}");
        for target in &cfg.target_ports {
            command.push_str(&format!(" Port={},127.0.0.1:{target}", cfg.virtual_port));
        }

        let lines = self.send_command(&command).await?;
        parse_add_onion_reply(&lines)
    }
}

fn parse_add_onion_reply(lines: &[String]) -> anyhow::Result<AddOnionResult> {
    let mut onion_address = None;
    let mut private_key = None;
    for line in lines {
        if let Some(id) = line.strip_prefix("ServiceID=") {
            onion_address = Some(format!("{id}.onion"));
        } else if let Some(key) = line.strip_prefix("PrivateKey=") {
            private_key = Some(key.as_bytes().to_vec());
        }
    }
    Ok(AddOnionResult {
        onion_address: onion_address.context("ADD_ONION reply missing ServiceID")?,
        private_key,
    })
}

/// Persists onion private keys under
/// `lsat/proxy/onion/<version>/private_key`.
pub struct OnionStore<S> {
    kv: S,
}

impl<S: KvStore> OnionStore<S> {
    pub fn new(kv: S) -> Self {
        Self { kv }
    }

    fn key_for(version: OnionVersion) -> String {
        format!("lsat/proxy/onion/{}/private_key", version.as_str())
    }

    pub async fn private_key(&self, version: OnionVersion) -> anyhow::Result<Option<Vec<u8>>> {
        match self.kv.get(&Self::key_for(version)).await {
            Ok(key) => Ok(Some(key)),
            Err(KvError::NotFound) => Ok(None),
            Err(e) => Err(anyhow::Error::from(e).context("load onion key")),
        }
    }

    pub async fn store_private_key(
        &self,
        version: OnionVersion,
        key: &[u8],
    ) -> anyhow::Result<()> {
        self.kv
            .put(&Self::key_for(version), key)
            .await
            .context("store onion key")
    }
}

/// Publishes one onion service per version enabled in the config,
/// reusing persisted keys, and returns the onion addresses.
pub async fn publish_onion_services<S: KvStore>(
    controller: &dyn TorController,
    store: &OnionStore<S>,
    cfg: &TorConfig,
) -> anyhow::Result<Vec<String>> {
    let mut versions = Vec::new();
    if cfg.v2 {
        versions.push(OnionVersion::V2);
    }
    if cfg.v3 {
        versions.push(OnionVersion::V3);
    }

    let mut addresses = Vec::new();
    for version in versions {
        let private_key = store.private_key(version).await?;
        let result = controller
            .add_onion(OnionServiceConfig {
                version,
                virtual_port: cfg.virtual_port,
                target_ports: vec![cfg.listen_port],
                private_key,
            })
            .await
            .with_context(|| format!("publish {} onion service", version.as_str()))?;

        if let Some(key) = &result.private_key {
            store.store_private_key(version, key).await?;
        }
        info!(address = %result.onion_address, version = version.as_str(), "onion service up");
        addresses.push(result.onion_address);
    }
    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tollgate_mint::MemKvStore;

    struct RecordingController {
        seen_keys: Arc<Mutex<Vec<Option<Vec<u8>>>>>,
    }

    #[async_trait]
    impl TorController for RecordingController {
        async fn add_onion(&self, cfg: OnionServiceConfig) -> anyhow::Result<AddOnionResult> {
            let fresh = cfg.private_key.is_none();
            self.seen_keys.lock().await.push(cfg.private_key);
            Ok(AddOnionResult {
                onion_address: format!("{}abcdef.onion", cfg.version.as_str()),
                private_key: fresh.then(|| b"generated-key".to_vec()),
            })
        }
    }

    fn tor_config() -> TorConfig {
        TorConfig {
            control: "127.0.0.1:9051".to_string(),
            virtual_port: 443,
            listen_port: 12345,
            v2: false,
            v3: true,
        }
    }

    #[tokio::test]
    async fn generated_keys_are_persisted_and_reused() {
        let store = OnionStore::new(MemKvStore::new());
        let seen_keys = Arc::new(Mutex::new(Vec::new()));
        let controller = RecordingController {
            seen_keys: Arc::clone(&seen_keys),
        };
        let cfg = tor_config();

        let first = publish_onion_services(&controller, &store, &cfg)
            .await
            .unwrap();
        assert_eq!(first, vec!["v3abcdef.onion".to_string()]);

        // Key persisted under the layout path.
        assert_eq!(
            store.private_key(OnionVersion::V3).await.unwrap().unwrap(),
            b"generated-key"
        );

        // Second publication hands the stored key back to the controller.
        publish_onion_services(&controller, &store, &cfg)
            .await
            .unwrap();
        let seen = seen_keys.lock().await;
        assert_eq!(seen[0], None);
        assert_eq!(seen[1].as_deref(), Some(b"generated-key".as_slice()));
    }

    #[test]
    fn add_onion_reply_parsing() {
        let lines = vec![
            "ServiceID=abcdef123456".to_string(),
            "PrivateKey=ED25519-V3:secretblob".to_string(),
            "OK".to_string(),
        ];
        let result = parse_add_onion_reply(&lines).unwrap();
        assert_eq!(result.onion_address, "abcdef123456.onion");
        assert_eq!(
            result.private_key.as_deref(),
            Some(b"ED25519-V3:secretblob".as_slice())
        );

        // Reusing a key: Tor omits the PrivateKey line.
        let lines = vec!["ServiceID=abcdef123456".to_string(), "OK".to_string()];
        let result = parse_add_onion_reply(&lines).unwrap();
        assert!(result.private_key.is_none());

        assert!(parse_add_onion_reply(&["OK".to_string()]).is_err());
    }

    #[tokio::test]
    async fn control_port_publishes_an_onion_service() {
        use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufStream::new(stream);

            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap();
            assert_eq!(line.trim_end(), "AUTHENTICATE");
            stream.write_all(b"250 OK\r\n").await.unwrap();
            stream.flush().await.unwrap();

            line.clear();
            stream.read_line(&mut line).await.unwrap();
            assert_eq!(
                line.trim_end(),
                "ADD_ONION NEW:ED25519-V3 Port=443,127.0.0.1:12345"
            );
            stream
                .write_all(
                    b"250-ServiceID=abcdef123456\r\n250-PrivateKey=ED25519-V3:blob\r\n250 OK\r\n",
                )
                .await
                .unwrap();
            stream.flush().await.unwrap();
        });

        let controller = ControlPortController::connect(&addr.to_string()).await.unwrap();
        let result = controller
            .add_onion(OnionServiceConfig {
                version: OnionVersion::V3,
                virtual_port: 443,
                target_ports: vec![12345],
                private_key: None,
            })
            .await
            .unwrap();
        assert_eq!(result.onion_address, "abcdef123456.onion");
        assert_eq!(result.private_key.as_deref(), Some(b"ED25519-V3:blob".as_slice()));
    }

    #[tokio::test]
    async fn both_versions_publish_when_enabled() {
        let store = OnionStore::new(MemKvStore::new());
        let controller = RecordingController {
            seen_keys: Arc::new(Mutex::new(Vec::new())),
        };
        let mut cfg = tor_config();
        cfg.v2 = true;

        let addresses = publish_onion_services(&controller, &store, &cfg)
            .await
            .unwrap();
        assert_eq!(addresses.len(), 2);
    }
}

//! Root secret storage.
//!
//! Every minted token gets a fresh 32-byte root secret, indexed by its
//! identifier. Deleting the secret revokes the token: verification can
//! no longer rebuild the signature chain.

use std::collections::HashMap;

use async_trait::async_trait;
use rand::RngCore as _;
use thiserror::Error;
use tokio::sync::Mutex;

use tollgate_lsat::TokenId;

use crate::kv::{KvError, KvStore};

pub const SECRET_LEN: usize = 32;

/// Key prefix shared with the rest of the persisted layout.
const SECRET_KEY_PREFIX: &str = "lsat/proxy/secrets";

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("secret already exists for this token")]
    AlreadyExists,
    #[error("no secret for this token")]
    NotFound,
    #[error("secret store: {0}")]
    Store(String),
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Creates and persists a fresh random root secret for `id`.
    async fn new_secret(&self, id: &TokenId) -> Result<[u8; SECRET_LEN], SecretsError>;
    async fn get_secret(&self, id: &TokenId) -> Result<[u8; SECRET_LEN], SecretsError>;
    /// Idempotent: revoking an unknown token succeeds.
    async fn revoke_secret(&self, id: &TokenId) -> Result<(), SecretsError>;
}

fn fresh_secret() -> [u8; SECRET_LEN] {
    let mut secret = [0u8; SECRET_LEN];
    rand::rng().fill_bytes(&mut secret);
    secret
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemSecretStore {
    inner: Mutex<HashMap<TokenId, [u8; SECRET_LEN]>>,
}

impl MemSecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemSecretStore {
    async fn new_secret(&self, id: &TokenId) -> Result<[u8; SECRET_LEN], SecretsError> {
        let mut inner = self.inner.lock().await;
        if inner.contains_key(id) {
            return Err(SecretsError::AlreadyExists);
        }
        let secret = fresh_secret();
        inner.insert(*id, secret);
        Ok(secret)
    }

    async fn get_secret(&self, id: &TokenId) -> Result<[u8; SECRET_LEN], SecretsError> {
        self.inner
            .lock()
            .await
            .get(id)
            .copied()
            .ok_or(SecretsError::NotFound)
    }

    async fn revoke_secret(&self, id: &TokenId) -> Result<(), SecretsError> {
        self.inner.lock().await.remove(id);
        Ok(())
    }
}

/// Secret store persisted through the KV SPI under
/// `lsat/proxy/secrets/<token-id-hex>`.
pub struct KvSecretStore<S> {
    kv: S,
}

impl<S: KvStore> KvSecretStore<S> {
    pub fn new(kv: S) -> Self {
        Self { kv }
    }

    fn key_for(id: &TokenId) -> String {
        format!("{SECRET_KEY_PREFIX}/{}", id.to_hex())
    }
}

#[async_trait]
impl<S: KvStore> SecretStore for KvSecretStore<S> {
    async fn new_secret(&self, id: &TokenId) -> Result<[u8; SECRET_LEN], SecretsError> {
        let secret = fresh_secret();
        match self.kv.put_if_absent(&Self::key_for(id), &secret).await {
            Ok(()) => Ok(secret),
            Err(KvError::AlreadyExists) => Err(SecretsError::AlreadyExists),
            Err(e) => Err(SecretsError::Store(e.to_string())),
        }
    }

    async fn get_secret(&self, id: &TokenId) -> Result<[u8; SECRET_LEN], SecretsError> {
        let raw = match self.kv.get(&Self::key_for(id)).await {
            Ok(raw) => raw,
            Err(KvError::NotFound) => return Err(SecretsError::NotFound),
            Err(e) => return Err(SecretsError::Store(e.to_string())),
        };
        let secret: [u8; SECRET_LEN] = raw
            .try_into()
            .map_err(|_| SecretsError::Store("persisted secret has wrong length".to_string()))?;
        Ok(secret)
    }

    async fn revoke_secret(&self, id: &TokenId) -> Result<(), SecretsError> {
        match self.kv.delete(&Self::key_for(id)).await {
            Ok(()) | Err(KvError::NotFound) => Ok(()),
            Err(e) => Err(SecretsError::Store(e.to_string())),
        }
    }
}

//! Token identifier layout.
//!
//! The identifier is the public half of an LSAT: it rides inside the
//! macaroon and names the invoice (payment hash) the token is bound to.
//! The root secret it indexes stays with the mint.

use rand::RngCore as _;

use crate::{LsatError, PAYMENT_HASH_LEN};

/// Identifier version understood by this implementation.
pub const LATEST_VERSION: u16 = 0;

/// Serialized length: version (2) || payment hash (32) || user id (32).
pub const TOKEN_ID_LEN: usize = 2 + PAYMENT_HASH_LEN + 32;

/// The opaque identifier baked into every minted macaroon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenId {
    pub version: u16,
    pub payment_hash: [u8; PAYMENT_HASH_LEN],
    /// Random per-token blob so two tokens for the same invoice never
    /// share an identifier.
    pub user_id: [u8; 32],
}

impl TokenId {
    /// Creates a fresh identifier for the given payment hash.
    pub fn new(payment_hash: [u8; PAYMENT_HASH_LEN]) -> Self {
        let mut user_id = [0u8; 32];
        rand::rng().fill_bytes(&mut user_id);
        Self {
            version: LATEST_VERSION,
            payment_hash,
            user_id,
        }
    }

    pub fn encode(&self) -> [u8; TOKEN_ID_LEN] {
        let mut out = [0u8; TOKEN_ID_LEN];
        out[0..2].copy_from_slice(&self.version.to_be_bytes());
        out[2..2 + PAYMENT_HASH_LEN].copy_from_slice(&self.payment_hash);
        out[2 + PAYMENT_HASH_LEN..].copy_from_slice(&self.user_id);
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self, LsatError> {
        if raw.len() != TOKEN_ID_LEN {
            return Err(LsatError::InvalidTokenId(format!(
                "must be {TOKEN_ID_LEN} bytes, got {}",
                raw.len()
            )));
        }
        let version = u16::from_be_bytes([raw[0], raw[1]]);
        if version != LATEST_VERSION {
            return Err(LsatError::InvalidTokenId(format!(
                "unknown version {version}"
            )));
        }
        let mut payment_hash = [0u8; PAYMENT_HASH_LEN];
        payment_hash.copy_from_slice(&raw[2..2 + PAYMENT_HASH_LEN]);
        let mut user_id = [0u8; 32];
        user_id.copy_from_slice(&raw[2 + PAYMENT_HASH_LEN..]);
        Ok(Self {
            version,
            payment_hash,
            user_id,
        })
    }

    /// Hex form used as the persistence key for the root secret.
    pub fn to_hex(&self) -> String {
        hex::encode(self.encode())
    }
}

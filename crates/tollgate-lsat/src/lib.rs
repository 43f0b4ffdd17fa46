//! LSAT (Lightning Service Authentication Token) primitives.
//!
//! An LSAT is a macaroon whose identifier embeds a Lightning payment hash.
//! Presenting the macaroon together with the matching 32-byte payment
//! preimage proves that the associated invoice was paid.
//!
//! This crate carries only the token primitives: the macaroon building
//! block, the token identifier layout, caveat encoding and checking, and
//! the HTTP wire codecs. Minting and verification policy live in
//! `tollgate-mint`; nothing here touches a Lightning node or a store.

use sha2::{Digest as _, Sha256};
use thiserror::Error;

pub mod caveat;
pub mod macaroon;
pub mod token;
pub mod wire;

pub use caveat::{Caveat, CaveatContext};
pub use macaroon::Macaroon;
pub use token::{TOKEN_ID_LEN, TokenId};

/// Length of a Lightning payment preimage in bytes.
pub const PREIMAGE_LEN: usize = 32;

/// Length of a payment hash (SHA-256 of the preimage) in bytes.
pub const PAYMENT_HASH_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum LsatError {
    #[error("invalid preimage: {0}")]
    InvalidPreimage(String),
    #[error("invalid token identifier: {0}")]
    InvalidTokenId(String),
    #[error("invalid macaroon: {0}")]
    InvalidMacaroon(String),
    #[error("invalid credentials header: {0}")]
    InvalidHeader(String),
}

/// Decodes a hex preimage, insisting on exactly 32 bytes.
pub fn preimage_from_hex(preimage_hex: &str) -> Result<[u8; PREIMAGE_LEN], LsatError> {
    let raw = hex::decode(preimage_hex.trim())
        .map_err(|e| LsatError::InvalidPreimage(format!("hex decode: {e}")))?;
    if raw.len() != PREIMAGE_LEN {
        return Err(LsatError::InvalidPreimage(format!(
            "must be {PREIMAGE_LEN} bytes, got {}",
            raw.len()
        )));
    }
    let mut out = [0u8; PREIMAGE_LEN];
    out.copy_from_slice(&raw);
    Ok(out)
}

/// SHA-256 of the preimage, i.e. the payment hash the invoice was issued
/// under.
pub fn payment_hash_for_preimage(preimage: &[u8; PREIMAGE_LEN]) -> [u8; PAYMENT_HASH_LEN] {
    let mut h = Sha256::new();
    h.update(preimage);
    h.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::Digest as _;

    #[test]
    fn preimage_round_trip() {
        let preimage = [7u8; 32];
        let parsed = preimage_from_hex(&hex::encode(preimage)).unwrap();
        assert_eq!(parsed, preimage);
    }

    #[test]
    fn preimage_rejects_wrong_length() {
        assert!(preimage_from_hex("dead").is_err());
        assert!(preimage_from_hex(&hex::encode([0u8; 33])).is_err());
    }

    #[test]
    fn preimage_rejects_non_hex() {
        assert!(preimage_from_hex("zz").is_err());
    }

    #[test]
    fn payment_hash_matches_sha256() {
        let preimage = [0x42u8; 32];
        let hash = payment_hash_for_preimage(&preimage);
        let expected = Sha256::digest(preimage);
        assert_eq!(hash.as_slice(), expected.as_slice());
    }
}

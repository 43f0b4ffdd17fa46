//! Minimal macaroon building block.
//!
//! A macaroon is an identifier plus a chain of first-party caveats,
//! authenticated by a rolling HMAC-SHA256: the root secret keys the HMAC
//! over the identifier, and each appended caveat re-keys the chain with
//! the previous signature. Holders can only ever *add* caveats; removing
//! or altering one breaks the chain.
//!
//! Everything else in the workspace treats this type as sealed: callers
//! mint, attenuate, serialize and verify through this API and never see
//! the chain itself.

use base64::Engine as _;
use hmac::{Hmac, Mac as _};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq as _;

use crate::LsatError;
use crate::caveat::Caveat;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Macaroon {
    identifier: Vec<u8>,
    caveats: Vec<Caveat>,
    signature: [u8; SIGNATURE_LEN],
}

/// On-the-wire shape. The serialized form is this structure as JSON,
/// wrapped in standard base64.
#[derive(Serialize, Deserialize)]
struct MacaroonRepr {
    id: String,
    caveats: Vec<String>,
    sig: String,
}

fn hmac_keyed(key: &[u8], data: &[u8]) -> [u8; SIGNATURE_LEN] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

impl Macaroon {
    /// Mints a bare macaroon over `identifier`, signed by `root_secret`.
    pub fn mint(root_secret: &[u8; 32], identifier: Vec<u8>) -> Self {
        let signature = hmac_keyed(root_secret, &identifier);
        Self {
            identifier,
            caveats: Vec::new(),
            signature,
        }
    }

    /// Appends a first-party caveat, extending the signature chain.
    pub fn add_caveat(&mut self, caveat: Caveat) {
        let encoded = caveat.to_string();
        self.signature = hmac_keyed(&self.signature, encoded.as_bytes());
        self.caveats.push(caveat);
    }

    /// Recomputes the chain from `root_secret` and compares in constant
    /// time.
    pub fn verify_signature(&self, root_secret: &[u8; 32]) -> bool {
        let mut sig = hmac_keyed(root_secret, &self.identifier);
        for caveat in &self.caveats {
            sig = hmac_keyed(&sig, caveat.to_string().as_bytes());
        }
        sig[..].ct_eq(&self.signature[..]).into()
    }

    pub fn identifier(&self) -> &[u8] {
        &self.identifier
    }

    pub fn caveats(&self) -> &[Caveat] {
        &self.caveats
    }

    pub fn serialize(&self) -> String {
        let repr = MacaroonRepr {
            id: hex::encode(&self.identifier),
            caveats: self.caveats.iter().map(|c| c.to_string()).collect(),
            sig: hex::encode(self.signature),
        };
        let json = serde_json::to_vec(&repr).expect("macaroon repr serializes");
        base64::engine::general_purpose::STANDARD.encode(json)
    }

    pub fn deserialize(b64: &str) -> Result<Self, LsatError> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(b64.trim())
            .map_err(|e| LsatError::InvalidMacaroon(format!("base64 decode: {e}")))?;
        let repr: MacaroonRepr = serde_json::from_slice(&raw)
            .map_err(|e| LsatError::InvalidMacaroon(format!("decode: {e}")))?;

        let identifier = hex::decode(&repr.id)
            .map_err(|e| LsatError::InvalidMacaroon(format!("identifier: {e}")))?;
        let sig_raw = hex::decode(&repr.sig)
            .map_err(|e| LsatError::InvalidMacaroon(format!("signature: {e}")))?;
        if sig_raw.len() != SIGNATURE_LEN {
            return Err(LsatError::InvalidMacaroon(format!(
                "signature must be {SIGNATURE_LEN} bytes, got {}",
                sig_raw.len()
            )));
        }
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&sig_raw);

        let caveats = repr
            .caveats
            .iter()
            .map(|c| Caveat::parse(c))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            identifier,
            caveats,
            signature,
        })
    }
}

//! Minting and verification of LSATs.
//!
//! The mint composes three collaborators: the [`SecretStore`] holding
//! per-token root secrets, the [`Challenger`] speaking to the Lightning
//! node, and the [`ServiceLimiter`] supplying per-service caveat policy.
//! Issuance binds a fresh macaroon to a fresh invoice; verification
//! re-derives the signature chain and confirms payment.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use tollgate_lsat::caveat::check_caveats;
use tollgate_lsat::{Macaroon, PREIMAGE_LEN, TokenId, payment_hash_for_preimage};

pub mod challenger;
pub mod fake;
pub mod kv;
pub mod limiter;
pub mod secrets;

pub use challenger::{Challenger, ChallengerError, Invoice, InvoiceState, LightningClient};
pub use kv::{FileKvStore, KvError, KvStore, MemKvStore};
pub use limiter::{ServiceLimiter, ServiceTerms, StaticServiceLimiter};
pub use secrets::{KvSecretStore, MemSecretStore, SecretStore, SecretsError};

/// Why a presented token was turned away.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Denial {
    /// The identifier does not decode; the token never reached the
    /// signature check.
    #[error("malformed_identifier")]
    Malformed,
    #[error("invalid_preimage")]
    InvalidPreimage,
    #[error("revoked")]
    Revoked,
    #[error("bad_mac")]
    BadMac,
    #[error("caveat_not_satisfied: {0}")]
    CaveatNotSatisfied(String),
    #[error("unpaid")]
    Unpaid,
}

#[derive(Debug, Error)]
pub enum VerifyFailure {
    /// The credentials are bad; the caller should challenge afresh.
    #[error("denied: {0}")]
    Denied(#[from] Denial),
    /// A collaborator failed; the credentials were never judged.
    #[error(transparent)]
    Backend(anyhow::Error),
}

pub struct Mint {
    challenger: Arc<Challenger>,
    secrets: Arc<dyn SecretStore>,
    limiter: Arc<dyn ServiceLimiter>,
    /// How long verification waits for a settlement that the node has
    /// confirmed but the subscription has not yet delivered. Zero means
    /// cache-hit only.
    settlement_wait: Duration,
    clock: fn() -> DateTime<Utc>,
}

impl Mint {
    pub fn new(
        challenger: Arc<Challenger>,
        secrets: Arc<dyn SecretStore>,
        limiter: Arc<dyn ServiceLimiter>,
    ) -> Self {
        Self {
            challenger,
            secrets,
            limiter,
            settlement_wait: Duration::ZERO,
            clock: Utc::now,
        }
    }

    pub fn with_settlement_wait(mut self, wait: Duration) -> Self {
        self.settlement_wait = wait;
        self
    }

    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// Mints a token for the given services, priced at the sum of their
    /// per-service prices. Returns the macaroon and the invoice the
    /// client must pay before the token verifies.
    pub async fn mint_lsat(&self, services: &[&str]) -> anyhow::Result<(Macaroon, String)> {
        let mut price_msat = 0u64;
        for service in services {
            let terms = self
                .limiter
                .terms(service)
                .ok_or_else(|| anyhow::anyhow!("unknown service: {service}"))?;
            price_msat += terms.price_msat;
        }

        let invoice = self.challenger.new_challenge(price_msat).await?;
        let id = TokenId::new(invoice.payment_hash);
        let secret = self.secrets.new_secret(&id).await?;

        let mut macaroon = Macaroon::mint(&secret, id.encode().to_vec());
        let now = (self.clock)();
        for service in services {
            let caveats = self
                .limiter
                .service_caveats(service, now)
                .ok_or_else(|| anyhow::anyhow!("unknown service: {service}"))?;
            for caveat in caveats {
                macaroon.add_caveat(caveat);
            }
        }

        debug!(
            services = ?services,
            price_msat,
            token_id = %id.to_hex(),
            "minted token"
        );
        Ok((macaroon, invoice.payment_request))
    }

    /// Verifies a presented token against a target service.
    ///
    /// Checks run cheapest-first: preimage, then secret lookup, then the
    /// signature chain, then caveats, and the payment status last since
    /// it may consult the node.
    pub async fn verify_lsat(
        &self,
        macaroon: &Macaroon,
        preimage: &[u8; PREIMAGE_LEN],
        target_service: &str,
    ) -> Result<(), VerifyFailure> {
        let id =
            TokenId::decode(macaroon.identifier()).map_err(|_| Denial::Malformed)?;

        if payment_hash_for_preimage(preimage) != id.payment_hash {
            return Err(Denial::InvalidPreimage.into());
        }

        let secret = match self.secrets.get_secret(&id).await {
            Ok(secret) => secret,
            Err(SecretsError::NotFound) => return Err(Denial::Revoked.into()),
            Err(e) => return Err(VerifyFailure::Backend(e.into())),
        };

        if !macaroon.verify_signature(&secret) {
            return Err(Denial::BadMac.into());
        }

        let now = (self.clock)();
        let ctx = self
            .limiter
            .verify_context(target_service, now)
            .ok_or_else(|| {
                VerifyFailure::Backend(anyhow::anyhow!(
                    "no terms for matched service {target_service}"
                ))
            })?;
        check_caveats(macaroon.caveats(), &ctx)
            .map_err(Denial::CaveatNotSatisfied)?;

        match self
            .challenger
            .verify_invoice_status(id.payment_hash, InvoiceState::Settled, self.settlement_wait)
            .await
        {
            Ok(()) => Ok(()),
            Err(ChallengerError::Timeout | ChallengerError::UnexpectedState(_)) => {
                Err(Denial::Unpaid.into())
            }
            Err(e) => Err(VerifyFailure::Backend(e.into())),
        }
    }

    /// Revokes the token by deleting its root secret. The mint owns the
    /// secret store, so revocation goes through here.
    pub async fn revoke_lsat(&self, macaroon: &Macaroon) -> anyhow::Result<()> {
        let id = TokenId::decode(macaroon.identifier())?;
        self.secrets.revoke_secret(&id).await?;
        Ok(())
    }
}

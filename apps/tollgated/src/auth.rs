//! The per-request accept/challenge decision.
//!
//! The authenticator never fails a request over bad credentials: whatever
//! is wrong with them (absent, malformed, forged, unpaid, revoked), the
//! answer is a fresh challenge bound to a fresh invoice. Only an
//! inability to *mint* that challenge surfaces as an error.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Context as _;
use axum::http::HeaderMap;
use axum::http::header;
use tracing::{debug, info, warn};

use tollgate_lsat::wire;
use tollgate_mint::{Mint, VerifyFailure};

use crate::config::AuthLevel;
use crate::proxy::ProxyService;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Challenge {
        /// Serialized macaroon, base64.
        macaroon: String,
        /// bolt11 payment request.
        invoice: String,
    },
}

pub struct Authenticator {
    mint: Arc<Mint>,
}

impl Authenticator {
    pub fn new(mint: Arc<Mint>) -> Self {
        Self { mint }
    }

    pub async fn accept(
        &self,
        headers: &HeaderMap,
        client_ip: IpAddr,
        service: &ProxyService,
    ) -> anyhow::Result<Decision> {
        match service.auth {
            AuthLevel::Off => return Ok(Decision::Allow),
            AuthLevel::Freebie(_) => {
                if let Some(freebies) = &service.freebies
                    && freebies.try_consume(client_ip)
                {
                    debug!(service = %service.name, %client_ip, "freebie bypass");
                    return Ok(Decision::Allow);
                }
            }
            AuthLevel::On => {}
        }

        if let Some(value) = headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
        {
            match wire::parse_authorization(value) {
                Ok((macaroon, preimage)) => {
                    match self
                        .mint
                        .verify_lsat(&macaroon, &preimage, &service.name)
                        .await
                    {
                        Ok(()) => return Ok(Decision::Allow),
                        Err(VerifyFailure::Denied(denial)) => {
                            info!(service = %service.name, reason = %denial, "rejected credentials");
                        }
                        Err(VerifyFailure::Backend(e)) => {
                            warn!(
                                service = %service.name,
                                error = %e,
                                "verification backend failure, issuing fresh challenge"
                            );
                        }
                    }
                }
                Err(e) => {
                    debug!(service = %service.name, error = %e, "malformed credentials");
                }
            }
        }

        let (macaroon, invoice) = self
            .mint
            .mint_lsat(&[service.name.as_str()])
            .await
            .context("mint challenge")?;
        Ok(Decision::Challenge {
            macaroon: macaroon.serialize(),
            invoice,
        })
    }
}

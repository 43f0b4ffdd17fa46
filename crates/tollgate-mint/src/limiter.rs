//! Per-service caveat policy.
//!
//! The limiter answers two questions: which caveats get baked into a
//! token minted for a service, and which context a token presented to a
//! service must be verified against. The static implementation computes
//! both from the startup service table.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use tollgate_lsat::caveat::{COND_CAPABILITIES, COND_SERVICE, COND_VALID_UNTIL};
use tollgate_lsat::{Caveat, CaveatContext};

/// The mint-relevant slice of a configured service.
#[derive(Debug, Clone)]
pub struct ServiceTerms {
    pub name: String,
    pub price_msat: u64,
    pub capabilities: Vec<String>,
    /// Constraint caveats as configured. `valid_until` values are
    /// lifetimes in seconds, materialized into absolute timestamps at
    /// mint time; all other conditions are attached verbatim.
    pub constraints: Vec<Caveat>,
}

pub trait ServiceLimiter: Send + Sync {
    fn terms(&self, service: &str) -> Option<&ServiceTerms>;

    /// Caveats to bake into a token minted for `service`.
    fn service_caveats(&self, service: &str, now: DateTime<Utc>) -> Option<Vec<Caveat>>;

    /// The verification context for a token presented to `service`.
    fn verify_context(&self, service: &str, now: DateTime<Utc>) -> Option<CaveatContext>;
}

pub struct StaticServiceLimiter {
    services: HashMap<String, ServiceTerms>,
}

impl StaticServiceLimiter {
    pub fn new(services: impl IntoIterator<Item = ServiceTerms>) -> Self {
        Self {
            services: services
                .into_iter()
                .map(|terms| (terms.name.clone(), terms))
                .collect(),
        }
    }
}

impl ServiceLimiter for StaticServiceLimiter {
    fn terms(&self, service: &str) -> Option<&ServiceTerms> {
        self.services.get(service)
    }

    fn service_caveats(&self, service: &str, now: DateTime<Utc>) -> Option<Vec<Caveat>> {
        let terms = self.terms(service)?;
        let mut caveats = vec![
            Caveat::new(COND_SERVICE, terms.name.clone()),
            Caveat::new(COND_CAPABILITIES, terms.capabilities.join(",")),
        ];
        for constraint in &terms.constraints {
            if constraint.condition == COND_VALID_UNTIL {
                let lifetime: i64 = constraint.value.trim().parse().unwrap_or(0);
                caveats.push(Caveat::new(
                    COND_VALID_UNTIL,
                    (now.timestamp() + lifetime).to_string(),
                ));
            } else {
                caveats.push(constraint.clone());
            }
        }
        Some(caveats)
    }

    fn verify_context(&self, service: &str, now: DateTime<Utc>) -> Option<CaveatContext> {
        let terms = self.terms(service)?;
        let constraints = terms
            .constraints
            .iter()
            .filter(|c| c.condition != COND_VALID_UNTIL)
            .map(|c| (c.condition.clone(), c.value.clone()))
            .collect();
        Some(CaveatContext {
            target_service: terms.name.clone(),
            required_capabilities: terms.capabilities.clone(),
            constraints,
            now,
        })
    }
}

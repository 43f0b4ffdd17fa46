//! Caveat encoding and verification.
//!
//! A caveat is a `condition=value` predicate restricting the contexts in
//! which a token is valid. Well-known conditions:
//!
//! - `service`: comma-separated service names the token was minted for.
//!   A request is admitted when any service caveat names its target.
//! - `capabilities`: comma-separated capability strings; a target
//!   service's required capabilities must all be covered.
//! - `valid_until`: unix seconds after which the token is dead.
//!
//! Any other condition is only admitted when the verification context
//! carries an expected value for it (the target service's configured
//! constraints) and the caveat value matches it exactly.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::LsatError;

pub const COND_SERVICE: &str = "service";
pub const COND_CAPABILITIES: &str = "capabilities";
pub const COND_VALID_UNTIL: &str = "valid_until";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caveat {
    pub condition: String,
    pub value: String,
}

impl Caveat {
    pub fn new(condition: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            value: value.into(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, LsatError> {
        let (condition, value) = s
            .split_once('=')
            .ok_or_else(|| LsatError::InvalidMacaroon(format!("caveat without '=': {s}")))?;
        if condition.is_empty() {
            return Err(LsatError::InvalidMacaroon(format!(
                "caveat with empty condition: {s}"
            )));
        }
        Ok(Self::new(condition, value))
    }
}

impl fmt::Display for Caveat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.condition, self.value)
    }
}

/// Everything the caveat checks need to know about the request being
/// verified. The clock is part of the context so callers control time.
#[derive(Debug, Clone)]
pub struct CaveatContext {
    pub target_service: String,
    pub required_capabilities: Vec<String>,
    /// Expected values for per-service constraint conditions.
    pub constraints: HashMap<String, String>,
    pub now: DateTime<Utc>,
}

/// Checks every caveat against the context. Returns the reason for the
/// first caveat that is not satisfied.
pub fn check_caveats(caveats: &[Caveat], ctx: &CaveatContext) -> Result<(), String> {
    let mut service_admitted = false;
    let mut saw_service_caveat = false;
    let mut capabilities: HashSet<&str> = HashSet::new();

    for caveat in caveats {
        match caveat.condition.as_str() {
            COND_SERVICE => {
                saw_service_caveat = true;
                if caveat
                    .value
                    .split(',')
                    .any(|name| name.trim() == ctx.target_service)
                {
                    service_admitted = true;
                }
            }
            COND_CAPABILITIES => {
                capabilities.extend(caveat.value.split(',').map(str::trim));
            }
            COND_VALID_UNTIL => {
                let deadline: i64 = caveat
                    .value
                    .trim()
                    .parse()
                    .map_err(|_| format!("unparsable valid_until: {}", caveat.value))?;
                if ctx.now.timestamp() > deadline {
                    return Err(format!("token expired at {deadline}"));
                }
            }
            other => match ctx.constraints.get(other) {
                Some(expected) if expected == &caveat.value => {}
                Some(expected) => {
                    return Err(format!(
                        "constraint {other} requires {expected}, token has {}",
                        caveat.value
                    ));
                }
                None => return Err(format!("unknown caveat condition: {other}")),
            },
        }
    }

    if !saw_service_caveat || !service_admitted {
        return Err(format!("token not minted for {}", ctx.target_service));
    }

    for required in &ctx.required_capabilities {
        if !capabilities.contains(required.as_str()) {
            return Err(format!("missing capability: {required}"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(target: &str) -> CaveatContext {
        CaveatContext {
            target_service: target.to_string(),
            required_capabilities: Vec::new(),
            constraints: HashMap::new(),
            now: Utc::now(),
        }
    }

    #[test]
    fn parse_and_display_round_trip() {
        let caveat = Caveat::parse("service=svc1").unwrap();
        assert_eq!(caveat.condition, "service");
        assert_eq!(caveat.value, "svc1");
        assert_eq!(caveat.to_string(), "service=svc1");

        // Values may themselves contain '='.
        let caveat = Caveat::parse("note=a=b").unwrap();
        assert_eq!(caveat.value, "a=b");

        assert!(Caveat::parse("no-separator").is_err());
        assert!(Caveat::parse("=value").is_err());
    }

    #[test]
    fn admits_named_service() {
        let caveats = vec![Caveat::new("service", "svc1")];
        assert!(check_caveats(&caveats, &ctx("svc1")).is_ok());
        assert!(check_caveats(&caveats, &ctx("svc2")).is_err());
    }

    #[test]
    fn admits_service_from_csv() {
        let caveats = vec![Caveat::new("service", "svc1,svc2")];
        assert!(check_caveats(&caveats, &ctx("svc2")).is_ok());
    }

    #[test]
    fn rejects_token_without_service_caveat() {
        assert!(check_caveats(&[], &ctx("svc1")).is_err());
    }

    #[test]
    fn required_capabilities_must_be_covered() {
        let caveats = vec![
            Caveat::new("service", "svc1"),
            Caveat::new("capabilities", "read"),
        ];
        let mut c = ctx("svc1");
        c.required_capabilities = vec!["read".to_string()];
        assert!(check_caveats(&caveats, &c).is_ok());

        c.required_capabilities = vec!["read".to_string(), "write".to_string()];
        let err = check_caveats(&caveats, &c).unwrap_err();
        assert!(err.contains("write"), "{err}");
    }

    #[test]
    fn valid_until_is_checked_against_context_clock() {
        let now = Utc::now();
        let caveats = vec![
            Caveat::new("service", "svc1"),
            Caveat::new("valid_until", (now.timestamp() + 60).to_string()),
        ];
        let mut c = ctx("svc1");
        c.now = now;
        assert!(check_caveats(&caveats, &c).is_ok());

        c.now = now + chrono::Duration::seconds(120);
        assert!(check_caveats(&caveats, &c).is_err());
    }

    #[test]
    fn constraint_conditions_require_exact_match() {
        let caveats = vec![
            Caveat::new("service", "svc1"),
            Caveat::new("tier", "premium"),
        ];
        let mut c = ctx("svc1");
        c.constraints
            .insert("tier".to_string(), "premium".to_string());
        assert!(check_caveats(&caveats, &c).is_ok());

        c.constraints
            .insert("tier".to_string(), "basic".to_string());
        assert!(check_caveats(&caveats, &c).is_err());
    }

    #[test]
    fn unknown_condition_is_rejected() {
        let caveats = vec![
            Caveat::new("service", "svc1"),
            Caveat::new("mystery", "1"),
        ];
        let err = check_caveats(&caveats, &ctx("svc1")).unwrap_err();
        assert!(err.contains("mystery"), "{err}");
    }
}

//! HTTP wire codecs for LSAT credentials and challenges.
//!
//! Credentials ride in `Authorization: LSAT <macaroon-b64>:<preimage-hex>`;
//! challenges ride in `WWW-Authenticate: LSAT macaroon="...", invoice="..."`.
//! The parsers are deliberately forgiving about whitespace and scheme case
//! and strict about everything else.

use std::collections::HashMap;

use crate::macaroon::Macaroon;
use crate::{LsatError, PREIMAGE_LEN, preimage_from_hex};

pub const AUTH_SCHEME: &str = "LSAT";

/// Parses an `Authorization` header value into the macaroon and preimage.
pub fn parse_authorization(value: &str) -> Result<(Macaroon, [u8; PREIMAGE_LEN]), LsatError> {
    let v = value.trim();
    let (scheme, rest) = v
        .split_once(' ')
        .ok_or_else(|| LsatError::InvalidHeader("missing auth scheme".to_string()))?;
    if !scheme.eq_ignore_ascii_case(AUTH_SCHEME) {
        return Err(LsatError::InvalidHeader(format!(
            "unsupported auth scheme: {scheme}"
        )));
    }

    let (macaroon_b64, preimage_hex) = rest
        .trim()
        .split_once(':')
        .ok_or_else(|| LsatError::InvalidHeader("missing ':' separator".to_string()))?;
    if macaroon_b64.is_empty() {
        return Err(LsatError::InvalidHeader("empty macaroon".to_string()));
    }

    let macaroon = Macaroon::deserialize(macaroon_b64)?;
    let preimage = preimage_from_hex(preimage_hex)?;
    Ok((macaroon, preimage))
}

/// Renders a challenge for the `WWW-Authenticate` response header.
pub fn format_www_authenticate(macaroon_b64: &str, invoice: &str) -> String {
    format!("{AUTH_SCHEME} macaroon=\"{macaroon_b64}\", invoice=\"{invoice}\"")
}

/// Parses a `WWW-Authenticate` challenge back into its macaroon (base64)
/// and invoice parts. Used by paying clients and by tests.
pub fn parse_www_authenticate(value: &str) -> Result<(String, String), LsatError> {
    let v = value.trim();
    let (scheme, rest) = v
        .split_once(' ')
        .ok_or_else(|| LsatError::InvalidHeader("missing auth scheme".to_string()))?;
    if !scheme.eq_ignore_ascii_case(AUTH_SCHEME) {
        return Err(LsatError::InvalidHeader(format!(
            "unsupported challenge scheme: {scheme}"
        )));
    }

    let params = parse_kv_params(rest);
    let macaroon = params
        .get("macaroon")
        .cloned()
        .ok_or_else(|| LsatError::InvalidHeader("missing macaroon".to_string()))?;
    let invoice = params
        .get("invoice")
        .cloned()
        .ok_or_else(|| LsatError::InvalidHeader("missing invoice".to_string()))?;
    Ok((macaroon, invoice))
}

fn parse_kv_params(s: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for part in s.split(',') {
        let p = part.trim();
        if p.is_empty() {
            continue;
        }
        let Some((k, v)) = p.split_once('=') else {
            continue;
        };
        let key = k.trim().to_string();
        let mut val = v.trim().to_string();
        if val.starts_with('"') && val.ends_with('"') && val.len() >= 2 {
            val = val[1..val.len() - 1].to_string();
        }
        out.insert(key, val);
    }
    out
}

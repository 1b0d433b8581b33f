// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 7616 digest computation.

use sha2::{Digest as _, Sha256};
use smol_str::SmolStr;

use crate::store::StoredSecret;

/// Digest algorithms offered in challenges, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha256,
    Sha256Sess,
    Md5,
    Md5Sess,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha256Sess => "SHA-256-sess",
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Md5Sess => "MD5-sess",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "SHA-256" => Some(DigestAlgorithm::Sha256),
            "SHA-256-SESS" => Some(DigestAlgorithm::Sha256Sess),
            "MD5" => Some(DigestAlgorithm::Md5),
            "MD5-SESS" => Some(DigestAlgorithm::Md5Sess),
            _ => None,
        }
    }

    pub fn is_session_variant(&self) -> bool {
        matches!(self, DigestAlgorithm::Sha256Sess | DigestAlgorithm::Md5Sess)
    }

    fn hash(&self, data: &[u8]) -> String {
        match self {
            DigestAlgorithm::Md5 | DigestAlgorithm::Md5Sess => {
                format!("{:x}", md5::compute(data))
            }
            DigestAlgorithm::Sha256 | DigestAlgorithm::Sha256Sess => {
                hex::encode(Sha256::digest(data))
            }
        }
    }
}

/// Parsed Digest credentials from an Authorization header.
#[derive(Debug, Clone)]
pub struct DigestCredentials {
    pub username: SmolStr,
    pub realm: SmolStr,
    pub nonce: SmolStr,
    pub uri: SmolStr,
    pub response: SmolStr,
    pub algorithm: DigestAlgorithm,
    pub qop: Option<SmolStr>,
    pub nc: Option<u32>,
    pub cnonce: Option<SmolStr>,
}

impl DigestCredentials {
    /// Parses an `Authorization` / `Proxy-Authorization` header value.
    ///
    /// Returns `None` when the scheme is not Digest or a mandatory
    /// parameter is missing (the caller answers 400 for the latter case
    /// after distinguishing it with [`DigestCredentials::is_digest`]).
    pub fn parse(value: &str) -> Option<Self> {
        let rest = strip_scheme(value)?;

        let mut username = None;
        let mut realm = None;
        let mut nonce = None;
        let mut uri = None;
        let mut response = None;
        let mut algorithm = DigestAlgorithm::Md5;
        let mut qop = None;
        let mut nc = None;
        let mut cnonce = None;

        for part in split_params(rest) {
            let (name, value) = match part.split_once('=') {
                Some((n, v)) => (n.trim(), v.trim().trim_matches('"')),
                None => continue,
            };
            match name.to_ascii_lowercase().as_str() {
                "username" => username = Some(SmolStr::new(value.to_owned())),
                "realm" => realm = Some(SmolStr::new(value.to_owned())),
                "nonce" => nonce = Some(SmolStr::new(value.to_owned())),
                "uri" => uri = Some(SmolStr::new(value.to_owned())),
                "response" => response = Some(SmolStr::new(value.to_owned())),
                "algorithm" => algorithm = DigestAlgorithm::from_token(value)?,
                "qop" => qop = Some(SmolStr::new(value.to_ascii_lowercase())),
                "nc" => nc = u32::from_str_radix(value, 16).ok(),
                "cnonce" => cnonce = Some(SmolStr::new(value.to_owned())),
                _ => {}
            }
        }

        Some(Self {
            username: username?,
            realm: realm?,
            nonce: nonce?,
            uri: uri?,
            response: response?,
            algorithm,
            qop,
            nc,
            cnonce,
        })
    }

    /// Whether a header value carries the Digest scheme at all.
    pub fn is_digest(value: &str) -> bool {
        strip_scheme(value).is_some()
    }

    /// Computes the response this client should have sent for `secret`.
    ///
    /// Returns `None` when the stored secret's hash algorithm cannot serve
    /// the algorithm the client chose (an MD5 HA1 cannot answer a SHA-256
    /// challenge).
    pub fn expected_response(
        &self,
        method: &str,
        body: &[u8],
        secret: &StoredSecret,
    ) -> Option<String> {
        let algo = self.algorithm;
        let ha1 = match secret {
            StoredSecret::Cleartext(password) => algo.hash(
                format!("{}:{}:{}", self.username, self.realm, password).as_bytes(),
            ),
            StoredSecret::Md5Ha1(ha1) => {
                if !matches!(algo, DigestAlgorithm::Md5 | DigestAlgorithm::Md5Sess) {
                    return None;
                }
                ha1.to_string()
            }
            StoredSecret::Sha256Ha1(ha1) => {
                if !matches!(algo, DigestAlgorithm::Sha256 | DigestAlgorithm::Sha256Sess) {
                    return None;
                }
                ha1.to_string()
            }
        };

        let ha1 = if algo.is_session_variant() {
            let cnonce = self.cnonce.as_deref()?;
            algo.hash(format!("{}:{}:{}", ha1, self.nonce, cnonce).as_bytes())
        } else {
            ha1
        };

        let ha2 = match self.qop.as_deref() {
            Some("auth-int") => {
                let body_hash = algo.hash(body);
                algo.hash(format!("{}:{}:{}", method, self.uri, body_hash).as_bytes())
            }
            _ => algo.hash(format!("{}:{}", method, self.uri).as_bytes()),
        };

        let response = match self.qop.as_deref() {
            Some(qop) => {
                let nc = self.nc?;
                let cnonce = self.cnonce.as_deref()?;
                algo.hash(
                    format!(
                        "{}:{}:{:08x}:{}:{}:{}",
                        ha1, self.nonce, nc, cnonce, qop, ha2
                    )
                    .as_bytes(),
                )
            }
            None => algo.hash(format!("{}:{}:{}", ha1, self.nonce, ha2).as_bytes()),
        };

        Some(response)
    }
}

fn strip_scheme(value: &str) -> Option<&str> {
    let trimmed = value.trim_start();
    let (scheme, rest) = trimmed.split_once(char::is_whitespace)?;
    scheme.eq_ignore_ascii_case("Digest").then_some(rest)
}

/// Splits digest parameters on commas outside quoted strings.
fn split_params(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                parts.push(input[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(input[start..].trim());
    parts
}

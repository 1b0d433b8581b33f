// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::BTreeMap;
use std::fmt;

use percent_encoding::percent_decode_str;
use smol_str::SmolStr;

/// Parsed representation of a SIP or SIPS URI (RFC 3261 §19).
///
/// Equality of the address-of-record part is case-insensitive on host and
/// case-sensitive on user; use [`SipUri::aor`] / [`SipUri::same_resource`]
/// for identity comparisons rather than `==` (which also compares
/// parameters).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    pub sips: bool,
    pub user: Option<SmolStr>,
    pub host: SmolStr,
    pub port: Option<u16>,
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
    /// URI headers (`?Name=value`), e.g. the Replaces of an attended
    /// transfer target.
    pub headers: BTreeMap<SmolStr, SmolStr>,
}

impl SipUri {
    /// Attempts to parse a `sip:` / `sips:` URI.
    pub fn parse(input: &str) -> Option<Self> {
        let (scheme, rest) = input.trim().split_once(':')?;
        let sips = scheme.eq_ignore_ascii_case("sips");
        if !sips && !scheme.eq_ignore_ascii_case("sip") {
            return None;
        }

        let (addr, headers_part) = match rest.split_once('?') {
            Some((addr, headers)) => (addr, Some(headers)),
            None => (rest, None),
        };

        let mut headers = BTreeMap::new();
        if let Some(headers_part) = headers_part {
            for pair in headers_part.split('&') {
                if let Some((name, value)) = pair.split_once('=') {
                    headers.insert(
                        SmolStr::new(name.trim().to_owned()),
                        SmolStr::new(value.trim().to_owned()),
                    );
                }
            }
        }

        let mut segments = addr.split(';');
        let base = segments.next()?.trim();
        let mut params = BTreeMap::new();
        for seg in segments {
            let seg = seg.trim();
            if seg.is_empty() {
                continue;
            }
            match seg.split_once('=') {
                Some((k, v)) => params.insert(
                    SmolStr::new(k.trim().to_ascii_lowercase()),
                    Some(SmolStr::new(v.trim().to_owned())),
                ),
                None => params.insert(SmolStr::new(seg.to_ascii_lowercase()), None),
            };
        }

        let (user, host_port) = match base.rsplit_once('@') {
            Some((user, hp)) => {
                let decoded = percent_decode_str(user.trim()).decode_utf8().ok()?;
                (Some(SmolStr::new(decoded.into_owned())), hp.trim())
            }
            None => (None, base),
        };
        if host_port.is_empty() {
            return None;
        }

        let (host, port) = split_host_port(host_port)?;

        Some(Self {
            sips,
            user,
            host: SmolStr::new(host.to_ascii_lowercase()),
            port,
            params,
            headers,
        })
    }

    /// URI header value (case-insensitive name lookup).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn scheme(&self) -> &'static str {
        if self.sips {
            "sips"
        } else {
            "sip"
        }
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Value of a URI parameter, if present (name lookup is lowercase).
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(&SmolStr::new(name.to_ascii_lowercase()))
            .and_then(|v| v.as_deref())
    }

    /// Whether the flag-style parameter is present (e.g. `lr`).
    pub fn has_param(&self, name: &str) -> bool {
        self.params
            .contains_key(&SmolStr::new(name.to_ascii_lowercase()))
    }

    /// GRUU parameter (`gr`), when this URI names a specific device.
    pub fn gruu(&self) -> Option<&str> {
        self.param("gr")
    }

    /// Canonical address-of-record string: scheme, user and host only.
    ///
    /// Host is lowercased at parse time; user case is preserved. Port and
    /// parameters are not part of the AOR identity.
    pub fn aor(&self) -> String {
        match &self.user {
            Some(user) => format!("{}:{}@{}", self.scheme(), user, self.host),
            None => format!("{}:{}", self.scheme(), self.host),
        }
    }

    /// AOR-level identity comparison (scheme + user + host).
    pub fn same_resource(&self, other: &SipUri) -> bool {
        self.sips == other.sips && self.user == other.user && self.host == other.host
    }

    /// Whether this URI addresses the given host/port pair, treating an
    /// absent port as 5060. Used for self-route detection.
    pub fn addresses(&self, host: &str, port: u16) -> bool {
        self.host.eq_ignore_ascii_case(host) && self.port.unwrap_or(5060) == port
    }
}

fn split_host_port(input: &str) -> Option<(&str, Option<u16>)> {
    // Bracketed IPv6 literal.
    if let Some(rest) = input.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(p.parse().ok()?),
            None if tail.is_empty() => None,
            None => return None,
        };
        return Some((host, port));
    }
    match input.rsplit_once(':') {
        Some((host, p)) if !host.contains(':') => Some((host, Some(p.parse().ok()?))),
        _ => Some((input, None)),
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme())?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        for (i, (name, value)) in self.headers.iter().enumerate() {
            write!(f, "{}{}={}", if i == 0 { '?' } else { '&' }, name, value)?;
        }
        Ok(())
    }
}

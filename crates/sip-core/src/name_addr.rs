// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! name-addr values (From/To/Contact/Route/Refer-To/X-Target-Uris).

use std::collections::BTreeMap;
use std::fmt;

use smol_str::SmolStr;

use crate::uri::SipUri;

/// A single name-addr: optional display name, URI, header parameters.
///
/// Header parameters (after the closing `>`) are distinct from the URI's
/// own parameters; `q`, `expires` and `+sip.instance` live here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<SmolStr>,
    pub uri: SipUri,
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
}

impl NameAddr {
    pub fn from_uri(uri: SipUri) -> Self {
        Self {
            display_name: None,
            uri,
            params: BTreeMap::new(),
        }
    }

    /// Parses one name-addr or addr-spec value.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();

        let (display_name, rest) = if let Some(stripped) = value.strip_prefix('"') {
            let (name, tail) = stripped.split_once('"')?;
            (Some(SmolStr::new(name.to_owned())), tail.trim())
        } else if let Some(angle) = value.find('<') {
            let name = value[..angle].trim();
            let display = (!name.is_empty()).then(|| SmolStr::new(name.to_owned()));
            (display, &value[angle..])
        } else {
            (None, value)
        };

        if let Some(stripped) = rest.trim_start().strip_prefix('<') {
            let (inner, tail) = stripped.split_once('>')?;
            let uri = SipUri::parse(inner)?;
            let mut params = BTreeMap::new();
            for seg in tail.split(';') {
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
            Some(Self {
                display_name,
                uri,
                params,
            })
        } else {
            // addr-spec form: everything after the first ';' is a header
            // parameter, not a URI parameter (RFC 3261 §20.10).
            let (uri_part, tail) = match rest.split_once(';') {
                Some((u, t)) => (u, Some(t)),
                None => (rest, None),
            };
            let uri = SipUri::parse(uri_part)?;
            let mut params = BTreeMap::new();
            if let Some(tail) = tail {
                for seg in tail.split(';') {
                    let seg = seg.trim();
                    if seg.is_empty() {
                        continue;
                    }
                    match seg.split_once('=') {
                        Some((k, v)) => params.insert(
                            SmolStr::new(k.trim().to_ascii_lowercase()),
                            Some(SmolStr::new(v.trim().trim_matches('"').to_owned())),
                        ),
                        None => params.insert(SmolStr::new(seg.to_ascii_lowercase()), None),
                    };
                }
            }
            Some(Self {
                display_name,
                uri,
                params,
            })
        }
    }

    /// Header parameter value; quoted values are returned unquoted.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(&SmolStr::new(name.to_ascii_lowercase()))
            .and_then(|v| v.as_deref())
            .map(|v| v.trim_matches('"'))
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params
            .contains_key(&SmolStr::new(name.to_ascii_lowercase()))
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

/// Splits a comma-separated header value into name-addr entries.
///
/// Commas inside angle brackets or quoted strings do not split.
pub fn parse_address_list(value: &str) -> Vec<NameAddr> {
    let mut entries = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut start = 0usize;

    for (i, c) in value.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '<' if !quoted => depth += 1,
            '>' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => {
                if let Some(addr) = NameAddr::parse(&value[start..i]) {
                    entries.push(addr);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    if let Some(addr) = NameAddr::parse(&value[start..]) {
        entries.push(addr);
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_addr_with_header_params() {
        let addr = NameAddr::parse(
            "\"Bob\" <sip:bob@example.com;transport=tcp>;q=0.8;expires=120",
        )
        .unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Bob"));
        assert_eq!(addr.uri.param("transport"), Some("tcp"));
        assert_eq!(addr.param("q"), Some("0.8"));
        assert_eq!(addr.param("expires"), Some("120"));
    }

    #[test]
    fn addr_spec_params_are_header_params() {
        let addr = NameAddr::parse("sip:bob@example.com;tag=abc").unwrap();
        assert_eq!(addr.param("tag"), Some("abc"));
        assert!(addr.uri.params.is_empty());
    }

    #[test]
    fn instance_id_is_a_header_param() {
        let addr = NameAddr::parse(
            "<sip:bob@192.0.2.4>;+sip.instance=\"urn:uuid:0001\"",
        )
        .unwrap();
        assert_eq!(addr.param("+sip.instance"), Some("urn:uuid:0001"));
    }

    #[test]
    fn list_splits_on_top_level_commas_only() {
        let list = parse_address_list("<sip:a@h>, \"x,y\" <sip:b@h>;q=0.5, sip:c@h");
        assert_eq!(list.len(), 3);
        assert_eq!(list[1].display_name.as_deref(), Some("x,y"));
        assert_eq!(list[2].uri.user(), Some("c"));
    }
}

// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Via header values (RFC 3261 §20.42).
//!
//! The routing core reads Via for two things: the `received` parameter
//! (trusted-host checks) and the `branch` transaction identifier.

use std::collections::BTreeMap;
use std::fmt;

use smol_str::SmolStr;

/// One Via header value: `SIP/2.0/<transport> <sent-by>[;params]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHeader {
    pub transport: SmolStr,
    pub sent_by: SmolStr,
    pub params: BTreeMap<SmolStr, Option<SmolStr>>,
}

impl ViaHeader {
    pub fn new(transport: impl Into<SmolStr>, sent_by: impl Into<SmolStr>) -> Self {
        Self {
            transport: transport.into(),
            sent_by: sent_by.into(),
            params: BTreeMap::new(),
        }
    }

    /// Parses a single Via header value. Returns None on malformed input.
    pub fn parse(value: &str) -> Option<Self> {
        let mut segments = value.split(';');
        let sent_protocol = segments.next()?.trim();

        let mut parts = sent_protocol.split_whitespace();
        let proto = parts.next()?;
        let sent_by = parts.next()?;
        let transport = proto.rsplit('/').next()?;
        if transport.is_empty() || sent_by.is_empty() {
            return None;
        }

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

        Some(Self {
            transport: SmolStr::new(transport.to_ascii_uppercase()),
            sent_by: SmolStr::new(sent_by.to_owned()),
            params,
        })
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(&SmolStr::new(name.to_ascii_lowercase()))
            .and_then(|v| v.as_deref())
    }

    pub fn branch(&self) -> Option<&str> {
        self.param("branch")
    }

    pub fn received(&self) -> Option<&str> {
        self.param("received")
    }

    /// Host portion of sent-by (port stripped).
    pub fn host(&self) -> &str {
        match self.sent_by.rsplit_once(':') {
            Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
            _ => &self.sent_by,
        }
    }

    /// Address to check against trusted hosts: `received` when present,
    /// the sent-by host otherwise.
    pub fn source_host(&self) -> &str {
        self.received().unwrap_or_else(|| self.host())
    }
}

impl fmt::Display for ViaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.sent_by)?;
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! message/sipfrag bodies (RFC 3420), as carried by transfer-progress
//! NOTIFY requests.

use smol_str::SmolStr;

/// A status-line-only sipfrag: `SIP/2.0 <code> <reason>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipFrag {
    pub code: u16,
    pub reason: SmolStr,
}

impl SipFrag {
    pub fn new(code: u16, reason: impl Into<SmolStr>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn parse(body: &str) -> Option<Self> {
        let line = body.lines().next()?.trim();
        let rest = line.strip_prefix("SIP/2.0 ")?;
        let (code, reason) = match rest.split_once(' ') {
            Some((c, r)) => (c, r.trim()),
            None => (rest, ""),
        };
        Some(Self {
            code: code.parse().ok()?,
            reason: SmolStr::new(reason.to_owned()),
        })
    }

    /// Renders the body, CRLF-terminated.
    pub fn render(&self) -> String {
        format!("SIP/2.0 {} {}\r\n", self.code, self.reason)
    }
}

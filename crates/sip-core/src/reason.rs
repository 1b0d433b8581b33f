// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Reason header (RFC 3326), used to annotate CANCELs with the outcome
//! of the fork that caused them.

use std::fmt;

use smol_str::SmolStr;

/// A parsed Reason header value: `SIP;cause=200;text="..."`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonHeader {
    pub protocol: SmolStr,
    pub cause: Option<u32>,
    pub text: Option<SmolStr>,
}

impl ReasonHeader {
    /// Reason carried on peer-branch CANCELs after another branch answered.
    pub fn call_completed_elsewhere() -> Self {
        Self {
            protocol: SmolStr::new("SIP"),
            cause: Some(200),
            text: Some(SmolStr::new("Call completed elsewhere")),
        }
    }

    /// Reason carried when the fork ended with a global decline.
    pub fn busy_everywhere() -> Self {
        Self {
            protocol: SmolStr::new("SIP"),
            cause: Some(600),
            text: Some(SmolStr::new("Busy Everywhere")),
        }
    }

    /// Parses one Reason header value; unknown parameters are dropped.
    pub fn parse(value: &str) -> Option<Self> {
        let mut segments = value.split(';');
        let protocol = segments.next()?.trim();
        if protocol.is_empty() {
            return None;
        }

        let mut cause = None;
        let mut text = None;
        for seg in segments {
            let (k, v) = match seg.trim().split_once('=') {
                Some(kv) => kv,
                None => continue,
            };
            match k.trim().to_ascii_lowercase().as_str() {
                "cause" => cause = v.trim().parse().ok(),
                "text" => text = Some(SmolStr::new(v.trim().trim_matches('"').to_owned())),
                _ => {}
            }
        }

        Some(Self {
            protocol: SmolStr::new(protocol.to_owned()),
            cause,
            text,
        })
    }
}

impl fmt::Display for ReasonHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.protocol)?;
        if let Some(cause) = self.cause {
            write!(f, ";cause={}", cause)?;
        }
        if let Some(text) = &self.text {
            write!(f, ";text=\"{}\"", text)?;
        }
        Ok(())
    }
}

// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! simple-message-summary bodies (RFC 3842).
//!
//! The B2BUA re-authors out-of-dialog MWI NOTIFYs so the Message-Account
//! matches the bridged account rather than the upstream provider's.

use smol_str::SmolStr;

use crate::uri::SipUri;

/// Parsed message-summary body. Unknown lines are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSummary {
    pub waiting: bool,
    pub account: Option<SipUri>,
    extra: Vec<SmolStr>,
}

impl MessageSummary {
    pub fn parse(body: &str) -> Option<Self> {
        let mut waiting = None;
        let mut account = None;
        let mut extra = Vec::new();

        for line in body.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            match line.split_once(':') {
                Some((name, value)) if name.eq_ignore_ascii_case("Messages-Waiting") => {
                    waiting = Some(value.trim().eq_ignore_ascii_case("yes"));
                }
                Some((name, value)) if name.eq_ignore_ascii_case("Message-Account") => {
                    account = SipUri::parse(value.trim());
                }
                _ => extra.push(SmolStr::new(line.to_owned())),
            }
        }

        Some(Self {
            waiting: waiting?,
            account,
            extra,
        })
    }

    /// Replaces the account the summary is reported for.
    pub fn set_account(&mut self, account: SipUri) {
        self.account = Some(account);
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "Messages-Waiting: {}\r\n",
            if self.waiting { "yes" } else { "no" }
        );
        if let Some(account) = &self.account {
            out.push_str(&format!("Message-Account: {}\r\n", account));
        }
        for line in &self.extra {
            out.push_str(line);
            out.push_str("\r\n");
        }
        out
    }
}

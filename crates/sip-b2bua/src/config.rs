// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::time::Duration;

/// Which application drives bridging decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationKind {
    Trenscrypter,
    SipBridge,
}

impl ApplicationKind {
    /// Parses the `application` configuration value; an unknown type is a
    /// start-up failure.
    pub fn from_config(value: &str) -> anyhow::Result<Self> {
        match value {
            "trenscrypter" => Ok(ApplicationKind::Trenscrypter),
            "sip-bridge" => Ok(ApplicationKind::SipBridge),
            other => anyhow::bail!("unknown B2BUA server application type: {}", other),
        }
    }
}

/// The `b2bua` configuration section.
#[derive(Debug, Clone)]
pub struct B2buaConfig {
    pub application: ApplicationKind,
    /// Terminate a leg after this much media silence.
    pub no_rtp_timeout: Duration,
    /// Terminate pairs older than this; zero disables.
    pub max_call_duration: Duration,
    /// One transport per pooled account, to sidestep provider rate
    /// limiting.
    pub one_connection_per_account: bool,
}

impl Default for B2buaConfig {
    fn default() -> Self {
        Self {
            application: ApplicationKind::Trenscrypter,
            no_rtp_timeout: Duration::from_secs(30),
            max_call_duration: Duration::ZERO,
            one_connection_per_account: false,
        }
    }
}

// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Interpretation of Contact header entries for registration.

use std::time::Duration;

use smol_str::SmolStr;

use sip_core::{NameAddr, SipUri};

use crate::PushParams;

/// One contact entry extracted from a REGISTER.
#[derive(Debug, Clone)]
pub struct ContactUpdate {
    pub contact: SipUri,
    pub instance_id: SmolStr,
    pub expires: Duration,
    pub q: f32,
    pub push: Option<PushParams>,
    pub message_expires: Option<u32>,
}

impl ContactUpdate {
    /// Builds an update from a parsed Contact entry.
    ///
    /// The instance identity is `+sip.instance` when present, the `gr` URI
    /// parameter otherwise, and finally the contact URI text, so every
    /// binding has a replacement key.
    pub fn from_name_addr(addr: &NameAddr, default_expires: Duration) -> Self {
        let contact = addr.uri.clone();

        let instance_id = addr
            .param("+sip.instance")
            .map(|v| SmolStr::new(v.to_owned()))
            .or_else(|| contact.gruu().map(|g| SmolStr::new(g.to_owned())))
            .unwrap_or_else(|| SmolStr::new(contact.to_string()));

        let expires = addr
            .param("expires")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(default_expires);

        let q = addr
            .param("q")
            .and_then(|v| v.parse::<f32>().ok())
            .map(|q| q.clamp(0.0, 1.0))
            .unwrap_or(1.0);

        let push = match (
            contact.param("pn-provider"),
            contact.param("pn-prid"),
            contact.param("pn-param"),
        ) {
            (Some(provider), Some(prid), param) => Some(PushParams {
                provider: SmolStr::new(provider.to_owned()),
                prid: SmolStr::new(prid.to_owned()),
                param: SmolStr::new(param.unwrap_or_default().to_owned()),
            }),
            _ => None,
        };

        let message_expires = addr
            .param("message-expires")
            .and_then(|v| v.parse::<u32>().ok());

        Self {
            contact,
            instance_id,
            expires,
            q,
            push,
            message_expires,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_prefers_sip_instance() {
        let addr = NameAddr::parse(
            "<sip:bob@10.0.0.2;gr=urn:gr-1>;+sip.instance=\"urn:uuid:dev-1\";expires=120;q=0.5",
        )
        .unwrap();
        let update = ContactUpdate::from_name_addr(&addr, Duration::from_secs(3600));
        assert_eq!(update.instance_id.as_str(), "urn:uuid:dev-1");
        assert_eq!(update.expires, Duration::from_secs(120));
        assert!((update.q - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn gruu_is_the_fallback_identity() {
        let addr = NameAddr::parse("<sip:bob@10.0.0.2;gr=urn:gr-1>").unwrap();
        let update = ContactUpdate::from_name_addr(&addr, Duration::from_secs(3600));
        assert_eq!(update.instance_id.as_str(), "urn:gr-1");
    }

    #[test]
    fn push_params_come_from_the_uri() {
        let addr = NameAddr::parse(
            "<sip:bob@10.0.0.2;pn-provider=apns.dev;pn-prid=EA88:remote;pn-param=XX.example>",
        )
        .unwrap();
        let update = ContactUpdate::from_name_addr(&addr, Duration::from_secs(3600));
        let push = update.push.unwrap();
        assert_eq!(push.provider.as_str(), "apns.dev");
        assert_eq!(push.prid.as_str(), "EA88:remote");
    }

    #[test]
    fn message_expires_zero_is_preserved() {
        let addr = NameAddr::parse("<sip:bob@10.0.0.2>;message-expires=0").unwrap();
        let update = ContactUpdate::from_name_addr(&addr, Duration::from_secs(3600));
        assert_eq!(update.message_expires, Some(0));
    }
}

// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! B2BUA applications.
//!
//! The application decides where leg-B goes and under which identity.
//! The variant set is closed, so dispatch is an enum rather than a trait
//! object.

use std::sync::Arc;

use dashmap::DashMap;
use smol_str::SmolStr;
use tracing::{debug, info, warn};

use sip_accounts::{Account, AccountPool};
use sip_core::SipUri;

use crate::call::{CallLeg, CallParams, DeclineReason, MediaEncryption};

/// The configured application type.
pub enum B2buaApplication {
    /// Bridges differing media-encryption policies across legs.
    Trenscrypter(Trenscrypter),
    /// Bridges calls to an external SIP provider through pooled accounts.
    SipBridge(SipBridge),
}

impl B2buaApplication {
    /// Chooses the callee for leg-B and adjusts its parameters, or
    /// declines leg-A.
    pub fn on_call_create(
        &self,
        incoming: &dyn CallLeg,
        params: &mut CallParams,
    ) -> Result<SipUri, DeclineReason> {
        match self {
            B2buaApplication::Trenscrypter(app) => app.on_call_create(incoming, params),
            B2buaApplication::SipBridge(app) => app.on_call_create(incoming, params),
        }
    }

    pub fn on_call_end(&self, call: &dyn CallLeg) {
        if let B2buaApplication::SipBridge(app) = self {
            app.on_call_end(call);
        }
    }

    /// Chooses the peer subscriber for a bridged SUBSCRIBE.
    pub fn on_subscribe(
        &self,
        to: &SipUri,
        event: &str,
    ) -> Result<SipUri, DeclineReason> {
        match self {
            B2buaApplication::Trenscrypter(_) => {
                debug!(event, "subscription bridging unsupported by this application");
                Err(DeclineReason::NotAcceptable)
            }
            B2buaApplication::SipBridge(app) => app.on_subscribe(to, event),
        }
    }

    /// Maps the provider account an out-of-dialog MWI NOTIFY was received
    /// for back to the bridged subscriber.
    pub fn on_notify_to_be_sent(&self, provider_account: &SipUri) -> Option<SipUri> {
        match self {
            B2buaApplication::Trenscrypter(_) => None,
            B2buaApplication::SipBridge(app) => app.on_notify_to_be_sent(provider_account),
        }
    }
}

/// Transparent encryption bridge: leg-B goes to the original destination
/// with the configured outgoing encryption.
pub struct Trenscrypter {
    pub outgoing_encryption: MediaEncryption,
}

impl Trenscrypter {
    pub fn new(outgoing_encryption: MediaEncryption) -> Self {
        Self {
            outgoing_encryption,
        }
    }

    fn on_call_create(
        &self,
        incoming: &dyn CallLeg,
        params: &mut CallParams,
    ) -> Result<SipUri, DeclineReason> {
        params.media_encryption = self.outgoing_encryption;
        Ok(incoming.to_address())
    }
}

/// External-provider bridge backed by the account pool.
pub struct SipBridge {
    pool: Arc<AccountPool>,
    /// Domain bridged subscribers live in, for MWI re-authoring.
    local_domain: SmolStr,
    /// Account claimed per incoming call id, released on call end.
    active_calls: DashMap<SmolStr, Arc<Account>>,
}

impl SipBridge {
    pub fn new(pool: Arc<AccountPool>, local_domain: impl Into<SmolStr>) -> Self {
        Self {
            pool,
            local_domain: local_domain.into(),
            active_calls: DashMap::new(),
        }
    }

    fn on_call_create(
        &self,
        incoming: &dyn CallLeg,
        params: &mut CallParams,
    ) -> Result<SipUri, DeclineReason> {
        let Some(account) = self.pool.get_account_randomly() else {
            warn!("no available account in pool, declining");
            return Err(DeclineReason::NotAcceptable);
        };
        if !account.take_call_slot() {
            return Err(DeclineReason::NotAcceptable);
        }

        params.from_identity = Some(account.identity().clone());
        params.outbound_proxy = account.outbound_proxy();

        // The callee keeps the dialled user, re-homed on the provider.
        let mut callee = account.identity().clone();
        callee.user = incoming.to_address().user.clone();
        info!(account = %account.identity(), %callee, "bridging call through provider account");

        self.active_calls.insert(incoming.call_id(), account);
        Ok(callee)
    }

    fn on_call_end(&self, call: &dyn CallLeg) {
        if let Some((_, account)) = self.active_calls.remove(&call.call_id()) {
            account.release_call_slot();
            debug!(account = %account.identity(), "call slot released");
        }
    }

    fn on_subscribe(&self, to: &SipUri, _event: &str) -> Result<SipUri, DeclineReason> {
        let Some(account) = self.pool.get_account_randomly() else {
            return Err(DeclineReason::NotAcceptable);
        };
        let mut target = account.identity().clone();
        target.user = to.user.clone();
        Ok(target)
    }

    fn on_notify_to_be_sent(&self, provider_account: &SipUri) -> Option<SipUri> {
        let account = self
            .pool
            .lookup("{uri}", &provider_account.to_string())?;
        let mut subscriber = SipUri::parse(&format!("sip:{}", self.local_domain))?;
        subscriber.user = account.identity().user.clone();
        Some(subscriber)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallState, ErrorInfo, LegDirection};
    use sip_accounts::{
        AccountRecord, Loader, PoolConfig, RegistrarClient, RegistrationState, StaticLoader,
    };
    use sip_core::NameAddr;

    struct StubLeg {
        to: SipUri,
    }

    impl CallLeg for StubLeg {
        fn call_id(&self) -> SmolStr {
            SmolStr::new("in-1")
        }
        fn direction(&self) -> LegDirection {
            LegDirection::Incoming
        }
        fn state(&self) -> CallState {
            CallState::IncomingReceived
        }
        fn remote_address(&self) -> SipUri {
            SipUri::parse("sip:caller@local.example").unwrap()
        }
        fn to_address(&self) -> SipUri {
            self.to.clone()
        }
        fn referred_by(&self) -> Option<SmolStr> {
            None
        }
        fn refer_to(&self) -> Option<NameAddr> {
            None
        }
        fn error_info(&self) -> Option<ErrorInfo> {
            None
        }
        fn current_params(&self) -> CallParams {
            CallParams::default()
        }
        fn remote_params(&self) -> CallParams {
            CallParams::default()
        }
        fn notify_ringing(&self) {}
        fn accept_early_media(&self, _params: CallParams) {}
        fn accept(&self, _params: CallParams) {}
        fn accept_update(&self, _params: Option<CallParams>) {}
        fn defer_update(&self) {}
        fn update(&self, _params: CallParams) {}
        fn decline(&self, _reason: DeclineReason) {}
        fn terminate(&self, _error: Option<ErrorInfo>) {}
        fn send_dtmf(&self, _digit: char) {}
        fn transfer_to(&self, _target: NameAddr) {}
        fn send_notify(&self, _event: &str, _content_type: &str, _body: String) {}
    }

    struct NullRegistrar;

    impl RegistrarClient for NullRegistrar {
        fn register(&self, account: &Arc<Account>) {
            account.set_registration(RegistrationState::Ok);
        }
        fn deregister(&self, _account: &Arc<Account>) {}
    }

    async fn pool_with_one_line() -> Arc<AccountPool> {
        let loader: Arc<dyn Loader> = Arc::new(StaticLoader::new(vec![AccountRecord {
            uri: "sip:line1@provider.example".into(),
            ..Default::default()
        }]));
        let pool = AccountPool::new(
            PoolConfig {
                registration_throttling_rate_ms: 1,
                ..PoolConfig::default()
            },
            loader,
            Arc::new(NullRegistrar),
        );
        pool.initial_load().await.unwrap();
        for _ in 0..200 {
            if pool.get_account_randomly().is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        pool
    }

    #[test]
    fn trenscrypter_keeps_destination_and_sets_encryption() {
        let app = Trenscrypter::new(MediaEncryption::Srtp);
        let leg = StubLeg {
            to: SipUri::parse("sip:bob@local.example").unwrap(),
        };
        let mut params = CallParams::default();
        let callee = app.on_call_create(&leg, &mut params).unwrap();
        assert_eq!(callee.to_string(), "sip:bob@local.example");
        assert_eq!(params.media_encryption, MediaEncryption::Srtp);
    }

    #[tokio::test]
    async fn sip_bridge_re_homes_callee_on_provider_account() {
        let bridge = SipBridge::new(pool_with_one_line().await, "local.example");
        let leg = StubLeg {
            to: SipUri::parse("sip:+15551234567@local.example").unwrap(),
        };
        let mut params = CallParams::default();
        let callee = bridge.on_call_create(&leg, &mut params).unwrap();
        assert_eq!(callee.user(), Some("+15551234567"));
        assert_eq!(callee.host(), "provider.example");
        assert_eq!(
            params.from_identity.as_ref().unwrap().to_string(),
            "sip:line1@provider.example"
        );

        // The single line is now busy: a second call is declined.
        let mut params = CallParams::default();
        assert_eq!(
            bridge.on_call_create(&leg, &mut params).unwrap_err(),
            DeclineReason::NotAcceptable
        );

        // Ending the call frees the slot.
        bridge.on_call_end(&leg);
        let mut params = CallParams::default();
        assert!(bridge.on_call_create(&leg, &mut params).is_ok());
    }

    #[tokio::test]
    async fn mwi_maps_provider_account_to_local_subscriber() {
        let bridge = SipBridge::new(pool_with_one_line().await, "local.example");
        let provider = SipUri::parse("sip:line1@provider.example").unwrap();
        let subscriber = bridge.on_notify_to_be_sent(&provider).unwrap();
        assert_eq!(subscriber.to_string(), "sip:line1@local.example");

        let unknown = SipUri::parse("sip:ghost@provider.example").unwrap();
        assert!(bridge.on_notify_to_be_sent(&unknown).is_none());
    }
}

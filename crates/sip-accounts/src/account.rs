// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use smol_str::SmolStr;

use sip_core::SipUri;

/// Credential an account authenticates with against its provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Cleartext(SmolStr),
    Md5Ha1(SmolStr),
    Sha256Ha1(SmolStr),
}

/// Registration lifecycle of one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    None,
    Pending,
    Ok,
    Failed,
}

/// One identity the B2BUA can place outgoing legs as.
///
/// Availability requires a live registration and a free call slot.
#[derive(Debug)]
pub struct Account {
    identity: SipUri,
    credential: RwLock<Option<Credential>>,
    /// Auth username when it differs from the URI user.
    userid: Option<SmolStr>,
    realm: Option<SmolStr>,
    alias: RwLock<SmolStr>,
    outbound_proxy: RwLock<Option<SipUri>>,
    max_calls: u32,
    current_calls: AtomicU32,
    registration: RwLock<RegistrationState>,
}

impl Account {
    pub fn new(identity: SipUri, max_calls: u32) -> Self {
        Self {
            identity,
            credential: RwLock::new(None),
            userid: None,
            realm: None,
            alias: RwLock::new(SmolStr::default()),
            outbound_proxy: RwLock::new(None),
            max_calls,
            current_calls: AtomicU32::new(0),
            registration: RwLock::new(RegistrationState::None),
        }
    }

    pub fn with_credential(self, credential: Credential) -> Self {
        *self.credential.write() = Some(credential);
        self
    }

    pub fn with_userid(mut self, userid: impl Into<SmolStr>) -> Self {
        self.userid = Some(userid.into());
        self
    }

    pub fn with_realm(mut self, realm: impl Into<SmolStr>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    pub fn with_alias(self, alias: impl Into<SmolStr>) -> Self {
        *self.alias.write() = alias.into();
        self
    }

    pub fn with_outbound_proxy(self, proxy: Option<SipUri>) -> Self {
        *self.outbound_proxy.write() = proxy;
        self
    }

    pub fn identity(&self) -> &SipUri {
        &self.identity
    }

    pub fn credential(&self) -> Option<Credential> {
        self.credential.read().clone()
    }

    pub fn set_credential(&self, credential: Option<Credential>) {
        *self.credential.write() = credential;
    }

    pub fn userid(&self) -> Option<&str> {
        self.userid.as_deref()
    }

    /// Auth realm: explicit when configured, the identity domain otherwise.
    pub fn realm(&self) -> &str {
        self.realm.as_deref().unwrap_or_else(|| self.identity.host())
    }

    pub fn alias(&self) -> SmolStr {
        self.alias.read().clone()
    }

    pub fn set_alias(&self, alias: impl Into<SmolStr>) {
        *self.alias.write() = alias.into();
    }

    pub fn outbound_proxy(&self) -> Option<SipUri> {
        self.outbound_proxy.read().clone()
    }

    pub fn set_outbound_proxy(&self, proxy: Option<SipUri>) {
        *self.outbound_proxy.write() = proxy;
    }

    pub fn registration(&self) -> RegistrationState {
        *self.registration.read()
    }

    pub fn set_registration(&self, state: RegistrationState) {
        *self.registration.write() = state;
    }

    pub fn max_calls(&self) -> u32 {
        self.max_calls
    }

    pub fn current_calls(&self) -> u32 {
        self.current_calls.load(Ordering::Relaxed)
    }

    /// Registered with a free call slot.
    pub fn is_available(&self) -> bool {
        self.registration() == RegistrationState::Ok
            && self.current_calls() < self.max_calls
    }

    /// Claims a call slot; false when the line is saturated.
    pub fn take_call_slot(&self) -> bool {
        self.current_calls
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_calls).then_some(current + 1)
            })
            .is_ok()
    }

    pub fn release_call_slot(&self) {
        let _ = self
            .current_calls
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account::new(SipUri::parse("sip:line1@provider.example").unwrap(), 2)
    }

    #[test]
    fn availability_needs_registration_and_capacity() {
        let account = account();
        assert!(!account.is_available());

        account.set_registration(RegistrationState::Ok);
        assert!(account.is_available());

        assert!(account.take_call_slot());
        assert!(account.take_call_slot());
        assert!(!account.is_available());
        assert!(!account.take_call_slot());

        account.release_call_slot();
        assert!(account.is_available());
    }

    #[test]
    fn release_never_underflows() {
        let account = account();
        account.release_call_slot();
        assert_eq!(account.current_calls(), 0);
    }

    #[test]
    fn realm_defaults_to_identity_domain() {
        let account = account();
        assert_eq!(account.realm(), "provider.example");
        let account = account.with_realm("auth.example");
        assert_eq!(account.realm(), "auth.example");
    }
}

// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The account pool and its indexed views.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use rand::Rng;
use smol_str::SmolStr;
use tracing::{debug, error, info, warn};

use sip_core::SipUri;

use crate::account::{Account, Credential, RegistrationState};
use crate::formatter::Formatter;
use crate::loader::{AccountRecord, Loader, SecretType};
use crate::throttle::ThrottledQueue;

const DEFAULT_VIEW_TEMPLATE: &str = "{uri}";

/// Sink for the pool's REGISTER traffic; implemented over the B2BUA's
/// SIP core.
pub trait RegistrarClient: Send + Sync + 'static {
    fn register(&self, account: &Arc<Account>);
    fn deregister(&self, account: &Arc<Account>);
}

/// The `pool` configuration section.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_calls_per_line: u32,
    /// Minimum inter-arrival between REGISTERs of the fleet.
    pub registration_throttling_rate_ms: u64,
    pub registration_required: bool,
    pub unregister_on_server_shutdown: bool,
    /// Voicemail NOTIFY source the accounts subscribe against.
    pub mwi_server_uri: Option<SipUri>,
    /// Pool-level outbound proxy; per-account records may override it.
    pub outbound_proxy: Option<SipUri>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_calls_per_line: 1,
            registration_throttling_rate_ms: 100,
            registration_required: true,
            unregister_on_server_shutdown: true,
            mwi_server_uri: None,
            outbound_proxy: None,
        }
    }
}

struct IndexedView {
    formatter: Formatter,
    map: HashMap<String, Arc<Account>>,
}

/// Pool of B2BUA identities with template-indexed lookup.
///
/// Views are append-only in identity: once requested, a view stays live
/// and is maintained through every account create/update/delete.
pub struct AccountPool {
    config: PoolConfig,
    loader: Arc<dyn Loader>,
    registrar: Arc<dyn RegistrarClient>,
    views: RwLock<HashMap<SmolStr, IndexedView>>,
    registrations: ThrottledQueue<Arc<Account>>,
}

impl AccountPool {
    pub fn new(
        config: PoolConfig,
        loader: Arc<dyn Loader>,
        registrar: Arc<dyn RegistrarClient>,
    ) -> Arc<Self> {
        let mut views = HashMap::new();
        views.insert(
            SmolStr::new(DEFAULT_VIEW_TEMPLATE),
            IndexedView {
                formatter: Formatter::identity(),
                map: HashMap::new(),
            },
        );

        let queue_registrar = Arc::clone(&registrar);
        let registration_required = config.registration_required;
        let registrations = ThrottledQueue::new(
            Duration::from_millis(config.registration_throttling_rate_ms),
            move |account: Arc<Account>| {
                if registration_required {
                    account.set_registration(RegistrationState::Pending);
                    queue_registrar.register(&account);
                } else {
                    account.set_registration(RegistrationState::Ok);
                }
            },
        );

        Arc::new(Self {
            config,
            loader,
            registrar,
            views: RwLock::new(views),
            registrations,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Loads the whole account set from the loader.
    ///
    /// Also invoked again after a pub/sub reconnection, where upstream
    /// changes may have been missed.
    pub async fn initial_load(&self) -> Result<()> {
        let records = self.loader.initial_load().await?;
        info!(count = records.len(), "loading account pool");
        for record in records {
            self.setup_new_account(&record);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.views
            .read()
            .get(DEFAULT_VIEW_TEMPLATE)
            .map(|view| view.map.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every pooled account.
    pub fn accounts(&self) -> Vec<Arc<Account>> {
        self.views
            .read()
            .get(DEFAULT_VIEW_TEMPLATE)
            .map(|view| view.map.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Ensures the view for `template` exists, populating it from the
    /// current account set. Insert collisions keep the first binding.
    pub fn get_or_create_view(&self, template: &str) -> Result<()> {
        let mut views = self.views.write();
        if views.contains_key(template) {
            return Ok(());
        }
        let formatter = Formatter::parse(template)?;
        let mut map = HashMap::new();
        if let Some(default_view) = views.get(DEFAULT_VIEW_TEMPLATE) {
            map.reserve(default_view.map.len());
            for account in default_view.map.values() {
                let key = formatter.format(account);
                if let Some(existing) = map.get(&key) {
                    warn!(
                        template,
                        key,
                        account = %account.identity(),
                        existing = %view_identity(existing),
                        "view key collision, keeping first binding"
                    );
                    continue;
                }
                map.insert(key, Arc::clone(account));
            }
        }
        views.insert(SmolStr::new(template), IndexedView { formatter, map });
        Ok(())
    }

    /// Looks an account up through a view. The view must have been
    /// created beforehand.
    pub fn lookup(&self, template: &str, key: &str) -> Option<Arc<Account>> {
        self.views
            .read()
            .get(template)
            .and_then(|view| view.map.get(key).cloned())
    }

    /// Returns an available account via linear probing from a random
    /// start, or `None` when every line is saturated.
    pub fn get_account_randomly(&self) -> Option<Arc<Account>> {
        let views = self.views.read();
        let accounts: Vec<&Arc<Account>> = views
            .get(DEFAULT_VIEW_TEMPLATE)
            .map(|view| view.map.values().collect())
            .unwrap_or_default();
        if accounts.is_empty() {
            return None;
        }

        let start = rand::thread_rng().gen_range(0..accounts.len());
        (0..accounts.len())
            .map(|i| accounts[(start + i) % accounts.len()])
            .find(|account| account.is_available())
            .cloned()
    }

    /// Applies a pub/sub-driven change for one account URI.
    pub async fn account_update_needed(self: &Arc<Self>, uri: &str) {
        match self.loader.account_update(uri).await {
            Ok(record) => self.on_account_update(uri, record),
            Err(error) => error!(uri, %error, "account re-fetch failed"),
        }
    }

    /// Create/update/delete dispatch after a loader re-fetch.
    pub fn on_account_update(&self, uri: &str, record: Option<AccountRecord>) {
        let Some(record) = record else {
            self.remove_account(uri);
            return;
        };

        if record.uri != uri {
            error!(
                published = uri,
                loaded = record.uri,
                "inconsistent account data between publish and loader, aborting"
            );
            return;
        }

        let existing = self.lookup(DEFAULT_VIEW_TEMPLATE, uri);
        match existing {
            None => self.setup_new_account(&record),
            Some(account) => self.update_account(&account, &record),
        }
    }

    /// Unregisters the whole fleet on clean stop, when configured.
    pub fn shutdown(&self) {
        if !self.config.unregister_on_server_shutdown {
            return;
        }
        let views = self.views.read();
        if let Some(default_view) = views.get(DEFAULT_VIEW_TEMPLATE) {
            for account in default_view.map.values() {
                self.registrar.deregister(account);
            }
        }
    }

    fn setup_new_account(&self, record: &AccountRecord) {
        if record.uri.is_empty() {
            error!("account record is missing a uri, skipping");
            return;
        }
        let Some(identity) = SipUri::parse(&record.uri) else {
            error!(uri = %record.uri, "account record has an invalid uri, skipping");
            return;
        };

        let outbound_proxy = account_outbound_proxy(record, &self.config);
        let mut account = Account::new(identity, self.config.max_calls_per_line)
            .with_alias(record.alias.as_str())
            .with_outbound_proxy(outbound_proxy);
        if !record.userid.is_empty() {
            account = account.with_userid(record.userid.as_str());
        }
        if !record.realm.is_empty() {
            account = account.with_realm(record.realm.as_str());
        }
        if let Some(credential) = record_credential(record) {
            account = account.with_credential(credential);
        }

        let account = Arc::new(account);
        if !self.try_emplace(&account) {
            return;
        }
        self.registrations.enqueue(account);
    }

    fn update_account(&self, account: &Arc<Account>, record: &AccountRecord) {
        let mut views = self.views.write();

        // Capture current keys before mutating the account.
        let previous: Vec<(SmolStr, String)> = views
            .iter()
            .filter(|(template, _)| template.as_str() != DEFAULT_VIEW_TEMPLATE)
            .map(|(template, view)| (template.clone(), view.formatter.format(account)))
            .collect();

        account.set_alias(record.alias.as_str());
        account.set_credential(record_credential(record));
        account.set_outbound_proxy(account_outbound_proxy(record, &self.config));
        debug!(uri = %account.identity(), "account updated");

        for (template, previous_key) in previous {
            let Some(view) = views.get_mut(&template) else {
                continue;
            };
            let new_key = view.formatter.format(account);
            if new_key == previous_key {
                continue;
            }
            view.map.remove(&previous_key);
            if view.map.contains_key(&new_key) {
                warn!(
                    template = %template,
                    key = %new_key,
                    "updated account key collides, binding discarded"
                );
                continue;
            }
            view.map.insert(new_key, Arc::clone(account));
        }
    }

    fn remove_account(&self, uri: &str) {
        let mut views = self.views.write();
        let Some(account) = views
            .get(DEFAULT_VIEW_TEMPLATE)
            .and_then(|view| view.map.get(uri).cloned())
        else {
            warn!(uri, "no account found to delete");
            return;
        };

        self.registrar.deregister(&account);
        for (template, view) in views.iter_mut() {
            if template.as_str() == DEFAULT_VIEW_TEMPLATE {
                continue;
            }
            let key = view.formatter.format(&account);
            view.map.remove(&key);
        }
        if let Some(default_view) = views.get_mut(DEFAULT_VIEW_TEMPLATE) {
            default_view.map.remove(uri);
        }
        info!(uri, "account removed from pool");
    }

    fn try_emplace(&self, account: &Arc<Account>) -> bool {
        let mut views = self.views.write();

        let default_key = {
            let Some(default_view) = views.get_mut(DEFAULT_VIEW_TEMPLATE) else {
                return false;
            };
            let key = default_view.formatter.format(account);
            if key.is_empty() {
                error!("account formats to an empty uri key, skipping");
                return false;
            }
            if default_view.map.contains_key(&key) {
                warn!(key, "account uri already present, skipping");
                return false;
            }
            default_view.map.insert(key.clone(), Arc::clone(account));
            key
        };

        for (template, view) in views.iter_mut() {
            if template.as_str() == DEFAULT_VIEW_TEMPLATE {
                continue;
            }
            let key = view.formatter.format(account);
            if view.map.contains_key(&key) {
                warn!(
                    template = %template,
                    key,
                    account = %default_key,
                    "view key collision, keeping first binding"
                );
                continue;
            }
            view.map.insert(key, Arc::clone(account));
        }
        true
    }
}

fn record_credential(record: &AccountRecord) -> Option<Credential> {
    if record.secret.is_empty() {
        return None;
    }
    let secret = SmolStr::new(record.secret.as_str());
    Some(match record.secret_type {
        SecretType::Cleartext => Credential::Cleartext(secret),
        SecretType::Md5 => Credential::Md5Ha1(secret),
        SecretType::Sha256 => Credential::Sha256Ha1(secret),
    })
}

fn account_outbound_proxy(record: &AccountRecord, config: &PoolConfig) -> Option<SipUri> {
    if record.outbound_proxy.is_empty() {
        return config.outbound_proxy.clone();
    }
    match SipUri::parse(&record.outbound_proxy) {
        Some(proxy) => Some(proxy),
        None => {
            error!(proxy = %record.outbound_proxy, "bad outbound proxy format, using pool default");
            config.outbound_proxy.clone()
        }
    }
}

fn view_identity(account: &Arc<Account>) -> String {
    account.identity().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::StaticLoader;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MockRegistrar {
        registered: Mutex<Vec<String>>,
        deregistered: Mutex<Vec<String>>,
    }

    impl RegistrarClient for MockRegistrar {
        fn register(&self, account: &Arc<Account>) {
            self.registered.lock().push(account.identity().to_string());
            account.set_registration(RegistrationState::Ok);
        }

        fn deregister(&self, account: &Arc<Account>) {
            self.deregistered.lock().push(account.identity().to_string());
            account.set_registration(RegistrationState::None);
        }
    }

    fn record(user: &str, alias: &str) -> AccountRecord {
        AccountRecord {
            uri: format!("sip:{}@provider.example", user),
            alias: alias.to_owned(),
            ..Default::default()
        }
    }

    fn pool_with(
        records: Vec<AccountRecord>,
    ) -> (Arc<AccountPool>, Arc<StaticLoader>, Arc<MockRegistrar>) {
        let loader = Arc::new(StaticLoader::new(records));
        let registrar = Arc::new(MockRegistrar::default());
        let config = PoolConfig {
            registration_throttling_rate_ms: 1,
            ..PoolConfig::default()
        };
        let pool = AccountPool::new(config, loader.clone(), registrar.clone());
        (pool, loader, registrar)
    }

    async fn wait_until_registered(pool: &AccountPool, count: usize) {
        for _ in 0..200 {
            let accounts = pool.accounts();
            if accounts.len() == count
                && accounts
                    .iter()
                    .all(|a| a.registration() == RegistrationState::Ok)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("accounts never became available");
    }

    #[tokio::test]
    async fn initial_load_registers_all_accounts() {
        let (pool, _, registrar) = pool_with(vec![record("line1", "a"), record("line2", "b")]);
        pool.initial_load().await.unwrap();
        assert_eq!(pool.len(), 2);
        wait_until_registered(&pool, 2).await;
        assert_eq!(registrar.registered.lock().len(), 2);
    }

    #[tokio::test]
    async fn views_are_maintained_on_create_update_delete() {
        let (pool, loader, registrar) = pool_with(vec![record("line1", "desk-1")]);
        pool.initial_load().await.unwrap();
        pool.get_or_create_view("{alias}").unwrap();
        assert!(pool.lookup("{alias}", "desk-1").is_some());

        // Update: alias changes, binding migrates.
        let mut updated = record("line1", "desk-9");
        updated.secret = "h4sh".into();
        updated.secret_type = SecretType::Md5;
        loader.upsert(updated);
        pool.account_update_needed("sip:line1@provider.example").await;
        assert!(pool.lookup("{alias}", "desk-1").is_none());
        let account = pool.lookup("{alias}", "desk-9").expect("migrated binding");
        assert_eq!(
            account.credential(),
            Some(Credential::Md5Ha1("h4sh".into()))
        );

        // Create via update event.
        loader.upsert(record("line2", "desk-2"));
        pool.account_update_needed("sip:line2@provider.example").await;
        assert_eq!(pool.len(), 2);
        assert!(pool.lookup("{alias}", "desk-2").is_some());

        // Delete: account leaves every view and deregisters.
        loader.remove("sip:line1@provider.example");
        pool.account_update_needed("sip:line1@provider.example").await;
        assert_eq!(pool.len(), 1);
        assert!(pool.lookup("{alias}", "desk-9").is_none());
        assert_eq!(registrar.deregistered.lock().len(), 1);
    }

    #[tokio::test]
    async fn view_collisions_keep_first_binding() {
        let (pool, _, _) = pool_with(vec![record("line1", "same"), record("line2", "same")]);
        pool.initial_load().await.unwrap();
        pool.get_or_create_view("{alias}").unwrap();
        // One of the two won; the view stays consistent.
        assert!(pool.lookup("{alias}", "same").is_some());
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn random_selection_skips_saturated_accounts() {
        let (pool, _, _) = pool_with(vec![record("line1", "a"), record("line2", "b")]);
        pool.initial_load().await.unwrap();
        wait_until_registered(&pool, 2).await;

        // Saturate one line; selection must return the other.
        let busy = pool
            .lookup("{uri}", "sip:line1@provider.example")
            .unwrap();
        assert!(busy.take_call_slot());
        for _ in 0..20 {
            let picked = pool.get_account_randomly().expect("an account is free");
            assert_eq!(picked.identity().user(), Some("line2"));
        }

        // Saturate everything: no account is returned.
        let other = pool
            .lookup("{uri}", "sip:line2@provider.example")
            .unwrap();
        assert!(other.take_call_slot());
        assert!(pool.get_account_randomly().is_none());
    }

    #[tokio::test]
    async fn duplicate_uri_is_rejected() {
        let (pool, _, _) = pool_with(vec![record("line1", "a")]);
        pool.initial_load().await.unwrap();
        // Second load of the same record must not double-insert.
        pool.initial_load().await.unwrap();
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_deregisters_when_configured() {
        let (pool, _, registrar) = pool_with(vec![record("line1", "a")]);
        pool.initial_load().await.unwrap();
        wait_until_registered(&pool, 1).await;
        pool.shutdown();
        assert_eq!(registrar.deregistered.lock().len(), 1);
    }
}

// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Live account updates over pub/sub.
//!
//! The external channel is `flexisip/B2BUA/account`; messages are JSON
//! envelopes `{"action": "update"|"delete", "uri": "sip:..."}`. Whatever
//! transport carries the channel, its client feeds [`PubSubEvent`]s into
//! [`run_account_updates`].

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::pool::AccountPool;

/// Channel the pool subscribes to for account changes.
pub const ACCOUNT_UPDATE_CHANNEL: &str = "flexisip/B2BUA/account";

/// The pub/sub message envelope.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccountPub {
    pub action: String,
    pub uri: String,
}

/// Events the pub/sub client delivers to the pool.
#[derive(Debug, Clone)]
pub enum PubSubEvent {
    /// A raw payload published on [`ACCOUNT_UPDATE_CHANNEL`].
    Message(String),
    /// Connection lost; the pool logs and waits for the client to redial.
    Disconnected,
    /// Subscription re-established: upstream changes may have been missed,
    /// so the pool reloads from the loader.
    Subscribed,
}

/// Drives pool updates from a pub/sub event stream until it closes.
pub async fn run_account_updates(pool: Arc<AccountPool>, mut events: mpsc::Receiver<PubSubEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            PubSubEvent::Message(payload) => {
                let publication: AccountPub = match serde_json::from_str(&payload) {
                    Ok(publication) => publication,
                    Err(error) => {
                        error!(%error, payload, "malformed account publication");
                        continue;
                    }
                };
                debug!(action = %publication.action, uri = %publication.uri, "account publication");
                // The loader is the source of truth; the action only hints
                // at what the re-fetch will find.
                pool.account_update_needed(&publication.uri).await;
            }
            PubSubEvent::Disconnected => {
                warn!(channel = ACCOUNT_UPDATE_CHANNEL, "pub/sub disconnected, awaiting reconnection");
            }
            PubSubEvent::Subscribed => {
                info!(channel = ACCOUNT_UPDATE_CHANNEL, "pub/sub subscribed, reloading accounts");
                if let Err(error) = pool.initial_load().await {
                    error!(%error, "account reload after resubscribe failed");
                }
            }
        }
    }
    debug!("account update stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{AccountRecord, StaticLoader};
    use crate::pool::{PoolConfig, RegistrarClient};
    use crate::Account;

    struct NullRegistrar;

    impl RegistrarClient for NullRegistrar {
        fn register(&self, account: &Arc<Account>) {
            account.set_registration(crate::RegistrationState::Ok);
        }
        fn deregister(&self, _account: &Arc<Account>) {}
    }

    #[test]
    fn envelope_parses() {
        let publication: AccountPub =
            serde_json::from_str(r#"{"action": "update", "uri": "sip:line1@provider.example"}"#)
                .unwrap();
        assert_eq!(publication.action, "update");
        assert_eq!(publication.uri, "sip:line1@provider.example");
    }

    #[tokio::test]
    async fn messages_drive_pool_updates() {
        let loader = Arc::new(StaticLoader::default());
        let pool = AccountPool::new(
            PoolConfig {
                registration_throttling_rate_ms: 1,
                ..PoolConfig::default()
            },
            loader.clone(),
            Arc::new(NullRegistrar),
        );

        let (tx, rx) = mpsc::channel(8);
        let driver = tokio::spawn(run_account_updates(pool.clone(), rx));

        // Upstream created an account, then published.
        loader.upsert(AccountRecord {
            uri: "sip:line1@provider.example".into(),
            ..Default::default()
        });
        tx.send(PubSubEvent::Message(
            r#"{"action": "update", "uri": "sip:line1@provider.example"}"#.into(),
        ))
        .await
        .unwrap();

        // Malformed payloads are logged and skipped.
        tx.send(PubSubEvent::Message("not json".into())).await.unwrap();

        // Deletion publication after upstream removal.
        loader.remove("sip:line1@provider.example");
        tx.send(PubSubEvent::Message(
            r#"{"action": "delete", "uri": "sip:line1@provider.example"}"#.into(),
        ))
        .await
        .unwrap();

        drop(tx);
        driver.await.unwrap();
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn resubscribe_triggers_fresh_load() {
        let loader = Arc::new(StaticLoader::default());
        let pool = AccountPool::new(
            PoolConfig {
                registration_throttling_rate_ms: 1,
                ..PoolConfig::default()
            },
            loader.clone(),
            Arc::new(NullRegistrar),
        );

        let (tx, rx) = mpsc::channel(8);
        let driver = tokio::spawn(run_account_updates(pool.clone(), rx));

        // Accounts appeared while we were disconnected.
        loader.upsert(AccountRecord {
            uri: "sip:line1@provider.example".into(),
            ..Default::default()
        });
        tx.send(PubSubEvent::Disconnected).await.unwrap();
        tx.send(PubSubEvent::Subscribed).await.unwrap();

        drop(tx);
        driver.await.unwrap();
        assert_eq!(pool.len(), 1);
    }
}

// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

/// How an account record's secret is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretType {
    #[default]
    Cleartext,
    Md5,
    Sha256,
}

/// One account as described by the external source.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccountRecord {
    pub uri: String,
    pub secret: String,
    #[serde(rename = "secretType")]
    pub secret_type: SecretType,
    pub userid: String,
    pub realm: String,
    pub alias: String,
    #[serde(rename = "outboundProxy")]
    pub outbound_proxy: String,
}

/// Source of account records.
///
/// `account_update` re-fetches a single record after a pub/sub event;
/// `Ok(None)` means the account was deleted upstream.
#[async_trait]
pub trait Loader: Send + Sync + 'static {
    async fn initial_load(&self) -> Result<Vec<AccountRecord>>;
    async fn account_update(&self, uri: &str) -> Result<Option<AccountRecord>>;
}

/// In-memory loader used by tests; records can be mutated to simulate
/// upstream changes.
#[derive(Debug, Default)]
pub struct StaticLoader {
    records: DashMap<String, AccountRecord>,
}

impl StaticLoader {
    pub fn new(records: Vec<AccountRecord>) -> Self {
        let loader = Self::default();
        for record in records {
            loader.upsert(record);
        }
        loader
    }

    pub fn upsert(&self, record: AccountRecord) {
        self.records.insert(record.uri.clone(), record);
    }

    pub fn remove(&self, uri: &str) {
        self.records.remove(uri);
    }
}

#[async_trait]
impl Loader for StaticLoader {
    async fn initial_load(&self) -> Result<Vec<AccountRecord>> {
        Ok(self.records.iter().map(|e| e.value().clone()).collect())
    }

    async fn account_update(&self, uri: &str) -> Result<Option<AccountRecord>> {
        Ok(self.records.get(uri).map(|e| e.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_deserialize_from_json() {
        let record: AccountRecord = serde_json::from_str(
            r#"{
                "uri": "sip:line1@provider.example",
                "secret": "ab54d",
                "secretType": "md5",
                "alias": "desk-1",
                "outboundProxy": "sip:gw.provider.example:5061"
            }"#,
        )
        .unwrap();
        assert_eq!(record.secret_type, SecretType::Md5);
        assert_eq!(record.alias, "desk-1");
        assert!(record.userid.is_empty());
    }

    #[tokio::test]
    async fn static_loader_round_trips() {
        let loader = StaticLoader::new(vec![AccountRecord {
            uri: "sip:line1@provider.example".into(),
            ..Default::default()
        }]);
        assert_eq!(loader.initial_load().await.unwrap().len(), 1);
        assert!(loader
            .account_update("sip:line1@provider.example")
            .await
            .unwrap()
            .is_some());
        loader.remove("sip:line1@provider.example");
        assert!(loader
            .account_update("sip:line1@provider.example")
            .await
            .unwrap()
            .is_none());
    }
}

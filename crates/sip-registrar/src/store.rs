// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Backing-store seam for registrar bindings.
//!
//! The conventional deployment keeps the serialised binding set under
//! `fs:<aor>` and publishes invalidations on the `fs:registrar` channel;
//! the index consumes those events via [`RegistrarIndex::invalidate`].
//!
//! [`RegistrarIndex::invalidate`]: crate::RegistrarIndex::invalidate

use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tokio::sync::broadcast;

use sip_core::SipUri;

use crate::{Binding, PushParams};

/// Serialised form of a binding, with absolute wall-clock expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredBinding {
    pub contact: String,
    pub instance_id: String,
    pub expires_at: DateTime<Utc>,
    pub q: f32,
    #[serde(default)]
    pub push: Option<(String, String, String)>,
    #[serde(default)]
    pub message_expires: Option<u32>,
    pub call_id: String,
    pub cseq: u32,
    pub generation: u64,
}

impl StoredBinding {
    pub fn from_binding(binding: &Binding) -> Self {
        let remaining = binding
            .expires_at
            .saturating_duration_since(Instant::now());
        Self {
            contact: binding.contact.to_string(),
            instance_id: binding.instance_id.to_string(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(remaining).unwrap_or_default(),
            q: binding.q,
            push: binding
                .push
                .as_ref()
                .map(|p| (p.provider.to_string(), p.prid.to_string(), p.param.to_string())),
            message_expires: binding.message_expires,
            call_id: binding.call_id.to_string(),
            cseq: binding.cseq,
            generation: binding.generation,
        }
    }

    pub fn into_binding(self) -> Option<Binding> {
        let remaining = (self.expires_at - Utc::now()).to_std().ok()?;
        Some(Binding {
            contact: SipUri::parse(&self.contact)?,
            instance_id: SmolStr::new(self.instance_id),
            expires_at: Instant::now() + remaining,
            q: self.q,
            push: self.push.map(|(provider, prid, param)| PushParams {
                provider: SmolStr::new(provider),
                prid: SmolStr::new(prid),
                param: SmolStr::new(param),
            }),
            message_expires: self.message_expires,
            call_id: SmolStr::new(self.call_id),
            cseq: self.cseq,
            generation: self.generation,
        })
    }
}

/// External persistence for binding sets, keyed by canonical AOR.
#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    async fn load(&self, aor_key: &str) -> Result<Vec<Binding>>;
    async fn save(&self, aor_key: &str, bindings: &[Binding]) -> Result<()>;
}

/// In-process store with an invalidation channel, used in tests and
/// single-node deployments.
pub struct MemoryBackingStore {
    entries: DashMap<String, Vec<StoredBinding>>,
    invalidations: broadcast::Sender<String>,
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        let (invalidations, _) = broadcast::channel(64);
        Self {
            entries: DashMap::new(),
            invalidations,
        }
    }

    /// Stream of AOR keys whose stored set changed.
    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<String> {
        self.invalidations.subscribe()
    }

    /// Drops a stored set out-of-band, as another node would.
    pub fn evict(&self, aor_key: &str) {
        self.entries.remove(aor_key);
        let _ = self.invalidations.send(aor_key.to_owned());
    }
}

impl Default for MemoryBackingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn load(&self, aor_key: &str) -> Result<Vec<Binding>> {
        Ok(self
            .entries
            .get(aor_key)
            .map(|stored| {
                stored
                    .iter()
                    .cloned()
                    .filter_map(StoredBinding::into_binding)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn save(&self, aor_key: &str, bindings: &[Binding]) -> Result<()> {
        let stored: Vec<_> = bindings.iter().map(StoredBinding::from_binding).collect();
        self.entries.insert(aor_key.to_owned(), stored);
        let _ = self.invalidations.send(aor_key.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RegistrarIndex;
    use std::sync::Arc;
    use std::time::Duration;

    fn binding(host: &str) -> Binding {
        Binding {
            contact: SipUri::parse(&format!("sip:callee@{}", host)).unwrap(),
            instance_id: SmolStr::new("urn:uuid:1"),
            expires_at: Instant::now() + Duration::from_secs(600),
            q: 1.0,
            push: None,
            message_expires: None,
            call_id: SmolStr::new("c1"),
            cseq: 1,
            generation: 0,
        }
    }

    #[tokio::test]
    async fn save_load_round_trips() {
        let store = MemoryBackingStore::new();
        store.save("sip:callee@sip.test.org", &[binding("10.0.0.2")]).await.unwrap();
        let loaded = store.load("sip:callee@sip.test.org").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].contact.host(), "10.0.0.2");
        assert!(!loaded[0].is_expired());
    }

    #[tokio::test]
    async fn serialised_form_is_json_compatible() {
        let stored = StoredBinding::from_binding(&binding("10.0.0.2"));
        let json = serde_json::to_string(&stored).unwrap();
        let back: StoredBinding = serde_json::from_str(&json).unwrap();
        assert_eq!(back.instance_id, "urn:uuid:1");
    }

    #[tokio::test]
    async fn invalidation_marks_index_dirty_and_reloads() {
        let store = Arc::new(MemoryBackingStore::new());
        let index = RegistrarIndex::with_store(store.clone());
        let aor = SipUri::parse("sip:callee@sip.test.org").unwrap();

        index
            .bind(
                &aor,
                vec![crate::ContactUpdate {
                    contact: SipUri::parse("sip:callee@10.0.0.2").unwrap(),
                    instance_id: SmolStr::new("urn:uuid:1"),
                    expires: Duration::from_secs(600),
                    q: 1.0,
                    push: None,
                    message_expires: None,
                }],
                "c1",
                1,
            )
            .await
            .unwrap();
        assert_eq!(index.fetch(&aor).await.len(), 1);

        // Another node removed the registration behind our back.
        store.evict(&aor.aor());
        index.invalidate(&aor.aor());
        assert!(index.fetch(&aor).await.is_empty());
    }
}

// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Location service: the mapping from an address-of-record to its
//! registered contact bindings.
//!
//! Bindings are keyed by device instance-id, carry an absolute expiry and
//! optional push parameters, and obey RFC 3261 §10.3 Call-ID/CSeq
//! replacement rules. Interested parties (fork-late) subscribe per AOR and
//! are notified as devices register.
//!
//! Bindings live in-process; an optional [`BackingStore`] mirrors them to
//! an external database whose invalidation events mark the local cache
//! dirty for lazy reload.

pub mod contact;
pub mod store;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use smol_str::SmolStr;
use tracing::{debug, info, warn};

use sip_core::SipUri;

pub use contact::ContactUpdate;
pub use store::{BackingStore, MemoryBackingStore, StoredBinding};

/// Push-notification routing parameters carried in a contact URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushParams {
    pub provider: SmolStr,
    pub prid: SmolStr,
    pub param: SmolStr,
}

/// One registered contact of an AOR.
#[derive(Debug, Clone)]
pub struct Binding {
    pub contact: SipUri,
    /// `+sip.instance` value, or the contact URI text when absent.
    pub instance_id: SmolStr,
    pub expires_at: Instant,
    /// Preference, 0.0 to 1.0.
    pub q: f32,
    pub push: Option<PushParams>,
    /// Per-binding override for paging-message delivery.
    pub message_expires: Option<u32>,
    pub call_id: SmolStr,
    pub cseq: u32,
    /// Registrar-assigned insertion generation, monotonic per process.
    pub generation: u64,
}

impl Binding {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Whether MESSAGE forking may target this binding.
    pub fn accepts_messages(&self) -> bool {
        self.message_expires != Some(0)
    }

    /// A binding that registered with push parameters may be reachable by
    /// wakeup even when its transport is gone; the fork engine treats it
    /// as a candidate for late delivery.
    pub fn has_push_params(&self) -> bool {
        self.push.is_some()
    }
}

/// Observer of binding changes for one AOR.
pub trait ContactListener: Send + Sync {
    fn on_contact_registered(&self, aor: &str, binding: &Binding);
}

/// Errors from [`RegistrarIndex::bind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    /// Same Call-ID with a CSeq not greater than the stored one.
    CSeqOutOfOrder,
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindError::CSeqOutOfOrder => write!(f, "CSeq not newer than stored binding"),
        }
    }
}

impl std::error::Error for BindError {}

#[derive(Default)]
struct AorRecord {
    bindings: Vec<Binding>,
    /// Set when the backing store published an invalidation; the next
    /// fetch reloads before answering.
    dirty: bool,
}

/// Process-wide AOR index.
///
/// Operations for one AOR are linearised on its map entry; the store
/// write-through happens after the in-memory state is settled.
pub struct RegistrarIndex {
    records: DashMap<String, AorRecord>,
    listeners: DashMap<String, Vec<Weak<dyn ContactListener>>>,
    generation: AtomicU64,
    store: Option<Arc<dyn BackingStore>>,
}

impl RegistrarIndex {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            listeners: DashMap::new(),
            generation: AtomicU64::new(0),
            store: None,
        }
    }

    pub fn with_store(store: Arc<dyn BackingStore>) -> Self {
        let mut index = Self::new();
        index.store = Some(store);
        index
    }

    /// Applies a REGISTER's contact set to the AOR.
    ///
    /// Bindings are upserted keyed by instance-id; an update with
    /// `expires == 0` removes the binding. Within one Call-ID the CSeq
    /// must increase (RFC 3261 §10.3). Returns the resulting binding set.
    pub async fn bind(
        &self,
        aor: &SipUri,
        updates: Vec<ContactUpdate>,
        call_id: &str,
        cseq: u32,
    ) -> Result<Vec<Binding>, BindError> {
        let key = aor.aor();
        let mut registered = Vec::new();

        let snapshot = {
            let mut record = self.records.entry(key.clone()).or_default();

            for update in updates {
                let slot = record
                    .bindings
                    .iter()
                    .position(|b| b.instance_id == update.instance_id);

                if let Some(i) = slot {
                    let stored = &record.bindings[i];
                    if stored.call_id == call_id && cseq <= stored.cseq {
                        warn!(aor = %key, call_id, cseq, "rejecting out-of-order REGISTER");
                        return Err(BindError::CSeqOutOfOrder);
                    }
                }

                if update.expires == Duration::ZERO {
                    if let Some(i) = slot {
                        debug!(aor = %key, instance = %update.instance_id, "unregistering contact");
                        record.bindings.remove(i);
                    }
                    continue;
                }

                let binding = Binding {
                    contact: update.contact,
                    instance_id: update.instance_id,
                    expires_at: Instant::now() + update.expires,
                    q: update.q,
                    push: update.push,
                    message_expires: update.message_expires,
                    call_id: SmolStr::new(call_id.to_owned()),
                    cseq,
                    generation: self.generation.fetch_add(1, Ordering::Relaxed),
                };
                match slot {
                    Some(i) => record.bindings[i] = binding.clone(),
                    None => record.bindings.push(binding.clone()),
                }
                registered.push(binding);
            }

            record.bindings.retain(|b| !b.is_expired());
            record.bindings.clone()
        };

        if let Some(store) = &self.store {
            if let Err(error) = store.save(&key, &snapshot).await {
                warn!(aor = %key, %error, "backing store write failed");
            }
        }

        for binding in &registered {
            info!(aor = %key, contact = %binding.contact, "contact registered");
            self.notify(&key, binding);
        }

        Ok(snapshot)
    }

    /// Current unexpired bindings for the AOR.
    ///
    /// When a backing store is configured and the cache entry was
    /// invalidated (or never loaded), the set is reloaded first; this is a
    /// suspension point for the calling request.
    pub async fn fetch(&self, aor: &SipUri) -> Vec<Binding> {
        let key = aor.aor();

        if let Some(store) = &self.store {
            let needs_reload = match self.records.get(&key) {
                Some(record) => record.dirty,
                None => true,
            };
            if needs_reload {
                match store.load(&key).await {
                    Ok(bindings) => {
                        let mut record = self.records.entry(key.clone()).or_default();
                        record.bindings = bindings;
                        record.dirty = false;
                    }
                    Err(error) => {
                        warn!(aor = %key, %error, "backing store read failed, serving cache");
                    }
                }
            }
        }

        self.records
            .get(&key)
            .map(|record| {
                record
                    .bindings
                    .iter()
                    .filter(|b| !b.is_expired())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Registers a listener for future binding changes on the AOR.
    pub fn subscribe(&self, aor: &SipUri, listener: Weak<dyn ContactListener>) {
        self.listeners.entry(aor.aor()).or_default().push(listener);
    }

    /// Marks the cached set for the AOR stale (backing-store pub/sub).
    pub fn invalidate(&self, aor_key: &str) {
        if let Some(mut record) = self.records.get_mut(aor_key) {
            record.dirty = true;
        }
    }

    /// Drops expired bindings everywhere. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        for mut record in self.records.iter_mut() {
            let before = record.bindings.len();
            record.bindings.retain(|b| !b.is_expired());
            removed += before - record.bindings.len();
        }
        removed
    }

    fn notify(&self, key: &str, binding: &Binding) {
        if let Some(mut listeners) = self.listeners.get_mut(key) {
            listeners.retain(|weak| match weak.upgrade() {
                Some(listener) => {
                    listener.on_contact_registered(key, binding);
                    true
                }
                None => false,
            });
        }
    }
}

impl Default for RegistrarIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn aor() -> SipUri {
        SipUri::parse("sip:callee@sip.test.org").unwrap()
    }

    fn update(contact: &str, instance: &str, expires: u64) -> ContactUpdate {
        ContactUpdate {
            contact: SipUri::parse(contact).unwrap(),
            instance_id: SmolStr::new(instance),
            expires: Duration::from_secs(expires),
            q: 1.0,
            push: None,
            message_expires: None,
        }
    }

    #[tokio::test]
    async fn bind_then_fetch_round_trips() {
        let index = RegistrarIndex::new();
        index
            .bind(&aor(), vec![update("sip:callee@10.0.0.2", "urn:uuid:1", 3600)], "c1", 1)
            .await
            .unwrap();

        let bindings = index.fetch(&aor()).await;
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].contact.host(), "10.0.0.2");
    }

    #[tokio::test]
    async fn one_binding_per_instance_id() {
        let index = RegistrarIndex::new();
        index
            .bind(&aor(), vec![update("sip:callee@10.0.0.2", "urn:uuid:1", 3600)], "c1", 1)
            .await
            .unwrap();
        // Same device re-registers from a new address.
        index
            .bind(&aor(), vec![update("sip:callee@10.0.0.9", "urn:uuid:1", 3600)], "c2", 1)
            .await
            .unwrap();

        let bindings = index.fetch(&aor()).await;
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].contact.host(), "10.0.0.9");
    }

    #[tokio::test]
    async fn cseq_must_increase_within_call_id() {
        let index = RegistrarIndex::new();
        index
            .bind(&aor(), vec![update("sip:callee@10.0.0.2", "urn:uuid:1", 3600)], "c1", 5)
            .await
            .unwrap();

        let err = index
            .bind(&aor(), vec![update("sip:callee@10.0.0.2", "urn:uuid:1", 3600)], "c1", 5)
            .await
            .unwrap_err();
        assert_eq!(err, BindError::CSeqOutOfOrder);

        // A different Call-ID restarts the sequence.
        index
            .bind(&aor(), vec![update("sip:callee@10.0.0.2", "urn:uuid:1", 3600)], "c2", 1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn zero_expires_removes_binding() {
        let index = RegistrarIndex::new();
        index
            .bind(&aor(), vec![update("sip:callee@10.0.0.2", "urn:uuid:1", 3600)], "c1", 1)
            .await
            .unwrap();
        index
            .bind(&aor(), vec![update("sip:callee@10.0.0.2", "urn:uuid:1", 0)], "c1", 2)
            .await
            .unwrap();
        assert!(index.fetch(&aor()).await.is_empty());
    }

    #[tokio::test]
    async fn expired_bindings_are_filtered_and_swept() {
        let index = RegistrarIndex::new();
        index
            .bind(
                &aor(),
                vec![ContactUpdate {
                    expires: Duration::from_millis(5),
                    ..update("sip:callee@10.0.0.2", "urn:uuid:1", 0)
                }],
                "c1",
                1,
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(index.fetch(&aor()).await.is_empty());
        assert_eq!(index.sweep(), 1);
    }

    struct Recorder(Mutex<Vec<String>>);

    impl ContactListener for Recorder {
        fn on_contact_registered(&self, _aor: &str, binding: &Binding) {
            self.0.lock().unwrap().push(binding.contact.to_string());
        }
    }

    #[tokio::test]
    async fn listeners_hear_later_registrations() {
        let index = RegistrarIndex::new();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        index.subscribe(&aor(), Arc::downgrade(&recorder) as Weak<dyn ContactListener>);

        index
            .bind(&aor(), vec![update("sip:callee@10.0.0.7", "urn:uuid:2", 600)], "c9", 1)
            .await
            .unwrap();

        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("10.0.0.7"));
    }

    #[tokio::test]
    async fn dropped_listeners_are_pruned() {
        let index = RegistrarIndex::new();
        {
            let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
            index.subscribe(&aor(), Arc::downgrade(&recorder) as Weak<dyn ContactListener>);
        }
        index
            .bind(&aor(), vec![update("sip:callee@10.0.0.7", "urn:uuid:2", 600)], "c9", 1)
            .await
            .unwrap();
        assert!(index.listeners.get(&aor().aor()).unwrap().is_empty());
    }
}

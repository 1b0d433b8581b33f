// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! One-time digest nonces with expiry and use accounting.
//!
//! The store is the sole authority on replay; callers must not cache
//! validation outcomes.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use smol_str::SmolStr;

/// Outcome of a nonce check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceStatus {
    /// Nonce is live and the use is acceptable.
    Ok,
    /// Nonce exists but is older than the configured expiry; the client
    /// should be re-challenged with `stale=true`.
    Stale,
    /// Nonce was never issued, was consumed, or the nonce-count replayed.
    Unknown,
}

#[derive(Debug)]
struct NonceEntry {
    issued_at: Instant,
    /// Highest nonce-count accepted so far (qop=auth); 0 before first use.
    last_nc: u32,
    /// Set once a qop-less nonce has been spent.
    consumed: bool,
}

/// Process-wide nonce store.
///
/// With `qop_auth` enabled a nonce may be reused as long as the client's
/// nonce-count strictly increases; without it a nonce is single-use.
#[derive(Debug)]
pub struct NonceStore {
    entries: DashMap<SmolStr, NonceEntry>,
    expire: Duration,
    qop_auth: bool,
}

impl NonceStore {
    pub fn new(expire: Duration, qop_auth: bool) -> Self {
        Self {
            entries: DashMap::new(),
            expire,
            qop_auth,
        }
    }

    pub fn qop_auth(&self) -> bool {
        self.qop_auth
    }

    /// Issues a fresh opaque nonce.
    pub fn issue(&self) -> SmolStr {
        let token: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        let nonce = SmolStr::new(token);
        self.entries.insert(
            nonce.clone(),
            NonceEntry {
                issued_at: Instant::now(),
                last_nc: 0,
                consumed: false,
            },
        );
        nonce
    }

    /// Checks a nonce presented by a client, without recording the use.
    pub fn validate(&self, nonce: &str, nc: Option<u32>) -> NonceStatus {
        let entry = match self.entries.get(nonce) {
            Some(entry) => entry,
            None => return NonceStatus::Unknown,
        };

        if entry.issued_at.elapsed() > self.expire {
            return NonceStatus::Stale;
        }

        if self.qop_auth {
            match nc {
                Some(nc) if nc > entry.last_nc => NonceStatus::Ok,
                _ => NonceStatus::Unknown,
            }
        } else if entry.consumed {
            NonceStatus::Unknown
        } else {
            NonceStatus::Ok
        }
    }

    /// Records a successful use after verification.
    pub fn record_use(&self, nonce: &str, nc: Option<u32>) {
        if let Some(mut entry) = self.entries.get_mut(nonce) {
            match nc {
                Some(nc) => entry.last_nc = entry.last_nc.max(nc),
                None => entry.consumed = true,
            }
        }
    }

    /// Drops entries past expiry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.issued_at.elapsed() <= self.expire);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

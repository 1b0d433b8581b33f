// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use smol_str::SmolStr;

/// One stored secret row for a (user, realm) pair.
///
/// A user may have several rows when the backend keeps hashes for more
/// than one algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredSecret {
    Cleartext(SmolStr),
    /// Precomputed `H(user:realm:password)` with MD5.
    Md5Ha1(SmolStr),
    /// Precomputed `H(user:realm:password)` with SHA-256.
    Sha256Ha1(SmolStr),
}

/// Asynchronous credential backend.
///
/// Implementations may block (database, LDAP); callers run the fetch off
/// the event loop and resume on it. A backend failure is an error and maps
/// to 500 at the request level; an unknown user is `Ok(vec![])`.
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    async fn fetch(&self, username: &str, realm: &str) -> Result<Vec<StoredSecret>>;
}

/// In-memory credential store for tests and small deployments.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    rows: DashMap<String, Vec<StoredSecret>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, username: &str, realm: &str, secret: StoredSecret) {
        self.rows
            .entry(key(username, realm))
            .or_default()
            .push(secret);
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn fetch(&self, username: &str, realm: &str) -> Result<Vec<StoredSecret>> {
        Ok(self
            .rows
            .get(&key(username, realm))
            .map(|rows| rows.clone())
            .unwrap_or_default())
    }
}

fn key(username: &str, realm: &str) -> String {
    format!("{}@{}", username, realm)
}

// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Digest authentication for the routing core.
//!
//! The module composes an ordered chain of authenticators; the built-in
//! chain is trusted-host bypass followed by RFC 7616 digest. Nonce replay
//! protection lives in [`NonceStore`], credentials come from an async
//! [`CredentialStore`], and every request completes with exactly one
//! [`AuthDecision`].

pub mod digest;
pub mod module;
pub mod nonce;
pub mod store;

pub use digest::{DigestAlgorithm, DigestCredentials};
pub use module::{AuthConfig, AuthDecision, AuthModule, ChainOutcome};
pub use nonce::{NonceStatus, NonceStore};
pub use store::{CredentialStore, MemoryCredentialStore, StoredSecret};

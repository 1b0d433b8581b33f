// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pool of SIP accounts the B2BUA registers and bridges calls through.
//!
//! Accounts come from a [`Loader`] (file, database, external service),
//! register through a constant-rate queue to avoid burst-registering a
//! fleet, and are looked up through template-indexed views
//! (`"{uri}"`, `"{alias}"`, ...). A pub/sub channel delivers live
//! create/update/delete events.

pub mod account;
pub mod formatter;
pub mod loader;
pub mod pool;
pub mod pubsub;
pub mod throttle;

pub use account::{Account, Credential, RegistrationState};
pub use formatter::Formatter;
pub use loader::{AccountRecord, Loader, SecretType, StaticLoader};
pub use pool::{AccountPool, PoolConfig, RegistrarClient};
pub use pubsub::{run_account_updates, AccountPub, PubSubEvent, ACCOUNT_UPDATE_CHANNEL};
pub use throttle::ThrottledQueue;

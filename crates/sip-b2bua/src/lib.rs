// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Back-to-back user agent.
//!
//! For calls that need mediation (encryption bridging, external provider
//! gateways) the server holds two coupled legs: leg-A faces the caller,
//! leg-B the callee. [`B2buaMediator`] mirrors signalling and media state
//! between them, forwards DTMF, relays blind transfers with sipfrag
//! progress NOTIFYs, bridges SUBSCRIBE dialogs, and re-authors
//! out-of-dialog MWI NOTIFYs.
//!
//! Media itself is out of scope: legs are driven through the
//! [`CallLeg`]/[`CallEngine`] seam implemented over the media stack.

pub mod application;
pub mod call;
pub mod config;
pub mod events;
pub mod mediator;

pub use application::{B2buaApplication, SipBridge, Trenscrypter};
pub use call::{
    CallEngine, CallLeg, CallParams, CallState, DeclineReason, ErrorInfo, EventSubscription,
    LegDirection, MediaDirection, MediaEncryption,
};
pub use config::{ApplicationKind, B2buaConfig};
pub use events::SubscriptionState;
pub use mediator::{B2buaMediator, TransferState, CUSTOM_HEADER};

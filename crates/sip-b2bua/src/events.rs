// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Subscribe/notify bridging and MWI re-authoring.
//!
//! Bridged subscriptions live in a symmetric table: each event id maps to
//! its peer and remembers which side faces the original subscriber.
//! Out-of-dialog MWI NOTIFYs from the provider are re-authored so their
//! Message-Account names the bridged account, then re-emitted.

use std::sync::Arc;

use smol_str::SmolStr;
use tracing::{debug, error, warn};

use sip_core::{MessageSummary, SipUri};

use crate::call::{DeclineReason, EventSubscription};
use crate::mediator::B2buaMediator;

/// One side of a bridged subscription.
pub(crate) struct PeerEvent {
    pub peer: Arc<dyn EventSubscription>,
    pub is_leg_a: bool,
}

/// Subscription lifecycle reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Active,
    Error(DeclineReason),
    Terminated,
}

impl B2buaMediator {
    /// A SUBSCRIBE arrived on leg-A; open the peer subscription.
    pub fn on_subscribe_received(
        &self,
        leg_a: Arc<dyn EventSubscription>,
        to: &SipUri,
        event: &str,
        expires: Option<u32>,
        accept: Option<SmolStr>,
        body: Option<String>,
    ) {
        let Some(expires) = expires else {
            error!("invalid expires in received SUBSCRIBE, denying subscription");
            leg_a.deny(DeclineReason::NotAcceptable);
            return;
        };

        let subscriber = match self.application().on_subscribe(to, event) {
            Ok(subscriber) => subscriber,
            Err(reason) => {
                leg_a.deny(reason);
                return;
            }
        };

        let leg_b = match self
            .engine()
            .subscribe(&subscriber, event, expires, accept, body)
        {
            Ok(leg_b) => leg_b,
            Err(error) => {
                warn!(%error, "peer subscription failed");
                leg_a.deny(DeclineReason::NotAcceptable);
                return;
            }
        };

        debug!(event, %subscriber, "bridging subscription");
        self.events.insert(
            leg_a.id(),
            PeerEvent {
                peer: Arc::clone(&leg_b),
                is_leg_a: true,
            },
        );
        self.events.insert(
            leg_b.id(),
            PeerEvent {
                peer: leg_a,
                is_leg_a: false,
            },
        );
    }

    /// Accept/deny/termination mirroring between the two subscriptions.
    pub fn on_subscription_state_changed(&self, event_id: &str, state: SubscriptionState) {
        let Some(entry) = self.events.get(event_id) else {
            return;
        };
        let is_leg_a = entry.is_leg_a;
        let peer = Arc::clone(&entry.peer);
        drop(entry);

        if is_leg_a {
            if state == SubscriptionState::Terminated {
                peer.terminate();
                self.events.remove(&peer.id());
                self.events.remove(event_id);
            }
        } else {
            match state {
                SubscriptionState::Active => peer.accept(),
                SubscriptionState::Error(reason) => peer.deny(reason),
                SubscriptionState::Terminated => {}
            }
        }
    }

    /// In-dialog NOTIFY forwarded to the opposite side.
    pub fn on_notify_received(&self, event_id: &str, content_type: &str, body: String) {
        let Some(entry) = self.events.get(event_id) else {
            error!(event_id, "no data associated with the event, cannot forward the NOTIFY");
            return;
        };
        entry.peer.notify(content_type, body);
    }

    /// Out-of-dialog MWI NOTIFY from the provider side.
    ///
    /// The Message-Account is re-mapped onto the bridged account and the
    /// summary re-emitted towards the subscriber.
    pub fn on_mwi_received(&self, provider_account: &SipUri, body: &str) {
        let Some(subscriber) = self.application().on_notify_to_be_sent(provider_account) else {
            return;
        };
        let Some(mut summary) = MessageSummary::parse(body) else {
            warn!("malformed message-summary body, dropping MWI NOTIFY");
            return;
        };
        summary.set_account(subscriber.clone());
        debug!(%subscriber, "re-emitting MWI NOTIFY");
        self.engine().send_notify(
            &subscriber,
            "message-summary",
            "application/simple-message-summary",
            summary.render(),
        );
    }
}

// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Call-pair mediation.
//!
//! The mediator owns an arena of call legs keyed by Call-ID plus a peer
//! index of non-owning Call-ID references; a pair dies when both legs
//! reach `Released`. Every state change on one leg is mirrored onto its
//! peer per the bridging table, DTMF is forwarded, and blind transfers
//! are relayed with sipfrag progress NOTIFYs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use smol_str::SmolStr;
use tracing::{debug, error, info, warn};

use sip_core::SipFrag;

use crate::application::B2buaApplication;
use crate::call::{
    CallEngine, CallLeg, CallState, DeclineReason, ErrorInfo, LegDirection, MediaDirection,
};
use crate::config::B2buaConfig;

/// Header marking bridged legs so the proxy does not re-intercept them.
pub const CUSTOM_HEADER: &str = "X-B2BUA";

/// Transfer progress on the transferred leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    OutgoingProgress,
    Connected,
    Error,
}

struct CallPair {
    started_at: Instant,
}

/// The B2BUA server core.
pub struct B2buaMediator {
    engine: Arc<dyn CallEngine>,
    application: B2buaApplication,
    config: B2buaConfig,
    /// Arena: owning slots keyed by Call-ID.
    calls: DashMap<SmolStr, Arc<dyn CallLeg>>,
    /// Non-owning peer references, symmetric.
    peers: DashMap<SmolStr, SmolStr>,
    /// Pair bookkeeping, keyed by leg-A Call-ID.
    pairs: DashMap<SmolStr, CallPair>,
    /// Transfer NOTIFY routing: transferred (leg-B) id → transferor id.
    transfers: DashMap<SmolStr, SmolStr>,
    /// Bridged subscription table, symmetric per event id.
    pub(crate) events: DashMap<SmolStr, crate::events::PeerEvent>,
}

impl B2buaMediator {
    pub fn new(
        engine: Arc<dyn CallEngine>,
        application: B2buaApplication,
        config: B2buaConfig,
    ) -> Self {
        Self {
            engine,
            application,
            config,
            calls: DashMap::new(),
            peers: DashMap::new(),
            pairs: DashMap::new(),
            transfers: DashMap::new(),
            events: DashMap::new(),
        }
    }

    pub(crate) fn engine(&self) -> &Arc<dyn CallEngine> {
        &self.engine
    }

    pub fn application(&self) -> &B2buaApplication {
        &self.application
    }

    pub fn active_pairs(&self) -> usize {
        self.pairs.len()
    }

    fn peer_of(&self, call_id: &str) -> Option<Arc<dyn CallLeg>> {
        let peer_id = self.peers.get(call_id)?.clone();
        let peer = self.calls.get(&peer_id).map(|entry| entry.clone());
        if peer.is_none() {
            warn!(call_id, "failed to find peer call of current call");
        }
        peer
    }

    /// Entry point for every leg state change.
    pub fn on_call_state_changed(&self, call: &Arc<dyn CallLeg>, state: CallState) {
        let leg_name = match call.direction() {
            LegDirection::Outgoing => "legB",
            LegDirection::Incoming => "legA",
        };
        debug!(call_id = %call.call_id(), leg = leg_name, ?state, "call state changed");

        match state {
            CallState::IncomingReceived => self.on_incoming(call),
            CallState::OutgoingRinging => {
                if let Some(leg_a) = self.peer_of(&call.call_id()) {
                    leg_a.notify_ringing();
                }
            }
            CallState::OutgoingEarlyMedia => {
                if let Some(leg_a) = self.peer_of(&call.call_id()) {
                    let mut params = leg_a.current_params();
                    params.early_media_sending = true;
                    leg_a.accept_early_media(params);
                }
            }
            CallState::StreamsRunning => self.on_streams_running(call),
            CallState::PausedByRemote => self.on_paused_by_remote(call),
            CallState::UpdatedByRemote => self.on_updated_by_remote(call),
            CallState::Referred => self.on_referred(call),
            CallState::End | CallState::Error => {
                self.application.on_call_end(call.as_ref());
                if let Some(peer) = self.peer_of(&call.call_id()) {
                    peer.terminate(call.error_info());
                }
            }
            CallState::Released => self.on_released(call),
            CallState::IncomingEarlyMedia
            | CallState::OutgoingInit
            | CallState::OutgoingProgress
            | CallState::Connected
            | CallState::Paused
            | CallState::Resuming => {}
        }
    }

    /// DTMF received on one leg is replayed on the peer.
    pub fn on_dtmf_received(&self, call: &Arc<dyn CallLeg>, digit: char) {
        if let Some(peer) = self.peer_of(&call.call_id()) {
            debug!(
                from = %call.call_id(),
                to = %peer.call_id(),
                digit = %digit,
                "forwarding DTMF"
            );
            peer.send_dtmf(digit);
        }
    }

    /// Transfer progress on leg-B mapped to a sipfrag NOTIFY on leg-A.
    ///
    /// Finer peer outcomes (603, 503, timeouts) all collapse into 500.
    pub fn on_transfer_state_changed(&self, transferred_id: &str, state: TransferState) {
        let frag = match state {
            TransferState::OutgoingProgress => SipFrag::new(100, "Trying"),
            TransferState::Connected => SipFrag::new(200, "Ok"),
            TransferState::Error => SipFrag::new(500, "Internal Server Error"),
        };
        let Some(transferor_id) = self.transfers.get(transferred_id).map(|e| e.clone()) else {
            return;
        };
        let Some(transferor) = self.calls.get(&transferor_id).map(|e| e.clone()) else {
            warn!(%transferor_id, "unable to forward NOTIFY, peer call has been freed");
            return;
        };
        transferor.send_notify("refer", "message/sipfrag", frag.render());
        if state != TransferState::OutgoingProgress {
            self.transfers.remove(transferred_id);
        }
    }

    /// A leg exceeded the media-silence budget.
    pub fn on_rtp_timeout(&self, call: &Arc<dyn CallLeg>) {
        info!(call_id = %call.call_id(), "no RTP received, terminating leg");
        call.terminate(Some(ErrorInfo {
            code: 408,
            reason: SmolStr::new("RTP timeout"),
        }));
    }

    /// Terminates pairs that outlived `max-call-duration` (0 disables).
    pub fn sweep_long_calls(&self) {
        if self.config.max_call_duration == Duration::ZERO {
            return;
        }
        let mut expired = Vec::new();
        for entry in self.pairs.iter() {
            if entry.value().started_at.elapsed() > self.config.max_call_duration {
                expired.push(entry.key().clone());
            }
        }
        for call_id in expired {
            info!(%call_id, "max call duration exceeded, terminating pair");
            if let Some(call) = self.calls.get(&call_id).map(|e| e.clone()) {
                call.terminate(None);
            }
            if let Some(peer) = self.peer_of(&call_id) {
                peer.terminate(None);
            }
        }
    }

    fn on_incoming(&self, call: &Arc<dyn CallLeg>) {
        // A bridged leg re-entering the server must not be intercepted
        // again.
        if call.remote_params().custom_header(CUSTOM_HEADER).is_some() {
            return;
        }

        info!(
            from = %call.remote_address(),
            to = %call.to_address(),
            "incoming call received"
        );

        // Clone leg-A parameters so leg-B reuses the same media intent.
        let mut outgoing_params = call.current_params();
        outgoing_params.add_custom_header(CUSTOM_HEADER, "ignore");
        outgoing_params.early_media_sending = true;
        if let Some(referred_by) = call.referred_by() {
            outgoing_params.add_custom_header("Referred-By", referred_by);
        }

        let callee = match self
            .application
            .on_call_create(call.as_ref(), &mut outgoing_params)
        {
            Ok(callee) => callee,
            Err(reason) => {
                call.decline(reason);
                return;
            }
        };

        let leg_b = match self.engine.invite(&callee, outgoing_params) {
            Ok(leg_b) => leg_b,
            Err(error) => {
                error!(%error, "could not establish bridge call, please verify your configuration");
                call.decline(DeclineReason::NotImplemented);
                return;
            }
        };

        self.engine.couple_media(call, &leg_b);

        let a_id = call.call_id();
        let b_id = leg_b.call_id();
        self.calls.insert(a_id.clone(), Arc::clone(call));
        self.calls.insert(b_id.clone(), leg_b);
        self.peers.insert(a_id.clone(), b_id.clone());
        self.peers.insert(b_id, a_id.clone());
        self.pairs.insert(
            a_id,
            CallPair {
                started_at: Instant::now(),
            },
        );
    }

    fn on_streams_running(&self, call: &Arc<dyn CallLeg>) {
        let Some(peer) = self.peer_of(&call.call_id()) else {
            return;
        };

        // Leg-B runs while leg-A still awaits an answer: answer it now,
        // mirroring the media capabilities leg-B actually negotiated.
        if call.direction() == LegDirection::Outgoing
            && matches!(
                peer.state(),
                CallState::IncomingReceived | CallState::IncomingEarlyMedia
            )
        {
            debug!("legB is now running, answering legA");
            let mut params = peer.current_params();
            params.add_custom_header(CUSTOM_HEADER, "ignore");
            params.audio_enabled = call.current_params().audio_enabled;
            params.video_enabled = call.current_params().video_enabled;
            peer.accept(params);
        }

        if peer.state() == CallState::UpdatedByRemote {
            // The peer deferred an update; accept it with our media caps.
            debug!("peer call deferred update, accepting it now");
            let mut params = peer.current_params();
            params.video_enabled = call.current_params().video_enabled;
            params.audio_enabled = call.current_params().audio_enabled;
            peer.accept_update(Some(params));
        } else if peer.state() != CallState::PausedByRemote {
            // Resuming from pause: bring the peer back to sendrecv.
            let direction = peer.current_params().audio_direction;
            if matches!(direction, MediaDirection::SendOnly | MediaDirection::Inactive) {
                debug!("peer call is paused, updating it to resume");
                let mut params = peer.current_params();
                params.audio_direction = MediaDirection::SendRecv;
                peer.update(params);
            }
        }
    }

    fn on_paused_by_remote(&self, call: &Arc<dyn CallLeg>) {
        let Some(peer) = self.peer_of(&call.call_id()) else {
            return;
        };

        if peer.state() == CallState::PausedByRemote {
            error!("both calls are paused by remote, lost track of who initiated the pause");
            call.terminate(None);
            peer.terminate(None);
            return;
        }

        // Do not pause the peer outright; just stop sending it audio.
        let direction = peer.current_params().audio_direction;
        if !matches!(direction, MediaDirection::Inactive | MediaDirection::SendOnly) {
            let mut params = peer.current_params();
            params.audio_direction = MediaDirection::SendOnly;
            peer.update(params);
        }
    }

    fn on_updated_by_remote(&self, call: &Arc<dyn CallLeg>) {
        let Some(peer) = self.peer_of(&call.call_id()) else {
            return;
        };
        let current = call.current_params();
        let remote = call.remote_params();

        let mut peer_params = peer.current_params();
        let mut update_peer = false;
        if remote.video_enabled != current.video_enabled {
            update_peer = true;
            peer_params.video_enabled = remote.video_enabled;
        }
        if remote.audio_enabled != current.audio_enabled {
            update_peer = true;
            peer_params.audio_enabled = remote.audio_enabled;
        }

        if update_peer {
            debug!("media toggled, updating peer call");
            peer_params.add_custom_header(CUSTOM_HEADER, "ignore");
            peer.update(peer_params);
            call.defer_update();
        } else {
            // Minor changes ride through without bothering the peer.
            debug!("accepting update without forwarding it to peer call");
            call.accept_update(None);
        }
    }

    fn on_referred(&self, call: &Arc<dyn CallLeg>) {
        let Some(peer) = self.peer_of(&call.call_id()) else {
            return;
        };
        let Some(refer_to) = call.refer_to() else {
            error!("unable to process call transfer request, Refer-To header is empty");
            return;
        };

        if refer_to.uri.header("Replaces").is_some() {
            error!("attended call transfer is not implemented yet");
            return;
        }

        info!(
            from = %call.remote_address(),
            refer_to = %refer_to,
            "blind call transfer requested"
        );
        self.transfers.insert(peer.call_id(), call.call_id());
        peer.transfer_to(refer_to);
    }

    fn on_released(&self, call: &Arc<dyn CallLeg>) {
        let call_id = call.call_id();
        if let Some((_, peer_id)) = self.peers.remove(&call_id) {
            debug!(%call_id, %peer_id, "releasing call leg");
        } else {
            debug!(%call_id, "call is in end state but it is already terminated");
        }
        self.calls.remove(&call_id);
        self.pairs.remove(&call_id);
        self.transfers.remove(&call_id);
        self.transfers.retain(|_, transferor| transferor != &call_id);
    }
}

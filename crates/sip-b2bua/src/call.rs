// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Call-leg seam between the mediator and the media stack.
//!
//! The mediator never terminates media itself; it drives legs through
//! [`CallLeg`] and creates outgoing legs through [`CallEngine`]. The
//! production implementation wraps the media stack; tests use recording
//! mocks.

use anyhow::Result;
use smol_str::SmolStr;
use std::sync::Arc;

use sip_core::{NameAddr, SipUri};

/// Which side of the bridge a leg is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegDirection {
    Incoming,
    Outgoing,
}

/// Call lifecycle states the mediator reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    IncomingReceived,
    IncomingEarlyMedia,
    OutgoingInit,
    OutgoingProgress,
    OutgoingRinging,
    OutgoingEarlyMedia,
    Connected,
    StreamsRunning,
    Paused,
    PausedByRemote,
    UpdatedByRemote,
    Referred,
    Resuming,
    End,
    Error,
    Released,
}

/// Stream directionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

/// Media-plane encryption modes the trenscrypter bridges between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaEncryption {
    None,
    Srtp,
    Zrtp,
    DtlsSrtp,
}

/// Parameters for answering, updating or placing a leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallParams {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub audio_direction: MediaDirection,
    pub media_encryption: MediaEncryption,
    pub early_media_sending: bool,
    /// Identity to place the leg as, when not the server default.
    pub from_identity: Option<SipUri>,
    pub outbound_proxy: Option<SipUri>,
    pub custom_headers: Vec<(SmolStr, SmolStr)>,
}

impl Default for CallParams {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: false,
            audio_direction: MediaDirection::SendRecv,
            media_encryption: MediaEncryption::None,
            early_media_sending: false,
            from_identity: None,
            outbound_proxy: None,
            custom_headers: Vec::new(),
        }
    }
}

impl CallParams {
    pub fn add_custom_header(&mut self, name: impl Into<SmolStr>, value: impl Into<SmolStr>) {
        self.custom_headers.push((name.into(), value.into()));
    }

    pub fn custom_header(&self, name: &str) -> Option<&str> {
        self.custom_headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Error carried when a leg ends abnormally; mirrored onto the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: u16,
    pub reason: SmolStr,
}

/// Reasons a leg is declined before bridging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    Busy,
    NotAcceptable,
    NotImplemented,
    Forbidden,
    TemporarilyUnavailable,
}

impl DeclineReason {
    pub fn code(&self) -> u16 {
        match self {
            DeclineReason::Busy => 486,
            DeclineReason::NotAcceptable => 488,
            DeclineReason::NotImplemented => 501,
            DeclineReason::Forbidden => 403,
            DeclineReason::TemporarilyUnavailable => 480,
        }
    }
}

/// One SIP dialog under mediator control.
pub trait CallLeg: Send + Sync {
    fn call_id(&self) -> SmolStr;
    fn direction(&self) -> LegDirection;
    fn state(&self) -> CallState;

    /// The remote party placing or receiving this leg.
    fn remote_address(&self) -> SipUri;
    /// Original To of the incoming request (the bridged destination).
    fn to_address(&self) -> SipUri;
    /// Referred-By of the incoming INVITE, when this call results from a
    /// transfer.
    fn referred_by(&self) -> Option<SmolStr>;
    /// Refer-To target while in `Referred` state.
    fn refer_to(&self) -> Option<NameAddr>;
    fn error_info(&self) -> Option<ErrorInfo>;

    fn current_params(&self) -> CallParams;
    fn remote_params(&self) -> CallParams;

    fn notify_ringing(&self);
    fn accept_early_media(&self, params: CallParams);
    fn accept(&self, params: CallParams);
    fn accept_update(&self, params: Option<CallParams>);
    fn defer_update(&self);
    fn update(&self, params: CallParams);
    fn decline(&self, reason: DeclineReason);
    fn terminate(&self, error: Option<ErrorInfo>);
    fn send_dtmf(&self, digit: char);
    fn transfer_to(&self, target: NameAddr);
    /// In-dialog NOTIFY (transfer progress reports).
    fn send_notify(&self, event: &str, content_type: &str, body: String);
}

/// An active SUBSCRIBE dialog being bridged.
pub trait EventSubscription: Send + Sync {
    fn id(&self) -> SmolStr;
    fn accept(&self);
    fn deny(&self, reason: DeclineReason);
    fn notify(&self, content_type: &str, body: String);
    fn terminate(&self);
}

/// The media/SIP stack the mediator places outgoing work through.
pub trait CallEngine: Send + Sync {
    /// Places leg-B towards `callee`.
    fn invite(&self, callee: &SipUri, params: CallParams) -> Result<Arc<dyn CallLeg>>;

    /// Couples two legs' media in a hidden one-participant-each
    /// conference.
    fn couple_media(&self, leg_a: &Arc<dyn CallLeg>, leg_b: &Arc<dyn CallLeg>);

    /// Opens a peer subscription towards `target`.
    fn subscribe(
        &self,
        target: &SipUri,
        event: &str,
        expires: u32,
        accept: Option<SmolStr>,
        body: Option<String>,
    ) -> Result<Arc<dyn EventSubscription>>;

    /// Emits an out-of-dialog NOTIFY (MWI re-authoring).
    fn send_notify(&self, resource: &SipUri, event: &str, content_type: &str, body: String);
}

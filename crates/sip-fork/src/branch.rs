// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use rand::{distributions::Alphanumeric, thread_rng, Rng};
use smol_str::SmolStr;

use sip_core::{ReasonHeader, Response, SipUri};

/// Why a branch was cancelled, derived from the fork outcome or the
/// caller's CANCEL Reason header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStatus {
    /// Plain cancellation, no Reason given.
    Standard,
    /// Another branch (or another fork) answered: `SIP;cause=200`.
    AcceptedElsewhere,
    /// The call was declined globally: `SIP;cause=600`.
    DeclinedElsewhere,
}

impl CancelStatus {
    pub fn from_reason(reason: Option<&ReasonHeader>) -> Self {
        match reason.and_then(|r| r.cause) {
            Some(200) => CancelStatus::AcceptedElsewhere,
            Some(600) => CancelStatus::DeclinedElsewhere,
            _ => CancelStatus::Standard,
        }
    }

    /// The Reason header a CANCEL with this status carries downstream.
    pub fn to_reason(self) -> Option<ReasonHeader> {
        match self {
            CancelStatus::Standard => None,
            CancelStatus::AcceptedElsewhere => Some(ReasonHeader::call_completed_elsewhere()),
            CancelStatus::DeclinedElsewhere => Some(ReasonHeader::busy_everywhere()),
        }
    }
}

/// Lifecycle of one outgoing branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchState {
    Pending,
    Ringing,
    EarlyMedia,
    /// The single winning branch. Absorbing.
    Answered,
    Cancelled(CancelStatus),
    /// Final non-2xx response received.
    Completed(u16),
    /// Branch-level error (transport, timeout), expressed as a code.
    Failed(u16),
}

impl BranchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BranchState::Answered
                | BranchState::Cancelled(_)
                | BranchState::Completed(_)
                | BranchState::Failed(_)
        )
    }
}

/// One outgoing transaction of a forked request.
#[derive(Debug, Clone)]
pub struct Branch {
    pub id: SmolStr,
    pub target: SipUri,
    pub instance_id: SmolStr,
    pub state: BranchState,
    pub last_response: Option<Response>,
    /// The device registered with push parameters; it may come back after
    /// an unreachable result and is then a fork-late candidate.
    pub push_capable: bool,
    /// Added by a registration that arrived after initial dispatch.
    pub late: bool,
}

impl Branch {
    pub(crate) fn new(target: SipUri, instance_id: SmolStr, push_capable: bool, late: bool) -> Self {
        Self {
            id: generate_branch_id(),
            target,
            instance_id,
            state: BranchState::Pending,
            last_response: None,
            push_capable,
            late,
        }
    }

    /// Status code of the final response, when one arrived.
    pub fn final_code(&self) -> Option<u16> {
        match self.state {
            BranchState::Completed(code) | BranchState::Failed(code) => Some(code),
            BranchState::Answered => Some(200),
            _ => None,
        }
    }
}

/// RFC 3261 branch token with the mandated magic cookie.
pub fn generate_branch_id() -> SmolStr {
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();
    SmolStr::new(format!("z9hG4bK{}", suffix))
}

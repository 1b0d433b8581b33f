// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Fork-context engine.
//!
//! A [`ForkContext`] coordinates one routed request: it fans out to one
//! branch per eligible contact, tracks their responses, selects the best
//! final response, and annotates peer-branch CANCELs with the fork
//! outcome. Three policies exist:
//!
//! - **Call** (INVITE): parallel fork, provisional relay, first 2xx wins
//!   and cancels peers with `Reason: SIP;cause=200`. With fork-late
//!   enabled, devices that were unreachable keep the context alive and
//!   receive the INVITE when they re-register.
//! - **Message** (MESSAGE): deliver to every binding, aggregate when all
//!   are final (2xx if any, else the best failure).
//! - **Basic** (SUBSCRIBE/OPTIONS): one-shot fan-out, first 2xx wins, no
//!   fork-late.
//!
//! The context never touches a socket. It emits [`ForkAction`] values on
//! a channel; the owning router dispatches them and feeds transaction
//! events back in. All state transitions happen under one internal lock,
//! so events are processed in arrival order.

pub mod branch;
pub mod metrics;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use sip_core::{ReasonHeader, Request, Response, SipUri};
use sip_registrar::{Binding, ContactListener};

pub use branch::{generate_branch_id, Branch, BranchState, CancelStatus};
pub use metrics::ForkCounters;

/// Forking behaviour per request class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkPolicy {
    Call,
    Message,
    Basic,
}

/// Scheduling priority the router assigns downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Normal,
    Urgent,
}

/// Configuration for one fork context.
#[derive(Debug, Clone)]
pub struct ForkConfig {
    pub policy: ForkPolicy,
    pub priority: Priority,
    /// Keep the context alive for devices that re-register (Call only).
    pub fork_late: bool,
    /// Budget before the context force-finalises.
    pub deadline: Duration,
}

impl ForkConfig {
    pub fn call() -> Self {
        Self {
            policy: ForkPolicy::Call,
            priority: Priority::Normal,
            fork_late: false,
            deadline: Duration::from_secs(90),
        }
    }

    pub fn message() -> Self {
        Self {
            policy: ForkPolicy::Message,
            priority: Priority::Urgent,
            fork_late: false,
            deadline: Duration::from_secs(20),
        }
    }

    pub fn basic() -> Self {
        Self {
            policy: ForkPolicy::Basic,
            priority: Priority::Normal,
            fork_late: false,
            deadline: Duration::from_secs(20),
        }
    }

    pub fn with_fork_late(mut self, enabled: bool) -> Self {
        self.fork_late = enabled;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Observer of branch-level outcomes.
pub trait BranchListener: Send + Sync {
    fn on_branch_cancelled(&self, _branch: &Branch, _status: CancelStatus) {}
    fn on_branch_answered(&self, _branch: &Branch) {}
}

/// Instructions the context emits for the router to execute.
#[derive(Debug)]
pub enum ForkAction {
    /// Send the (rewritten) request to `target` on a new branch.
    Dispatch { branch_id: SmolStr, target: SipUri },
    /// Send CANCEL on the branch, annotated with `reason` when present.
    CancelBranch {
        branch_id: SmolStr,
        reason: Option<ReasonHeader>,
    },
    /// Forward this response upstream.
    Respond(Response),
}

struct ForkState {
    branches: Vec<Branch>,
    answered: bool,
    terminal_sent: bool,
    terminal_acked: bool,
    caller_cancel: Option<CancelStatus>,
    /// Instance-ids of push-capable devices that were unreachable; the
    /// context waits for them while fork-late is on.
    awaited_instances: HashSet<SmolStr>,
    finished: bool,
}

/// The stateful coordinator of one forked request.
pub struct ForkContext {
    request: Request,
    config: ForkConfig,
    counters: ForkCounters,
    actions: mpsc::UnboundedSender<ForkAction>,
    state: Mutex<ForkState>,
    listener: Mutex<Option<Arc<dyn BranchListener>>>,
    created_at: Instant,
}

impl ForkContext {
    pub fn new(
        request: Request,
        config: ForkConfig,
        counters: ForkCounters,
        actions: mpsc::UnboundedSender<ForkAction>,
    ) -> Arc<Self> {
        counters.record_start();
        Arc::new(Self {
            request,
            config,
            counters,
            actions,
            state: Mutex::new(ForkState {
                branches: Vec::new(),
                answered: false,
                terminal_sent: false,
                terminal_acked: false,
                caller_cancel: None,
                awaited_instances: HashSet::new(),
                finished: false,
            }),
            listener: Mutex::new(None),
            created_at: Instant::now(),
        })
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn config(&self) -> &ForkConfig {
        &self.config
    }

    pub fn deadline_at(&self) -> Instant {
        self.created_at + self.config.deadline
    }

    pub fn set_listener(&self, listener: Arc<dyn BranchListener>) {
        *self.listener.lock() = Some(listener);
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Snapshot of the branch set, for tests and introspection.
    pub fn branches(&self) -> Vec<Branch> {
        self.state.lock().branches.clone()
    }

    /// Adds and dispatches a branch towards `target`.
    ///
    /// Returns the branch id, or `None` when a branch for the same
    /// instance already exists or the context has finished.
    pub fn add_branch(
        &self,
        target: &SipUri,
        instance_id: &str,
        push_capable: bool,
    ) -> Option<SmolStr> {
        let mut state = self.state.lock();
        if state.finished {
            return None;
        }
        if state
            .branches
            .iter()
            .any(|b| b.instance_id == instance_id && !b.state.is_terminal())
        {
            return None;
        }

        let late = state.terminal_sent || state.answered;
        let branch = Branch::new(
            target.clone(),
            SmolStr::new(instance_id.to_owned()),
            push_capable,
            late,
        );
        let id = branch.id.clone();
        debug!(branch = %id, %target, late, "dispatching branch");
        state.branches.push(branch);
        self.emit(ForkAction::Dispatch {
            branch_id: id.clone(),
            target: target.clone(),
        });
        Some(id)
    }

    /// Feeds a response received on a branch.
    pub fn on_response(&self, branch_id: &str, response: Response) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        let Some(i) = state.branches.iter().position(|b| b.id == branch_id) else {
            warn!(branch = branch_id, "response for unknown branch");
            return;
        };
        if state.branches[i].state.is_terminal() {
            return;
        }

        let code = response.code();
        state.branches[i].last_response = Some(response.clone());

        if response.is_provisional() {
            state.branches[i].state = if code == 183 {
                BranchState::EarlyMedia
            } else {
                BranchState::Ringing
            };
            // Only call forks relay ringing upstream.
            if self.config.policy == ForkPolicy::Call && !state.terminal_sent {
                self.emit(ForkAction::Respond(response));
            }
            return;
        }

        if response.is_success() {
            if self.config.policy == ForkPolicy::Message {
                // MESSAGE delivery does not race; every branch completes
                // and the aggregate goes upstream at the end.
                state.branches[i].state = BranchState::Completed(code);
                self.finalize_if_ready(&mut state);
                return;
            }
            if state.answered {
                // A second 2xx lost the race; the winner is absorbing.
                state.branches[i].state = BranchState::Completed(code);
                self.finish_if_settled(&mut state);
                return;
            }
            state.answered = true;
            state.branches[i].state = BranchState::Answered;
            info!(branch = branch_id, "branch answered, cancelling peers");
            self.notify_answered(&state.branches[i]);
            self.cancel_peers(&mut state, i, CancelStatus::AcceptedElsewhere);
            if !state.terminal_sent {
                state.terminal_sent = true;
                self.emit(ForkAction::Respond(response));
            }
            self.finish_if_settled(&mut state);
            return;
        }

        // Final failure on this branch.
        state.branches[i].state = BranchState::Completed(code);
        let unreachable = matches!(code, 408 | 503);
        if unreachable
            && state.branches[i].push_capable
            && self.config.policy == ForkPolicy::Call
            && self.config.fork_late
        {
            let instance = state.branches[i].instance_id.clone();
            debug!(%instance, "device unreachable, awaiting re-registration");
            state.awaited_instances.insert(instance);
        }
        self.finalize_if_ready(&mut state);
    }

    /// Branch-level transport failure or transaction timeout.
    pub fn on_branch_failed(&self, branch_id: &str, code: u16) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        let Some(i) = state.branches.iter().position(|b| b.id == branch_id) else {
            return;
        };
        if state.branches[i].state.is_terminal() {
            return;
        }
        state.branches[i].state = BranchState::Failed(code);
        if state.branches[i].push_capable
            && self.config.policy == ForkPolicy::Call
            && self.config.fork_late
        {
            let instance = state.branches[i].instance_id.clone();
            state.awaited_instances.insert(instance);
        }
        self.finalize_if_ready(&mut state);
    }

    /// The caller cancelled the originating transaction.
    ///
    /// Every live branch is cancelled with the translated status. A
    /// terminal response goes upstream immediately even when fork-late
    /// keeps the context open for devices still expected to register.
    pub fn on_cancel(&self, reason: Option<&ReasonHeader>) {
        let status = CancelStatus::from_reason(reason);
        let mut state = self.state.lock();
        if state.finished || state.answered {
            return;
        }
        state.caller_cancel = Some(status);

        let cancelled_live = self.cancel_peers(&mut state, usize::MAX, status);

        if !state.terminal_sent {
            state.terminal_sent = true;
            let response = if cancelled_live > 0 {
                Response::reply_to(&self.request, 487, "Request Terminated")
            } else {
                self.best_response(&state)
            };
            self.emit(ForkAction::Respond(response));
        }
        self.finish_if_settled(&mut state);
    }

    /// ACK for our own terminal response arrived; late branches that were
    /// delivered for ring-visibility are cancelled now.
    pub fn on_terminal_acked(&self) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.terminal_acked = true;
        if let Some(status) = state.caller_cancel {
            self.cancel_peers(&mut state, usize::MAX, status);
        }
        self.finish_if_settled(&mut state);
    }

    /// Deadline expiry: force terminal aggregation and close.
    pub fn on_deadline(&self) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        info!("fork deadline reached, finalising");
        self.cancel_peers(&mut state, usize::MAX, CancelStatus::Standard);
        if !state.terminal_sent {
            state.terminal_sent = true;
            let response = self.best_response(&state);
            self.emit(ForkAction::Respond(response));
        }
        self.finish(&mut state);
    }

    /// A device of the target AOR registered while the context is alive.
    pub fn on_late_registration(&self, binding: &Binding) {
        if self.config.policy != ForkPolicy::Call || !self.config.fork_late {
            return;
        }
        {
            let state = self.state.lock();
            if state.finished {
                return;
            }
        }

        let Some(branch_id) = self.add_branch(
            &binding.contact,
            &binding.instance_id,
            binding.has_push_params(),
        ) else {
            return;
        };

        let mut state = self.state.lock();
        state.awaited_instances.remove(binding.instance_id.as_str());

        // The fork already has an outcome: ring the device for visibility,
        // then cancel as soon as allowed.
        let cancel_now = if state.answered {
            Some(CancelStatus::AcceptedElsewhere)
        } else if state.terminal_acked {
            state.caller_cancel
        } else {
            None
        };
        if let Some(status) = cancel_now {
            if let Some(i) = state.branches.iter().position(|b| b.id == branch_id) {
                self.cancel_branch(&mut state, i, status);
            }
            self.finish_if_settled(&mut state);
        }
    }

    /// Best-response aggregation over final branch outcomes:
    /// the smallest 6xx, else the smallest 4xx other than 408/503, else
    /// 408 when a branch timed out, else 503.
    fn best_response(&self, state: &ForkState) -> Response {
        let codes: Vec<u16> = state
            .branches
            .iter()
            .filter_map(|b| b.final_code())
            .collect();

        let chosen = codes
            .iter()
            .filter(|&&c| (600..700).contains(&c))
            .min()
            .copied()
            .or_else(|| {
                codes
                    .iter()
                    .filter(|&&c| (400..500).contains(&c) && c != 408 && c != 503)
                    .min()
                    .copied()
            })
            .or_else(|| codes.iter().find(|&&c| c == 408).copied())
            .unwrap_or(503);

        // Relay the stored response when a branch actually produced it.
        state
            .branches
            .iter()
            .filter(|b| b.final_code() == Some(chosen))
            .find_map(|b| b.last_response.clone())
            .unwrap_or_else(|| {
                Response::reply_to(&self.request, chosen, default_reason(chosen))
            })
    }

    /// Cancels every live branch except `winner` (pass `usize::MAX` for
    /// none). Returns how many were cancelled.
    fn cancel_peers(&self, state: &mut ForkState, winner: usize, status: CancelStatus) -> usize {
        let mut cancelled = 0;
        for i in 0..state.branches.len() {
            if i == winner || state.branches[i].state.is_terminal() {
                continue;
            }
            self.cancel_branch(state, i, status);
            cancelled += 1;
        }
        cancelled
    }

    fn cancel_branch(&self, state: &mut ForkState, i: usize, status: CancelStatus) {
        state.branches[i].state = BranchState::Cancelled(status);
        self.emit(ForkAction::CancelBranch {
            branch_id: state.branches[i].id.clone(),
            reason: status.to_reason(),
        });
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener.on_branch_cancelled(&state.branches[i], status);
        }
    }

    fn notify_answered(&self, branch: &Branch) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener.on_branch_answered(branch);
        }
    }

    /// Message/Basic aggregation and no-fork-late finalisation: when every
    /// branch is final and no terminal response has gone upstream, send
    /// one now.
    fn finalize_if_ready(&self, state: &mut ForkState) {
        let all_terminal = state.branches.iter().all(|b| b.state.is_terminal());
        if !all_terminal {
            return;
        }

        let waiting_for_devices = self.config.policy == ForkPolicy::Call
            && self.config.fork_late
            && !state.awaited_instances.is_empty();

        if !state.terminal_sent {
            if waiting_for_devices {
                // Keep ringing: a late registration may still answer.
                return;
            }
            state.terminal_sent = true;
            // Aggregation forwards a success when any branch delivered.
            let response = state
                .branches
                .iter()
                .filter(|b| matches!(b.final_code(), Some(c) if (200..300).contains(&c)))
                .find_map(|b| b.last_response.clone())
                .unwrap_or_else(|| self.best_response(state));
            self.emit(ForkAction::Respond(response));
        }
        self.finish_if_settled(state);
    }

    fn finish_if_settled(&self, state: &mut ForkState) {
        let all_terminal = state.branches.iter().all(|b| b.state.is_terminal());
        let waiting_for_devices = self.config.policy == ForkPolicy::Call
            && self.config.fork_late
            && !state.awaited_instances.is_empty();
        if state.terminal_sent && all_terminal && !waiting_for_devices {
            self.finish(state);
        }
    }

    fn finish(&self, state: &mut ForkState) {
        if !state.finished {
            state.finished = true;
            self.counters.record_finish();
            debug!("fork context finished");
        }
    }

    fn emit(&self, action: ForkAction) {
        if self.actions.send(action).is_err() {
            warn!("fork action dropped, router receiver gone");
        }
    }
}

impl ContactListener for ForkContext {
    fn on_contact_registered(&self, _aor: &str, binding: &Binding) {
        self.on_late_registration(binding);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sip_testkit::{build_invite, build_message, build_response_to};

    fn target(n: u32) -> SipUri {
        SipUri::parse(&format!("sip:callee@10.0.0.{}", n)).unwrap()
    }

    struct Fixture {
        context: Arc<ForkContext>,
        actions: mpsc::UnboundedReceiver<ForkAction>,
        counters: ForkCounters,
    }

    fn fixture(config: ForkConfig) -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = ForkCounters::new();
        let request = match config.policy {
            ForkPolicy::Message => build_message("sip:callee@sip.test.org", "m-1"),
            _ => build_invite("sip:callee@sip.test.org", "z9hG4bKup", "call-1"),
        };
        let context = ForkContext::new(request, config, counters.clone(), tx);
        Fixture {
            context,
            actions: rx,
            counters,
        }
    }

    fn drain(actions: &mut mpsc::UnboundedReceiver<ForkAction>) -> Vec<ForkAction> {
        let mut out = Vec::new();
        while let Ok(action) = actions.try_recv() {
            out.push(action);
        }
        out
    }

    fn respond(fx: &Fixture, branch_id: &str, code: u16, reason: &str) {
        let response = build_response_to(fx.context.request(), code, reason);
        fx.context.on_response(branch_id, response);
    }

    #[test]
    fn basic_call_answer_finishes_context() {
        let mut fx = fixture(ForkConfig::call());
        let id = fx.context.add_branch(&target(2), "urn:uuid:1", false).unwrap();

        respond(&fx, &id, 180, "Ringing");
        respond(&fx, &id, 200, "OK");

        let actions = drain(&mut fx.actions);
        assert!(matches!(actions[0], ForkAction::Dispatch { .. }));
        assert!(matches!(&actions[1], ForkAction::Respond(r) if r.code() == 180));
        assert!(matches!(&actions[2], ForkAction::Respond(r) if r.code() == 200));

        assert_eq!(fx.counters.start(), 1);
        assert_eq!(fx.counters.finish(), 1);
        assert!(fx.context.is_finished());
    }

    #[test]
    fn winner_cancels_peers_with_accepted_elsewhere() {
        let mut fx = fixture(ForkConfig::call());
        let first = fx.context.add_branch(&target(2), "urn:uuid:1", false).unwrap();
        let second = fx.context.add_branch(&target(3), "urn:uuid:2", false).unwrap();

        struct Observe(Mutex<Option<CancelStatus>>);
        impl BranchListener for Observe {
            fn on_branch_cancelled(&self, _branch: &Branch, status: CancelStatus) {
                *self.0.lock() = Some(status);
            }
        }
        let observer = Arc::new(Observe(Mutex::new(None)));
        fx.context.set_listener(observer.clone());

        respond(&fx, &first, 200, "OK");

        let actions = drain(&mut fx.actions);
        let cancel = actions
            .iter()
            .find_map(|a| match a {
                ForkAction::CancelBranch { branch_id, reason } if branch_id == &second => {
                    Some(reason.clone())
                }
                _ => None,
            })
            .expect("peer branch cancelled");
        assert_eq!(cancel.unwrap().cause, Some(200));
        assert_eq!(*observer.0.lock(), Some(CancelStatus::AcceptedElsewhere));

        // At most one branch reaches Answered.
        let answered = fx
            .context
            .branches()
            .into_iter()
            .filter(|b| b.state == BranchState::Answered)
            .count();
        assert_eq!(answered, 1);
    }

    #[test]
    fn second_success_does_not_answer_twice() {
        let mut fx = fixture(ForkConfig::call());
        let first = fx.context.add_branch(&target(2), "urn:uuid:1", false).unwrap();
        let second = fx.context.add_branch(&target(3), "urn:uuid:2", false).unwrap();

        respond(&fx, &first, 200, "OK");
        // The 200 from the loser arrives after the CANCEL crossed it.
        respond(&fx, &second, 200, "OK");

        let responses: Vec<u16> = drain(&mut fx.actions)
            .into_iter()
            .filter_map(|a| match a {
                ForkAction::Respond(r) => Some(r.code()),
                _ => None,
            })
            .collect();
        assert_eq!(responses, vec![200]);
    }

    #[test]
    fn early_cancel_with_live_branch_yields_487() {
        let mut fx = fixture(ForkConfig::call().with_fork_late(true));
        let id = fx.context.add_branch(&target(2), "urn:uuid:1", false).unwrap();
        respond(&fx, &id, 180, "Ringing");

        fx.context.on_cancel(None);

        let actions = drain(&mut fx.actions);
        assert!(actions.iter().any(|a| matches!(a, ForkAction::Respond(r) if r.code() == 487)));
        assert!(fx.context.is_finished());
        assert_eq!(fx.counters.finish(), 1);
    }

    #[test]
    fn early_cancel_offline_only_returns_503_and_stays_open() {
        let mut fx = fixture(ForkConfig::call().with_fork_late(true));
        let id = fx.context.add_branch(&target(2), "urn:uuid:ios", true).unwrap();

        // Push-capable device unreachable: transport reports 503.
        fx.context.on_branch_failed(&id, 503);
        // No terminal yet: the fork keeps waiting for the device.
        assert!(!drain(&mut fx.actions)
            .iter()
            .any(|a| matches!(a, ForkAction::Respond(_))));

        fx.context.on_cancel(None);
        let actions = drain(&mut fx.actions);
        assert!(actions.iter().any(|a| matches!(a, ForkAction::Respond(r) if r.code() == 503)));
        assert!(!fx.context.is_finished());
        assert_eq!(fx.counters.finish(), 0);

        // ACK for the 503 arrives.
        fx.context.on_terminal_acked();

        // Device comes back online; it must see INVITE then CANCEL.
        let binding = Binding {
            contact: target(9),
            instance_id: SmolStr::new("urn:uuid:ios"),
            expires_at: Instant::now() + Duration::from_secs(600),
            q: 1.0,
            push: Some(sip_registrar::PushParams {
                provider: "apns.dev".into(),
                prid: "EA88".into(),
                param: "XX".into(),
            }),
            message_expires: None,
            call_id: "reg-1".into(),
            cseq: 1,
            generation: 7,
        };
        fx.context.on_late_registration(&binding);

        let actions = drain(&mut fx.actions);
        assert!(matches!(actions[0], ForkAction::Dispatch { .. }));
        assert!(matches!(actions[1], ForkAction::CancelBranch { .. }));
        assert!(fx.context.is_finished());
        assert_eq!(fx.counters.start(), 1);
        assert_eq!(fx.counters.finish(), 1);
    }

    #[test]
    fn answered_fork_rings_then_cancels_late_device() {
        let mut fx = fixture(ForkConfig::call().with_fork_late(true));
        let online = fx.context.add_branch(&target(2), "urn:uuid:mac", false).unwrap();
        let offline = fx.context.add_branch(&target(3), "urn:uuid:ios", true).unwrap();

        fx.context.on_branch_failed(&offline, 503);
        respond(&fx, &online, 200, "OK");
        assert!(!fx.context.is_finished());
        assert_eq!(fx.counters.finish(), 0);
        drain(&mut fx.actions);

        let binding = Binding {
            contact: target(9),
            instance_id: SmolStr::new("urn:uuid:ios"),
            expires_at: Instant::now() + Duration::from_secs(600),
            q: 1.0,
            push: None,
            message_expires: None,
            call_id: "reg-2".into(),
            cseq: 1,
            generation: 9,
        };
        fx.context.on_late_registration(&binding);

        let actions = drain(&mut fx.actions);
        assert!(matches!(actions[0], ForkAction::Dispatch { .. }));
        match &actions[1] {
            ForkAction::CancelBranch { reason, .. } => {
                assert_eq!(reason.as_ref().unwrap().cause, Some(200));
            }
            other => panic!("expected cancel, got {:?}", other),
        }
        assert!(fx.context.is_finished());
    }

    #[test]
    fn message_fork_aggregates_success_over_failures() {
        let mut fx = fixture(ForkConfig::message());
        let a = fx.context.add_branch(&target(2), "urn:uuid:1", false).unwrap();
        let b = fx.context.add_branch(&target(3), "urn:uuid:2", false).unwrap();

        respond(&fx, &a, 486, "Busy Here");
        assert!(!drain(&mut fx.actions)
            .iter()
            .any(|a| matches!(a, ForkAction::Respond(_))));

        respond(&fx, &b, 200, "OK");
        let responses: Vec<u16> = drain(&mut fx.actions)
            .into_iter()
            .filter_map(|a| match a {
                ForkAction::Respond(r) => Some(r.code()),
                _ => None,
            })
            .collect();
        assert_eq!(responses, vec![200]);
        assert!(fx.context.is_finished());
    }

    #[test]
    fn best_response_rules() {
        // 486 + 603: the 6xx wins.
        let mut fx = fixture(ForkConfig::call());
        let a = fx.context.add_branch(&target(2), "urn:uuid:1", false).unwrap();
        let b = fx.context.add_branch(&target(3), "urn:uuid:2", false).unwrap();
        respond(&fx, &a, 486, "Busy Here");
        respond(&fx, &b, 603, "Decline");
        let responses: Vec<u16> = drain(&mut fx.actions)
            .into_iter()
            .filter_map(|a| match a {
                ForkAction::Respond(r) => Some(r.code()),
                _ => None,
            })
            .collect();
        assert_eq!(responses, vec![603]);

        // All 408: aggregate to 408.
        let mut fx = fixture(ForkConfig::call());
        let a = fx.context.add_branch(&target(2), "urn:uuid:1", false).unwrap();
        let b = fx.context.add_branch(&target(3), "urn:uuid:2", false).unwrap();
        fx.context.on_branch_failed(&a, 408);
        fx.context.on_branch_failed(&b, 408);
        let responses: Vec<u16> = drain(&mut fx.actions)
            .into_iter()
            .filter_map(|a| match a {
                ForkAction::Respond(r) => Some(r.code()),
                _ => None,
            })
            .collect();
        assert_eq!(responses, vec![408]);

        // 408 and 404: 404 outranks the timeout.
        let mut fx = fixture(ForkConfig::call());
        let a = fx.context.add_branch(&target(2), "urn:uuid:1", false).unwrap();
        let b = fx.context.add_branch(&target(3), "urn:uuid:2", false).unwrap();
        fx.context.on_branch_failed(&a, 408);
        respond(&fx, &b, 404, "Not Found");
        let responses: Vec<u16> = drain(&mut fx.actions)
            .into_iter()
            .filter_map(|a| match a {
                ForkAction::Respond(r) => Some(r.code()),
                _ => None,
            })
            .collect();
        assert_eq!(responses, vec![404]);
    }

    #[test]
    fn deadline_forces_finalisation() {
        let mut fx = fixture(ForkConfig::call().with_fork_late(true));
        let id = fx.context.add_branch(&target(2), "urn:uuid:ios", true).unwrap();
        fx.context.on_branch_failed(&id, 503);

        fx.context.on_deadline();
        let responses: Vec<u16> = drain(&mut fx.actions)
            .into_iter()
            .filter_map(|a| match a {
                ForkAction::Respond(r) => Some(r.code()),
                _ => None,
            })
            .collect();
        assert_eq!(responses, vec![503]);
        assert!(fx.context.is_finished());
        assert_eq!(fx.counters.finish(), 1);
    }

    #[test]
    fn policy_defaults_assign_message_priority_urgent() {
        assert_eq!(ForkConfig::message().priority, Priority::Urgent);
        assert_eq!(ForkConfig::call().priority, Priority::Normal);
        assert_eq!(ForkConfig::basic().priority, Priority::Normal);
    }

    #[test]
    fn duplicate_instance_is_not_dispatched_twice() {
        let fx = fixture(ForkConfig::call());
        assert!(fx.context.add_branch(&target(2), "urn:uuid:1", false).is_some());
        assert!(fx.context.add_branch(&target(3), "urn:uuid:1", false).is_none());
    }

    #[test]
    fn counters_never_finish_more_than_start() {
        let fx = fixture(ForkConfig::call());
        let id = fx.context.add_branch(&target(2), "urn:uuid:1", false).unwrap();
        respond(&fx, &id, 200, "OK");
        // Redundant events do not double-finish.
        fx.context.on_terminal_acked();
        fx.context.on_deadline();
        assert_eq!(fx.counters.start(), 1);
        assert_eq!(fx.counters.finish(), 1);
    }
}

fn default_reason(code: u16) -> &'static str {
    match code {
        404 => "Not Found",
        408 => "Request Timeout",
        480 => "Temporarily Unavailable",
        486 => "Busy Here",
        487 => "Request Terminated",
        503 => "Service Unavailable",
        600 => "Busy Everywhere",
        603 => "Decline",
        _ => "Server Internal Error",
    }
}

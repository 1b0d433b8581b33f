// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Request routing front-end.
//!
//! An authenticated request enters here. The router resolves its target
//! set, strips Route headers that point at this proxy, and hands the
//! request to a fork context:
//!
//! 1. configured static targets are always included, first;
//! 2. an `X-Target-Uris` header, when present, supplies the remaining
//!    targets and the registrar is NOT consulted;
//! 3. otherwise the registrar's bindings for the Request-URI AOR follow.
//!
//! A configured fallback route short-circuits forking when its filter
//! expression matches the request, and catches requests for which no
//! target could be resolved.

pub mod filter;

use std::sync::Arc;

use smol_str::SmolStr;
use tokio::sync::mpsc;
use tracing::{debug, info};

use sip_core::{parse_address_list, Method, ReasonHeader, Request, Response, SipUri};
use sip_fork::{ForkAction, ForkConfig, ForkContext, ForkCounters};
use sip_registrar::{Binding, ContactListener, RegistrarIndex};

pub use filter::{Field, FilterExpr};

/// The `router` configuration section.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Host/port this proxy answers on, for self-route detection.
    pub proxy_host: SmolStr,
    pub proxy_port: u16,
    /// Targets appended to every resolution, ahead of resolved contacts.
    pub static_targets: Vec<SipUri>,
    /// Route used when the filter matches or nothing else resolves.
    pub fallback_route: Option<SipUri>,
    /// Compiled at start-up; a parse error is a configuration failure.
    pub fallback_route_filter: Option<FilterExpr>,
    /// Keep call forks alive for devices that register late.
    pub fork_late: bool,
}

impl RouterConfig {
    pub fn new(proxy_host: impl Into<SmolStr>, proxy_port: u16) -> Self {
        Self {
            proxy_host: proxy_host.into(),
            proxy_port,
            static_targets: Vec::new(),
            fallback_route: None,
            fallback_route_filter: None,
            fork_late: false,
        }
    }
}

/// One resolved branch target.
#[derive(Debug, Clone)]
pub struct Target {
    pub uri: SipUri,
    pub instance_id: SmolStr,
    pub push_capable: bool,
}

impl Target {
    fn fixed(uri: &SipUri) -> Self {
        Self {
            uri: uri.clone(),
            instance_id: SmolStr::new(uri.to_string()),
            push_capable: false,
        }
    }

    fn from_binding(binding: &Binding) -> Self {
        Self {
            uri: binding.contact.clone(),
            instance_id: binding.instance_id.clone(),
            push_capable: binding.has_push_params(),
        }
    }
}

/// What the caller of [`Router::route`] must do next.
pub enum RouteDecision {
    /// Forward the request unchanged to this next hop.
    Forward(SipUri, Request),
    /// A fork context was created; its actions arrive on the channel
    /// handed to `route`.
    Fork(Arc<ForkContext>),
    /// Answer the originator directly.
    Respond(Response),
}

/// Routing front-end over the registrar and fork engine.
pub struct Router {
    config: RouterConfig,
    registrar: Arc<RegistrarIndex>,
    call_counters: ForkCounters,
    message_counters: ForkCounters,
}

impl Router {
    pub fn new(config: RouterConfig, registrar: Arc<RegistrarIndex>) -> Self {
        Self {
            config,
            registrar,
            call_counters: ForkCounters::new(),
            message_counters: ForkCounters::new(),
        }
    }

    pub fn call_counters(&self) -> &ForkCounters {
        &self.call_counters
    }

    pub fn message_counters(&self) -> &ForkCounters {
        &self.message_counters
    }

    pub fn registrar(&self) -> &Arc<RegistrarIndex> {
        &self.registrar
    }

    /// Routes one authenticated request.
    pub async fn route(
        &self,
        mut request: Request,
        actions: mpsc::UnboundedSender<ForkAction>,
    ) -> RouteDecision {
        if let (Some(fallback), Some(fltr)) = (
            &self.config.fallback_route,
            &self.config.fallback_route_filter,
        ) {
            if fltr.evaluate(&request) {
                info!(%fallback, "fallback filter matched, bypassing fork");
                return RouteDecision::Forward(fallback.clone(), request);
            }
        }

        self.strip_self_routes(&mut request);

        let targets = self.resolve_targets(&request).await;
        if targets.is_empty() {
            return match &self.config.fallback_route {
                Some(fallback) => {
                    info!(%fallback, "no targets, using fallback route");
                    RouteDecision::Forward(fallback.clone(), request)
                }
                None => RouteDecision::Respond(Response::reply_to(
                    &request,
                    404,
                    "Not Found",
                )),
            };
        }

        let (fork_config, counters) = match request.start.method {
            Method::Invite => (
                ForkConfig::call().with_fork_late(self.config.fork_late),
                self.call_counters.clone(),
            ),
            Method::Message => (ForkConfig::message(), self.message_counters.clone()),
            _ => (ForkConfig::basic(), self.message_counters.clone()),
        };

        let aor = request.start.uri.clone();
        let fork_late = fork_config.fork_late;
        let context = ForkContext::new(request, fork_config, counters, actions);

        for target in &targets {
            context.add_branch(&target.uri, &target.instance_id, target.push_capable);
        }

        // Fork-late: devices registering while the context lives become
        // new branches through the registrar subscription.
        if fork_late {
            let weak = Arc::downgrade(&context);
            self.registrar
                .subscribe(&aor, weak as std::sync::Weak<dyn ContactListener>);
        }

        RouteDecision::Fork(context)
    }

    /// Drops Route headers addressed to this proxy; foreign entries keep
    /// steering the next hop.
    fn strip_self_routes(&self, request: &mut Request) {
        let host = self.config.proxy_host.clone();
        let port = self.config.proxy_port;
        request.headers.retain_values("Route", |value| {
            match parse_address_list(value).first() {
                Some(addr) if addr.uri.addresses(&host, port) => {
                    debug!(route = %value, "removing self route");
                    false
                }
                _ => true,
            }
        });
    }

    async fn resolve_targets(&self, request: &Request) -> Vec<Target> {
        let mut targets: Vec<Target> = self
            .config
            .static_targets
            .iter()
            .map(Target::fixed)
            .collect();

        if let Some(listed) = request.headers.get("X-Target-Uris") {
            // The header replaces AOR resolution entirely.
            for addr in parse_address_list(listed) {
                targets.push(Target::fixed(&addr.uri));
            }
            return targets;
        }

        let for_message = request.start.method == Method::Message;
        for binding in self.registrar.fetch(&request.start.uri).await {
            if for_message && !binding.accepts_messages() {
                debug!(contact = %binding.contact, "binding refuses paging messages");
                continue;
            }
            targets.push(Target::from_binding(&binding));
        }
        targets
    }
}

/// Propagates a caller CANCEL into the fork context, translating the
/// Reason header into a cancellation status.
pub fn handle_cancel(context: &ForkContext, cancel: &Request) {
    let reason = cancel
        .headers
        .get("Reason")
        .and_then(|value| ReasonHeader::parse(value));
    context.on_cancel(reason.as_ref());
}

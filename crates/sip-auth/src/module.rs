// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Challenge/verify orchestration.
//!
//! Requests run through an ordered authenticator chain. The trusted-host
//! authenticator passes requests from configured peers without
//! credentials; the digest authenticator challenges and verifies
//! everything else against the credential store.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use smol_str::SmolStr;
use tracing::{debug, info, warn};

use sip_core::{Method, Request, Response};
use sip_runtime::{CancellationToken, Runtime};

use crate::digest::{DigestAlgorithm, DigestCredentials};
use crate::nonce::{NonceStatus, NonceStore};
use crate::store::CredentialStore;

/// Per-authenticator verdict inside the chain.
#[derive(Debug)]
pub enum ChainOutcome {
    /// Request is authenticated; stop the chain.
    Pass,
    /// Request is rejected or challenged with this response; stop.
    Fail(Response),
    /// This authenticator has no opinion; ask the next one.
    Continue,
    /// Chain is exhausted without a verdict.
    End,
}

/// Final decision for a request. Exactly one is produced per request.
#[derive(Debug)]
pub enum AuthDecision {
    Pass,
    /// 401/407 with fresh challenge headers.
    Challenge(Response),
    /// 400, 403 or 500.
    Reject(Response),
}

/// Authentication settings (the `auth` configuration section).
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub realm: SmolStr,
    /// Nonces older than this are answered with `stale=true`.
    pub nonce_expire: Duration,
    /// Enables RFC 7616 `qop=auth` with nonce-count accounting.
    pub qop_auth: bool,
    /// Requests whose Via source resolves into this set bypass auth.
    pub trusted_hosts: HashSet<IpAddr>,
    /// Challenge with 407/Proxy-Authenticate instead of 401.
    pub proxy_auth: bool,
    /// Offered algorithms, in preference order.
    pub algorithms: Vec<DigestAlgorithm>,
}

impl AuthConfig {
    pub fn new(realm: impl Into<SmolStr>) -> Self {
        Self {
            realm: realm.into(),
            nonce_expire: Duration::from_secs(3600),
            qop_auth: false,
            trusted_hosts: HashSet::new(),
            proxy_auth: false,
            algorithms: vec![
                DigestAlgorithm::Sha256,
                DigestAlgorithm::Sha256Sess,
                DigestAlgorithm::Md5,
            ],
        }
    }

    pub fn with_qop_auth(mut self, enabled: bool) -> Self {
        self.qop_auth = enabled;
        self
    }

    pub fn with_nonce_expire(mut self, expire: Duration) -> Self {
        self.nonce_expire = expire;
        self
    }

    pub fn with_trusted_host(mut self, host: IpAddr) -> Self {
        self.trusted_hosts.insert(host);
        self
    }
}

/// Digest authentication module with trusted-host bypass.
pub struct AuthModule<S: CredentialStore> {
    config: AuthConfig,
    nonces: NonceStore,
    store: Arc<S>,
}

impl<S: CredentialStore> AuthModule<S> {
    pub fn new(config: AuthConfig, store: Arc<S>) -> Self {
        let nonces = NonceStore::new(config.nonce_expire, config.qop_auth);
        Self {
            config,
            nonces,
            store,
        }
    }

    pub fn nonces(&self) -> &NonceStore {
        &self.nonces
    }

    /// Runs the authenticator chain for one request.
    pub async fn authenticate(&self, request: &Request) -> AuthDecision {
        // ACK and CANCEL share the fate of the transaction they belong to
        // and cannot be challenged (RFC 3261 §22.1).
        if matches!(request.start.method, Method::Ack | Method::Cancel) {
            return AuthDecision::Pass;
        }

        match self.check_trusted_host(request) {
            ChainOutcome::Pass => return AuthDecision::Pass,
            ChainOutcome::Fail(response) => return AuthDecision::Reject(response),
            ChainOutcome::Continue | ChainOutcome::End => {}
        }

        self.verify_digest(request).await
    }

    /// Detached variant: verifies off the caller's context and posts the
    /// completion back onto the owning loop. The completion runs at most
    /// once and never after `token` is cancelled.
    pub fn authenticate_detached(
        self: &Arc<Self>,
        request: Request,
        runtime: Runtime,
        token: CancellationToken,
        completion: impl FnOnce(AuthDecision) + Send + 'static,
    ) {
        let module = Arc::clone(self);
        tokio::spawn(async move {
            let decision = module.authenticate(&request).await;
            if token.is_cancelled() {
                debug!("authentication result dropped, transaction gone");
                return;
            }
            let posted = runtime.post_to_loop(move || {
                if !token.is_cancelled() {
                    completion(decision);
                }
            });
            if posted.is_err() {
                warn!("authentication completion lost, event loop stopped");
            }
        });
    }

    fn check_trusted_host(&self, request: &Request) -> ChainOutcome {
        if self.config.trusted_hosts.is_empty() {
            return ChainOutcome::Continue;
        }
        let via = match request.top_via() {
            Some(via) => via,
            None => return ChainOutcome::Continue,
        };
        match via.source_host().parse::<IpAddr>() {
            Ok(addr) if self.config.trusted_hosts.contains(&addr) => {
                debug!(%addr, "request from trusted host, bypassing digest");
                ChainOutcome::Pass
            }
            _ => ChainOutcome::Continue,
        }
    }

    async fn verify_digest(&self, request: &Request) -> AuthDecision {
        let header_name = if self.config.proxy_auth {
            "Proxy-Authorization"
        } else {
            "Authorization"
        };

        // Select the credentials addressed to our realm; other realms'
        // credentials ride through untouched.
        let mut credentials = None;
        let mut saw_malformed = false;
        for value in request.headers.get_all(header_name) {
            if !DigestCredentials::is_digest(value) {
                continue;
            }
            match DigestCredentials::parse(value) {
                Some(parsed) if parsed.realm == self.config.realm => {
                    credentials = Some(parsed);
                    break;
                }
                Some(_) => {}
                None => saw_malformed = true,
            }
        }

        let credentials = match credentials {
            Some(credentials) => credentials,
            None if saw_malformed => {
                return AuthDecision::Reject(Response::reply_to(
                    request,
                    400,
                    "Bad Request",
                ));
            }
            None => return AuthDecision::Challenge(self.challenge(request, false)),
        };

        match self.nonces.validate(&credentials.nonce, credentials.nc) {
            NonceStatus::Ok => {}
            NonceStatus::Stale => {
                info!(user = %credentials.username, "stale nonce, re-challenging");
                return AuthDecision::Challenge(self.challenge(request, true));
            }
            NonceStatus::Unknown => {
                info!(user = %credentials.username, "unknown or replayed nonce");
                return AuthDecision::Reject(Response::reply_to(request, 403, "Forbidden"));
            }
        }

        let secrets = match self
            .store
            .fetch(&credentials.username, &credentials.realm)
            .await
        {
            Ok(secrets) => secrets,
            Err(error) => {
                warn!(%error, "credential store unavailable");
                return AuthDecision::Reject(Response::reply_to(
                    request,
                    500,
                    "Server Internal Error",
                ));
            }
        };

        let method = request.start.method.as_str();
        let matched = secrets.iter().any(|secret| {
            credentials
                .expected_response(method, &request.body, secret)
                .is_some_and(|expected| expected == credentials.response.as_str())
        });

        if matched {
            self.nonces.record_use(&credentials.nonce, credentials.nc);
            debug!(user = %credentials.username, "digest verified");
            AuthDecision::Pass
        } else {
            info!(user = %credentials.username, "digest mismatch");
            AuthDecision::Reject(Response::reply_to(request, 403, "Forbidden"))
        }
    }

    /// Builds the 401/407 challenge, one header per offered algorithm.
    fn challenge(&self, request: &Request, stale: bool) -> Response {
        let (code, reason, header_name) = if self.config.proxy_auth {
            (407, "Proxy Authentication Required", "Proxy-Authenticate")
        } else {
            (401, "Unauthorized", "WWW-Authenticate")
        };

        let mut response = Response::reply_to(request, code, reason);
        let nonce = self.nonces.issue();
        for algorithm in &self.config.algorithms {
            let mut value = String::new();
            let _ = write!(
                value,
                "Digest realm=\"{}\", nonce=\"{}\", algorithm={}",
                self.config.realm,
                nonce,
                algorithm.as_str()
            );
            if self.config.qop_auth {
                value.push_str(", qop=\"auth\"");
            }
            if stale {
                value.push_str(", stale=true");
            }
            response.headers.push(SmolStr::new(header_name), SmolStr::new(value));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sip_core::{Headers, RequestLine, SipUri};

    use crate::store::{MemoryCredentialStore, StoredSecret};

    fn module(qop: bool) -> Arc<AuthModule<MemoryCredentialStore>> {
        let store = MemoryCredentialStore::new();
        store.add("alice", "example.com", StoredSecret::Cleartext("s3cret".into()));
        Arc::new(AuthModule::new(
            AuthConfig::new("example.com").with_qop_auth(qop),
            Arc::new(store),
        ))
    }

    fn request(authorization: Option<&str>) -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP 192.0.2.7:5060;branch=z9hG4bKa");
        headers.push("From", "<sip:alice@example.com>;tag=1");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "auth-test");
        headers.push("CSeq", "1 INVITE");
        if let Some(value) = authorization {
            headers.push("Authorization", SmolStr::new(value.to_owned()));
        }
        Request::new(
            RequestLine::new(Method::Invite, SipUri::parse("sip:bob@example.com").unwrap()),
            headers,
            Bytes::new(),
        )
    }

    fn authorization_for(nonce: &str, nc: u32) -> String {
        let header = format!(
            "Digest username=\"alice\", realm=\"example.com\", nonce=\"{}\", \
             uri=\"sip:bob@example.com\", response=\"x\", algorithm=SHA-256, \
             qop=auth, nc={:08x}, cnonce=\"deadbeef\"",
            nonce, nc
        );
        let creds = DigestCredentials::parse(&header).unwrap();
        let expected = creds
            .expected_response("INVITE", b"", &StoredSecret::Cleartext("s3cret".into()))
            .unwrap();
        header.replace("response=\"x\"", &format!("response=\"{}\"", expected))
    }

    #[tokio::test]
    async fn missing_credentials_get_challenged_per_algorithm() {
        let module = module(false);
        match module.authenticate(&request(None)).await {
            AuthDecision::Challenge(response) => {
                assert_eq!(response.code(), 401);
                let challenges: Vec<_> =
                    response.headers.get_all("WWW-Authenticate").collect();
                assert_eq!(challenges.len(), 3);
                assert!(challenges[0].contains("SHA-256"));
                assert!(challenges[2].contains("MD5"));
            }
            other => panic!("expected challenge, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn valid_digest_passes_and_replay_is_blocked() {
        let module = module(true);
        let nonce = module.nonces().issue();
        let auth = authorization_for(&nonce, 1);

        match module.authenticate(&request(Some(&auth))).await {
            AuthDecision::Pass => {}
            other => panic!("expected pass, got {:?}", other),
        }

        // Same nc again: the nonce store reports a replay.
        match module.authenticate(&request(Some(&auth))).await {
            AuthDecision::Reject(response) => assert_eq!(response.code(), 403),
            other => panic!("expected reject, got {:?}", other),
        }

        // Higher nc on the same nonce stays valid under qop=auth.
        let auth = authorization_for(&nonce, 2);
        match module.authenticate(&request(Some(&auth))).await {
            AuthDecision::Pass => {}
            other => panic!("expected pass, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stale_nonce_is_rechallenged_then_fresh_succeeds() {
        let store = MemoryCredentialStore::new();
        store.add("alice", "example.com", StoredSecret::Cleartext("s3cret".into()));
        let module = Arc::new(AuthModule::new(
            AuthConfig::new("example.com")
                .with_qop_auth(true)
                .with_nonce_expire(Duration::from_millis(200)),
            Arc::new(store),
        ));

        let nonce = module.nonces().issue();
        std::thread::sleep(Duration::from_millis(250));
        let auth = authorization_for(&nonce, 1);

        let fresh_nonce = match module.authenticate(&request(Some(&auth))).await {
            AuthDecision::Challenge(response) => {
                assert_eq!(response.code(), 401);
                let value = response.headers.get("WWW-Authenticate").unwrap();
                assert!(value.contains("stale=true"));
                value
                    .split("nonce=\"")
                    .nth(1)
                    .unwrap()
                    .split('"')
                    .next()
                    .unwrap()
                    .to_owned()
            }
            other => panic!("expected stale challenge, got {:?}", other),
        };

        let auth = authorization_for(&fresh_nonce, 1);
        match module.authenticate(&request(Some(&auth))).await {
            AuthDecision::Pass => {}
            other => panic!("expected pass after retry, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn wrong_password_is_forbidden() {
        let module = module(true);
        let nonce = module.nonces().issue();
        let auth = authorization_for(&nonce, 1)
            .replace("response=\"", "response=\"00");
        match module.authenticate(&request(Some(&auth))).await {
            AuthDecision::Reject(response) => assert_eq!(response.code(), 403),
            other => panic!("expected reject, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn trusted_host_bypasses_digest() {
        let store = MemoryCredentialStore::new();
        let module = AuthModule::new(
            AuthConfig::new("example.com")
                .with_trusted_host("192.0.2.7".parse().unwrap()),
            Arc::new(store),
        );
        match module.authenticate(&request(None)).await {
            AuthDecision::Pass => {}
            other => panic!("expected trusted-host pass, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancel_is_never_challenged() {
        let module = module(false);
        let mut req = request(None);
        req.start.method = Method::Cancel;
        assert!(matches!(
            module.authenticate(&req).await,
            AuthDecision::Pass
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn detached_completion_runs_on_loop_once() {
        let module = module(false);
        let (runtime, mut event_loop) = Runtime::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        module.authenticate_detached(
            request(None),
            runtime,
            CancellationToken::new(),
            move |decision| {
                let _ = tx.send(matches!(decision, AuthDecision::Challenge(_)));
            },
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        event_loop.drain();
        assert_eq!(rx.try_recv().ok(), Some(true));
        assert!(rx.try_recv().is_err());
    }
}

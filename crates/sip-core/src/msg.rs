// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{headers::Headers, method::Method, uri::SipUri, via::ViaHeader};

/// First line of a SIP request: method and Request-URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub uri: SipUri,
}

impl RequestLine {
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self { method, uri }
    }
}

/// First line of a SIP response: status code and reason phrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub code: u16,
    pub reason: SmolStr,
}

impl StatusLine {
    pub fn new(code: u16, reason: impl Into<SmolStr>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// An already-parsed SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub start: RequestLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    pub fn call_id(&self) -> Option<&SmolStr> {
        self.headers.get("Call-ID")
    }

    /// CSeq sequence number, when the header is well-formed.
    pub fn cseq(&self) -> Option<u32> {
        let value = self.headers.get("CSeq")?;
        value.split_whitespace().next()?.parse().ok()
    }

    /// Topmost Via, parsed.
    pub fn top_via(&self) -> Option<ViaHeader> {
        self.headers.get("Via").and_then(|v| ViaHeader::parse(v))
    }
}

/// An already-parsed SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub start: StatusLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Self {
        Self {
            start,
            headers,
            body,
        }
    }

    /// Builds a response to `request`, copying the headers RFC 3261 §8.2.6
    /// requires (Via stack, From, To, Call-ID, CSeq).
    pub fn reply_to(request: &Request, code: u16, reason: impl Into<SmolStr>) -> Self {
        let mut headers = Headers::new();
        for via in request.headers.get_all("Via") {
            headers.push("Via", via.clone());
        }
        for name in ["From", "To", "Call-ID", "CSeq"] {
            if let Some(value) = request.headers.get(name) {
                headers.push(SmolStr::new(name), value.clone());
            }
        }
        Self::new(StatusLine::new(code, reason), headers, Bytes::new())
    }

    pub fn code(&self) -> u16 {
        self.start.code
    }

    pub fn is_provisional(&self) -> bool {
        self.start.code < 200
    }

    pub fn is_final(&self) -> bool {
        self.start.code >= 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.start.code)
    }

    pub fn call_id(&self) -> Option<&SmolStr> {
        self.headers.get("Call-ID")
    }
}

// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Request/response builders shared by the workspace tests.
//!
//! # Example
//! ```
//! use sip_testkit::build_invite;
//! let req = build_invite("sip:callee@sip.test.org", "z9hG4bKtest", "call-1");
//! assert_eq!(req.start.method.as_str(), "INVITE");
//! ```

use bytes::Bytes;
use smol_str::SmolStr;

use sip_core::{Headers, Method, Request, RequestLine, Response, SipUri};

fn base_headers(from: &str, to: &str, call_id: &str, cseq: &str, branch: &str) -> Headers {
    let mut headers = Headers::new();
    headers.push(
        "Via",
        SmolStr::new(format!(
            "SIP/2.0/UDP client.sip.test.org:5060;branch={}",
            branch
        )),
    );
    headers.push("From", SmolStr::new(format!("<{}>;tag=1928301774", from)));
    headers.push("To", SmolStr::new(format!("<{}>", to)));
    headers.push("Call-ID", SmolStr::new(call_id.to_owned()));
    headers.push("CSeq", SmolStr::new(cseq.to_owned()));
    headers.push("Max-Forwards", "70");
    headers
}

/// Minimal INVITE towards `uri`.
pub fn build_invite(uri: &str, branch: &str, call_id: &str) -> Request {
    let mut headers = base_headers(
        "sip:caller@sip.test.org",
        uri,
        call_id,
        "20 INVITE",
        branch,
    );
    headers.push("Contact", "<sip:caller@client.sip.test.org:5060>");
    headers.push("Content-Length", "0");
    Request::new(
        RequestLine::new(Method::Invite, SipUri::parse(uri).unwrap()),
        headers,
        Bytes::new(),
    )
}

/// Minimal MESSAGE towards `uri`.
pub fn build_message(uri: &str, call_id: &str) -> Request {
    let mut headers = base_headers(
        "sip:caller@sip.test.org",
        uri,
        call_id,
        "1 MESSAGE",
        "z9hG4bKmsg",
    );
    headers.push("Content-Type", "text/plain");
    let body = Bytes::from_static(b"hello");
    headers.push("Content-Length", SmolStr::new(body.len().to_string()));
    Request::new(
        RequestLine::new(Method::Message, SipUri::parse(uri).unwrap()),
        headers,
        body,
    )
}

/// CANCEL matching a previously built INVITE, with an optional Reason.
pub fn build_cancel(uri: &str, branch: &str, call_id: &str, reason: Option<&str>) -> Request {
    let mut headers = base_headers(
        "sip:caller@sip.test.org",
        uri,
        call_id,
        "20 CANCEL",
        branch,
    );
    if let Some(reason) = reason {
        headers.push("Reason", SmolStr::new(reason.to_owned()));
    }
    headers.push("Content-Length", "0");
    Request::new(
        RequestLine::new(Method::Cancel, SipUri::parse(uri).unwrap()),
        headers,
        Bytes::new(),
    )
}

/// REGISTER binding `contact` (a full Contact header value) to `aor`.
pub fn build_register(aor: &str, contact: &str, call_id: &str, cseq: u32) -> Request {
    let domain = SipUri::parse(aor).unwrap();
    let registrar = format!("sip:{}", domain.host());
    let mut headers = base_headers(aor, aor, call_id, &format!("{} REGISTER", cseq), "z9hG4bKreg");
    headers.push("Contact", SmolStr::new(contact.to_owned()));
    headers.push("Expires", "3600");
    headers.push("Content-Length", "0");
    Request::new(
        RequestLine::new(Method::Register, SipUri::parse(&registrar).unwrap()),
        headers,
        Bytes::new(),
    )
}

/// Response to `request` with the mandatory headers mirrored.
pub fn build_response_to(request: &Request, code: u16, reason: &str) -> Response {
    let mut response = Response::reply_to(request, code, reason);
    if (200..300).contains(&code) {
        response
            .headers
            .push("Contact", "<sip:device@10.0.0.2:5060>");
    }
    response
}

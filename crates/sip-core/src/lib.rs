// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Core SIP types shared by the conflux routing and bridging crates.
//!
//! This crate provides the already-parsed message model the rest of the
//! workspace operates on:
//! - **Messages**: [`Request`], [`Response`]
//! - **Headers**: [`Headers`] container plus typed values ([`ViaHeader`],
//!   [`ReasonHeader`], [`NameAddr`])
//! - **URIs**: [`SipUri`] with address-of-record canonicalisation
//! - **Bodies**: [`SipFrag`] (transfer NOTIFY payloads) and
//!   message-summary (MWI) rewriting
//!
//! The on-wire grammar is out of scope; messages enter the workspace
//! already framed. Header *values* that the routing core must interpret
//! (Via parameters, Reason causes, contact lists) are parsed here.
//!
//! Types use [`SmolStr`](smol_str::SmolStr) for header text and
//! [`Bytes`](bytes::Bytes) for bodies.

pub mod headers;
pub mod method;
pub mod msg;
pub mod mwi;
pub mod name_addr;
pub mod reason;
pub mod sipfrag;
pub mod uri;
pub mod via;

pub use headers::{Header, Headers};
pub use method::Method;
pub use msg::{Request, RequestLine, Response, StatusLine};
pub use mwi::MessageSummary;
pub use name_addr::{parse_address_list, NameAddr};
pub use reason::ReasonHeader;
pub use sipfrag::SipFrag;
pub use uri::SipUri;
pub use via::ViaHeader;

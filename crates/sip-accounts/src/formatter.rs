// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Template interpolation for indexed account views.
//!
//! Grammar: `'{' <ident> '}' | any-other-char`. Recognised fields are
//! `{uri}`, `{user}`, `{domain}` and `{alias}`; anything else is a
//! configuration error reported at view creation.

use anyhow::{bail, Result};
use smol_str::SmolStr;

use crate::account::Account;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Literal(SmolStr),
    Field(AccountField),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccountField {
    Uri,
    User,
    Domain,
    Alias,
}

/// A compiled key template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formatter {
    template: SmolStr,
    pieces: Vec<Piece>,
}

impl Formatter {
    pub fn parse(template: &str) -> Result<Self> {
        let mut pieces = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars();

        while let Some(c) = chars.next() {
            if c != '{' {
                literal.push(c);
                continue;
            }
            if !literal.is_empty() {
                pieces.push(Piece::Literal(SmolStr::new(&literal)));
                literal.clear();
            }
            let mut ident = String::new();
            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(c) => ident.push(c),
                    None => bail!("unterminated field in template '{}'", template),
                }
            }
            let field = match ident.as_str() {
                "uri" => AccountField::Uri,
                "user" => AccountField::User,
                "domain" => AccountField::Domain,
                "alias" => AccountField::Alias,
                other => bail!("unknown template field '{{{}}}'", other),
            };
            pieces.push(Piece::Field(field));
        }
        if !literal.is_empty() {
            pieces.push(Piece::Literal(SmolStr::new(&literal)));
        }

        Ok(Self {
            template: SmolStr::new(template),
            pieces,
        })
    }

    /// The pool's default `{uri}` key template.
    pub fn identity() -> Self {
        Self {
            template: SmolStr::new("{uri}"),
            pieces: vec![Piece::Field(AccountField::Uri)],
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Computes this view's key for an account.
    pub fn format(&self, account: &Account) -> String {
        let mut out = String::new();
        for piece in &self.pieces {
            match piece {
                Piece::Literal(text) => out.push_str(text),
                Piece::Field(AccountField::Uri) => {
                    out.push_str(&account.identity().to_string())
                }
                Piece::Field(AccountField::User) => {
                    out.push_str(account.identity().user().unwrap_or(""))
                }
                Piece::Field(AccountField::Domain) => out.push_str(account.identity().host()),
                Piece::Field(AccountField::Alias) => out.push_str(&account.alias()),
            }
        }
        out
    }
}

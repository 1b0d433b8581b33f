// conflux-rs - SIP fork-routing proxy and B2BUA core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Boolean filter expressions over a request.
//!
//! Grammar, parsed at configuration time (a malformed expression is a
//! start-up failure, never a request-time one):
//!
//! ```text
//! expr    := term ( '||' term )*
//! term    := factor ( '&&' factor )*
//! factor  := '(' expr ')' | field ( '==' | '!=' ) literal
//! field   := 'request.method' | 'request.uri.user' | 'request.uri.domain'
//! literal := '\'' chars '\''
//! ```

use anyhow::{anyhow, bail, Result};
use smol_str::SmolStr;

use sip_core::Request;

/// A compiled filter expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterExpr {
    Or(Box<FilterExpr>, Box<FilterExpr>),
    And(Box<FilterExpr>, Box<FilterExpr>),
    Compare {
        field: Field,
        negated: bool,
        literal: SmolStr,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Method,
    UriUser,
    UriDomain,
}

impl FilterExpr {
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            bail!("trailing input in filter expression");
        }
        Ok(expr)
    }

    pub fn evaluate(&self, request: &Request) -> bool {
        match self {
            FilterExpr::Or(a, b) => a.evaluate(request) || b.evaluate(request),
            FilterExpr::And(a, b) => a.evaluate(request) && b.evaluate(request),
            FilterExpr::Compare {
                field,
                negated,
                literal,
            } => {
                let value = match field {
                    Field::Method => request.start.method.as_str().to_owned(),
                    Field::UriUser => request.start.uri.user().unwrap_or("").to_owned(),
                    Field::UriDomain => request.start.uri.host().to_owned(),
                };
                let equal = value == literal.as_str();
                equal != *negated
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(SmolStr),
    Literal(SmolStr),
    Eq,
    Ne,
    And,
    Or,
    Open,
    Close,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(i, c)) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '\'' => {
                chars.next();
                let start = i + 1;
                let mut end = None;
                for (j, c) in chars.by_ref() {
                    if c == '\'' {
                        end = Some(j);
                        break;
                    }
                }
                let end = end.ok_or_else(|| anyhow!("unterminated string literal"))?;
                tokens.push(Token::Literal(SmolStr::new(&input[start..end])));
            }
            '=' | '!' | '&' | '|' => {
                chars.next();
                let second = chars.peek().map(|&(_, c)| c);
                let token = match (c, second) {
                    ('=', Some('=')) => Token::Eq,
                    ('!', Some('=')) => Token::Ne,
                    ('&', Some('&')) => Token::And,
                    ('|', Some('|')) => Token::Or,
                    _ => bail!("unexpected operator at byte {}", i),
                };
                chars.next();
                tokens.push(token);
            }
            c if c.is_ascii_alphanumeric() || c == '.' || c == '_' => {
                let start = i;
                let mut end = i;
                while let Some(&(j, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
                        end = j + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(SmolStr::new(&input[start..end])));
            }
            other => bail!("unexpected character '{}' in filter expression", other),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn expr(&mut self) -> Result<FilterExpr> {
        let mut left = self.term()?;
        while self.eat(&Token::Or) {
            let right = self.term()?;
            left = FilterExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<FilterExpr> {
        let mut left = self.factor()?;
        while self.eat(&Token::And) {
            let right = self.factor()?;
            left = FilterExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<FilterExpr> {
        if self.eat(&Token::Open) {
            let inner = self.expr()?;
            if !self.eat(&Token::Close) {
                bail!("missing closing parenthesis");
            }
            return Ok(inner);
        }

        let field = match self.next() {
            Some(Token::Ident(name)) => match name.as_str() {
                "request.method" => Field::Method,
                "request.uri.user" => Field::UriUser,
                "request.uri.domain" => Field::UriDomain,
                other => bail!("unknown filter field '{}'", other),
            },
            other => bail!("expected field, got {:?}", other),
        };

        let negated = match self.next() {
            Some(Token::Eq) => false,
            Some(Token::Ne) => true,
            other => bail!("expected comparison operator, got {:?}", other),
        };

        let literal = match self.next() {
            Some(Token::Literal(value)) => value,
            other => bail!("expected string literal, got {:?}", other),
        };

        Ok(FilterExpr::Compare {
            field,
            negated,
            literal,
        })
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.tokens.get(self.pos) == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sip_core::{Headers, Method, RequestLine, SipUri};

    fn request(method: Method, uri: &str) -> Request {
        Request::new(
            RequestLine::new(method, SipUri::parse(uri).unwrap()),
            Headers::new(),
            Bytes::new(),
        )
    }

    #[test]
    fn method_comparison() {
        let filter = FilterExpr::parse("request.method != 'INVITE'").unwrap();
        assert!(!filter.evaluate(&request(Method::Invite, "sip:x@h.example")));
        assert!(filter.evaluate(&request(Method::Message, "sip:x@h.example")));
    }

    #[test]
    fn conjunction_and_parentheses() {
        let filter = FilterExpr::parse(
            "(request.method == 'MESSAGE' || request.method == 'INVITE') && request.uri.domain == 'h.example'",
        )
        .unwrap();
        assert!(filter.evaluate(&request(Method::Invite, "sip:x@h.example")));
        assert!(!filter.evaluate(&request(Method::Invite, "sip:x@other.example")));
        assert!(!filter.evaluate(&request(Method::Register, "sip:x@h.example")));
    }

    #[test]
    fn uri_user_field() {
        let filter = FilterExpr::parse("request.uri.user == 'alarm'").unwrap();
        assert!(filter.evaluate(&request(Method::Invite, "sip:alarm@h.example")));
        assert!(!filter.evaluate(&request(Method::Invite, "sip:bob@h.example")));
    }

    #[test]
    fn malformed_expressions_fail_at_parse_time() {
        assert!(FilterExpr::parse("request.method ==").is_err());
        assert!(FilterExpr::parse("request.method = 'X'").is_err());
        assert!(FilterExpr::parse("request.bogus == 'X'").is_err());
        assert!(FilterExpr::parse("(request.method == 'X'").is_err());
        assert!(FilterExpr::parse("request.method == 'X' garbage").is_err());
    }
}

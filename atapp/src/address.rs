// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Listen/connect address parsing
//!
//! Addresses take the form `scheme://host[:port][/path]`. The scheme alone
//! decides which connector handles the address; everything past it is the
//! connector's business. The scheme is lowercased during parsing so lookup
//! in the connector registry is case-insensitive.

use std::fmt::Display;

use crate::errors::AppError;

/// Advisory classification flags for an address, reported by connectors
/// through [crate::connector::Connector::address_type]. Used by tooling
/// only - routing never inspects these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressType(u32);

impl AddressType {
    /// No classification known
    pub const NONE: AddressType = AddressType(0);
    /// Address reaches the local machine only
    pub const LOCAL: AddressType = AddressType(0x01);
    /// Address is a pipe/unix-domain style path
    pub const PIPE: AddressType = AddressType(0x02);
    /// Address resolves over IPv4
    pub const IPV4: AddressType = AddressType(0x04);
    /// Address resolves over IPv6
    pub const IPV6: AddressType = AddressType(0x08);
    /// Address requires a name lookup
    pub const DNS: AddressType = AddressType(0x10);

    /// Union of two flag sets
    pub fn with(self, other: AddressType) -> AddressType {
        AddressType(self.0 | other.0)
    }

    /// Whether every flag in `other` is present
    pub fn contains(&self, other: AddressType) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// A parsed `scheme://host[:port][/path]` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// Lowercased scheme, e.g. `tcp`, `mem`
    pub scheme: String,
    /// Host portion; may be a hostname, an IP literal or a pseudo-host
    pub host: String,
    /// Optional port
    pub port: Option<u16>,
    /// Path portion including the leading `/`, empty when absent
    pub path: String,
}

impl Address {
    /// Parse an address string.
    ///
    /// Fails with [AppError::BadData] when the scheme separator is missing,
    /// the scheme or host is empty, or the port does not parse.
    pub fn parse(input: &str) -> Result<Self, AppError> {
        let input = input.trim();
        let (scheme, rest) = input.split_once("://").ok_or(AppError::BadData)?;
        if scheme.is_empty() {
            return Err(AppError::BadData);
        }

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, String::new()),
        };
        if authority.is_empty() {
            return Err(AppError::BadData);
        }

        // IPv6 literals keep their colons inside brackets
        let (host, port) = if let Some(closing) = authority.strip_prefix('[') {
            let (inner, tail) = closing.split_once(']').ok_or(AppError::BadData)?;
            let port = match tail.strip_prefix(':') {
                Some(p) => Some(p.parse::<u16>().map_err(|_| AppError::BadData)?),
                None if tail.is_empty() => None,
                None => return Err(AppError::BadData),
            };
            (inner.to_string(), port)
        } else {
            match authority.rsplit_once(':') {
                Some((h, p)) => (
                    h.to_string(),
                    Some(p.parse::<u16>().map_err(|_| AppError::BadData)?),
                ),
                None => (authority.to_string(), None),
            }
        };
        if host.is_empty() {
            return Err(AppError::BadData);
        }

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            host,
            port,
            path,
        })
    }

    /// The `host:port` pair, as accepted by socket connect/bind calls.
    /// Hosts containing `:` (IPv6 literals) are re-bracketed.
    pub fn host_port(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.port {
            Some(p) => format!("{host}:{p}"),
            None => host,
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.host_port(), self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_host_port() {
        let addr = Address::parse("TCP://node1.example.com:9200").expect("parse");
        assert_eq!("tcp", addr.scheme);
        assert_eq!("node1.example.com", addr.host);
        assert_eq!(Some(9200), addr.port);
        assert_eq!("", addr.path);
    }

    #[test]
    fn parses_path_and_no_port() {
        let addr = Address::parse("unix://local/run/atapp.sock").expect("parse");
        assert_eq!("unix", addr.scheme);
        assert_eq!("local", addr.host);
        assert_eq!(None, addr.port);
        assert_eq!("/run/atapp.sock", addr.path);
    }

    #[test]
    fn parses_ipv6_literal() {
        let addr = Address::parse("ipv6://[::1]:9000").expect("parse");
        assert_eq!("::1", addr.host);
        assert_eq!(Some(9000), addr.port);
        assert_eq!("[::1]:9000", addr.host_port());
    }

    #[test]
    fn rejects_malformed() {
        assert!(Address::parse("no-scheme-here").is_err());
        assert!(Address::parse("tcp://").is_err());
        assert!(Address::parse("tcp://host:notaport").is_err());
        assert!(Address::parse("://host:1").is_err());
    }

    #[test]
    fn display_round_trips() {
        for input in ["tcp://h:9", "mem://router", "ipv6://[::1]:9000/x"] {
            let addr = Address::parse(input).expect("parse");
            assert_eq!(input, addr.to_string());
        }
    }

    #[test]
    fn address_type_flags_combine() {
        let t = AddressType::IPV4.with(AddressType::LOCAL);
        assert!(t.contains(AddressType::IPV4));
        assert!(t.contains(AddressType::LOCAL));
        assert!(!t.contains(AddressType::PIPE));
    }
}

// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Next-hop addressing.
//!
//! A [`HopAddress`] names the peer a router picked for an outbound message.
//! It owns no socket; channel processors turn it into a channel on demand.

use std::fmt;
use std::str::FromStr;

use smol_str::SmolStr;

use crate::TransportKind;

/// Port assumed when the textual form omits one.
pub const DEFAULT_HOP_PORT: u16 = 5060;

/// Errors returned when a hop string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedHopError {
    /// Input was empty or whitespace.
    Empty,
    /// No host before the port or transport.
    MissingHost,
    /// `[` without a closing `]`, or a stray `]`.
    UnmatchedBracket,
    /// Port is not a number in 0..=65535.
    InvalidPort(String),
    /// Transport is not one of UDP, TCP, TLS, WS, WSS.
    UnknownTransport(String),
}

impl fmt::Display for MalformedHopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty hop"),
            Self::MissingHost => write!(f, "hop has no host"),
            Self::UnmatchedBracket => write!(f, "unmatched bracket in IPv6 hop"),
            Self::InvalidPort(port) => write!(f, "invalid hop port '{}'", port),
            Self::UnknownTransport(t) => write!(f, "unknown hop transport '{}'", t),
        }
    }
}

impl std::error::Error for MalformedHopError {}

/// Next-hop peer plus how the router chose it.
///
/// Host, port and transport never change after construction. The provenance
/// markers can only be raised, by the router.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HopAddress {
    host: SmolStr,
    port: u16,
    transport: TransportKind,
    explicit_route: bool,
    default_route: bool,
    uri_route: bool,
}

impl HopAddress {
    /// Builds a hop programmatically. Bare IPv6 literals are bracketed.
    pub fn new(host: &str, port: u16, transport: TransportKind) -> Self {
        let host = if host.contains(':') && !host.starts_with('[') {
            SmolStr::new(format!("[{}]", host))
        } else {
            SmolStr::new(host)
        };
        Self {
            host,
            port,
            transport,
            explicit_route: false,
            default_route: false,
            uri_route: false,
        }
    }

    /// Parses `host[:port][/TRANSPORT]`.
    ///
    /// # Examples
    ///
    /// ```
    /// use sip_transport::{HopAddress, TransportKind};
    ///
    /// let hop = HopAddress::parse("proxy.example.com:5080/tcp").unwrap();
    /// assert_eq!(hop.host(), "proxy.example.com");
    /// assert_eq!(hop.port(), 5080);
    /// assert_eq!(hop.transport(), TransportKind::Tcp);
    ///
    /// let hop = HopAddress::parse("::1").unwrap();
    /// assert_eq!(hop.to_string(), "[::1]:5060/UDP");
    /// ```
    pub fn parse(text: &str) -> Result<Self, MalformedHopError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(MalformedHopError::Empty);
        }

        // The last '/' separates the transport; IPv6 literals never contain one.
        let (addr, transport) = match text.rsplit_once('/') {
            Some((addr, transport)) => {
                let kind = TransportKind::parse(transport).ok_or_else(|| {
                    MalformedHopError::UnknownTransport(transport.trim().to_owned())
                })?;
                (addr.trim(), kind)
            }
            None => (text, TransportKind::Udp),
        };

        let (host, port) = split_host_port(addr)?;
        Ok(Self::new(&host, port, transport))
    }

    pub fn host(&self) -> &str {
        self.host.as_str()
    }

    /// Host without IPv6 brackets, suitable for name resolution.
    pub fn unbracketed_host(&self) -> &str {
        self.host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(self.host.as_str())
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn is_explicit_route(&self) -> bool {
        self.explicit_route
    }

    pub fn is_default_route(&self) -> bool {
        self.default_route
    }

    pub fn is_uri_route(&self) -> bool {
        self.uri_route
    }

    /// Marks the hop as taken from an explicit Route header.
    pub fn mark_explicit_route(&mut self) {
        self.explicit_route = true;
    }

    /// Marks the hop as the configured outbound proxy.
    pub fn mark_default_route(&mut self) {
        self.default_route = true;
    }

    /// Marks the hop as derived from the Request-URI.
    pub fn mark_uri_route(&mut self) {
        self.uri_route = true;
    }
}

impl fmt::Display for HopAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}",
            self.host,
            self.port,
            self.transport.via_transport()
        )
    }
}

impl FromStr for HopAddress {
    type Err = MalformedHopError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Splits the three host shapes: `[v6]:port`, bare v6, and `host:port`.
fn split_host_port(addr: &str) -> Result<(String, u16), MalformedHopError> {
    if let Some(rest) = addr.strip_prefix('[') {
        let end = rest.find(']').ok_or(MalformedHopError::UnmatchedBracket)?;
        let literal = &rest[..end];
        if literal.is_empty() {
            return Err(MalformedHopError::MissingHost);
        }
        let after = &rest[end + 1..];
        let port = if after.is_empty() {
            DEFAULT_HOP_PORT
        } else {
            let port = after
                .strip_prefix(':')
                .ok_or_else(|| MalformedHopError::InvalidPort(after.to_owned()))?;
            parse_port(port)?
        };
        return Ok((format!("[{}]", literal), port));
    }

    if addr.contains(']') {
        return Err(MalformedHopError::UnmatchedBracket);
    }

    if addr.matches(':').count() > 1 {
        return Ok((format!("[{}]", addr), DEFAULT_HOP_PORT));
    }

    let (host, port) = match addr.split_once(':') {
        Some((host, port)) => (host, parse_port(port)?),
        None => (addr, DEFAULT_HOP_PORT),
    };
    if host.is_empty() {
        return Err(MalformedHopError::MissingHost);
    }
    Ok((host.to_owned(), port))
}

fn parse_port(port: &str) -> Result<u16, MalformedHopError> {
    let port = port.trim();
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(MalformedHopError::InvalidPort(port.to_owned()));
    }
    port.parse::<u16>()
        .map_err(|_| MalformedHopError::InvalidPort(port.to_owned()))
}

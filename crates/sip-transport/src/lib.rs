// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Stream transport core for SIP.
//!
//! Turns a next hop (`host`, `port`, transport) into a reusable, framed
//! channel and multiplexes every channel of one transport over a single
//! reactor task:
//!
//! - [`HopAddress`]: parsed `host[:port]/TRANSPORT` next-hop value
//! - [`KeyedMutex`]: single-flight locking scoped to a channel key
//! - [`ChannelProcessor`]: per-transport registry and factory of [`Channel`]s
//! - [`Channel`]: keyed, cacheable connection with plain stream or WebSocket framing
//! - [`AckDispatchStrategy`]: override point for ACK delivery
//! - [`Transports`]: hop-based outbound sends across processors
//!
//! Inbound SIP messages are handed to the embedding stack as [`InboundFrame`]s;
//! this crate never interprets SIP syntax beyond message delimiting.

pub mod ack;
mod channel;
pub mod dispatch;
mod error;
mod framing;
pub mod hop;
pub mod keyed_mutex;
pub mod processor;
mod reactor;
#[cfg(feature = "tls")]
pub mod tls;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

pub use ack::{AckDispatchStrategy, ChannelAckDispatch, OutboundAck, SendError};
pub use channel::{channel_key, Channel, WsPhase};
pub use dispatch::Transports;
pub use error::TransportError;
pub use hop::{HopAddress, MalformedHopError, DEFAULT_HOP_PORT};
pub use keyed_mutex::{AcquisitionTimeoutError, KeyGuard, KeyedMutex, DEFAULT_ACQUIRE_TIMEOUT};
pub use processor::{ChannelProcessor, ProcessorConfig};
#[cfg(feature = "tls")]
pub use tls::{load_rustls_server_config, TlsSettings};

/// Indicates which transport carried an inbound or outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
    /// SIP over WebSocket (RFC 7118)
    Ws,
    /// SIP over secure WebSocket (RFC 7118)
    Wss,
}

impl TransportKind {
    /// Returns the lowercase transport string for metrics and logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
            TransportKind::Ws => "ws",
            TransportKind::Wss => "wss",
        }
    }

    /// Returns the Via header transport parameter value.
    ///
    /// # Examples
    ///
    /// ```
    /// use sip_transport::TransportKind;
    ///
    /// assert_eq!(TransportKind::Tcp.via_transport(), "TCP");
    /// assert_eq!(TransportKind::Wss.via_transport(), "WSS");
    /// ```
    pub fn via_transport(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
            TransportKind::Ws => "WS",
            TransportKind::Wss => "WSS",
        }
    }

    /// Parses a transport string (case-insensitive) into a TransportKind.
    ///
    /// # Examples
    ///
    /// ```
    /// use sip_transport::TransportKind;
    ///
    /// assert_eq!(TransportKind::parse("UDP"), Some(TransportKind::Udp));
    /// assert_eq!(TransportKind::parse("ws"), Some(TransportKind::Ws));
    /// assert_eq!(TransportKind::parse("sctp"), None);
    /// ```
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Some(TransportKind::Udp),
            "tcp" => Some(TransportKind::Tcp),
            "tls" => Some(TransportKind::Tls),
            "ws" => Some(TransportKind::Ws),
            "wss" => Some(TransportKind::Wss),
            _ => None,
        }
    }

    /// Returns true if this transport requires a persistent connection.
    pub fn is_stream_based(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }

    /// Returns true if this transport is carried over TLS.
    pub fn is_secure(&self) -> bool {
        matches!(self, TransportKind::Tls | TransportKind::Wss)
    }

    /// Returns true if messages are wrapped in WebSocket frames.
    pub fn is_websocket(&self) -> bool {
        matches!(self, TransportKind::Ws | TransportKind::Wss)
    }

    /// Default listening port for the transport.
    pub fn default_port(&self) -> u16 {
        match self {
            TransportKind::Udp | TransportKind::Tcp => 5060,
            TransportKind::Tls => 5061,
            TransportKind::Ws => 80,
            TransportKind::Wss => 443,
        }
    }
}

/// One complete SIP message read from a channel, ready for the parser.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub transport: TransportKind,
    pub peer: SocketAddr,
    /// Registry key of the channel the message arrived on.
    pub key: String,
    pub payload: Bytes,
    /// Channel to answer on (responses over stream transports reuse the connection).
    pub channel: Arc<Channel>,
}

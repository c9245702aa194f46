// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;
use std::io;
use std::time::Duration;

use crate::keyed_mutex::AcquisitionTimeoutError;
use crate::TransportKind;

/// Failures surfaced by channel processors and channels.
///
/// Callers own retry and failover; nothing in this crate retries on their
/// behalf.
#[derive(Debug)]
pub enum TransportError {
    /// Socket-level failure during connect, read or write.
    Io(io::Error),
    /// The per-key creation lock could not be obtained in time.
    AcquisitionTimeout(AcquisitionTimeoutError),
    /// Connecting to the peer did not complete in time.
    ConnectTimeout { key: String, after: Duration },
    /// The host name did not resolve to any address.
    Resolve(String),
    /// Malformed or rejected WebSocket upgrade.
    Handshake(String),
    /// Malformed WebSocket frame.
    FrameDecode(String),
    /// Message boundary could not be determined on a stream channel.
    Framing(String),
    /// Message exceeds the processor's maximum message size.
    MessageTooLarge { len: usize, max: usize },
    /// The peer stopped reading and replies to it backed up.
    Stalled,
    /// The channel or processor has been closed.
    Closed,
    /// The processor has not been started (or was already stopped).
    NotStarted,
    /// No processor or support is available for the transport.
    Unsupported(TransportKind),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "transport I/O error: {}", e),
            Self::AcquisitionTimeout(e) => write!(f, "{}", e),
            Self::ConnectTimeout { key, after } => {
                write!(f, "connect to {} timed out after {:?}", key, after)
            }
            Self::Resolve(host) => write!(f, "could not resolve host {}", host),
            Self::Handshake(reason) => write!(f, "websocket handshake failed: {}", reason),
            Self::FrameDecode(reason) => write!(f, "websocket frame rejected: {}", reason),
            Self::Framing(reason) => write!(f, "stream framing error: {}", reason),
            Self::MessageTooLarge { len, max } => {
                write!(f, "message of {} bytes exceeds limit of {} bytes", len, max)
            }
            Self::Stalled => write!(f, "peer is not reading; reply queue full"),
            Self::Closed => write!(f, "channel closed"),
            Self::NotStarted => write!(f, "channel processor not running"),
            Self::Unsupported(kind) => {
                write!(f, "transport {} is not supported here", kind.via_transport())
            }
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::AcquisitionTimeout(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<AcquisitionTimeoutError> for TransportError {
    fn from(e: AcquisitionTimeoutError) -> Self {
        Self::AcquisitionTimeout(e)
    }
}

impl TransportError {
    /// Low-cardinality label for metrics.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::AcquisitionTimeout(_) => "lock",
            Self::ConnectTimeout { .. } => "connect",
            Self::Resolve(_) => "resolve",
            Self::Handshake(_) => "handshake",
            Self::FrameDecode(_) => "frame",
            Self::Framing(_) => "framing",
            Self::MessageTooLarge { .. } => "oversize",
            Self::Stalled => "stalled",
            Self::Closed => "closed",
            Self::NotStarted => "not_started",
            Self::Unsupported(_) => "unsupported",
        }
    }
}

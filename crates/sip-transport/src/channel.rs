// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use sip_observe::transport_metrics;
use smol_str::SmolStr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::framing::{drain_sip_frames, KEEPALIVE_PONG};
use crate::reactor::ReactorCommand;
use crate::ws::{self, Opcode, WsDecoder, WsMessage, WsRole, MAX_HANDSHAKE_LEN};
use crate::{TransportError, TransportKind};

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Builds the registry key for a peer: `host:port/TRANSPORT`.
///
/// Host names are lowercased and bare IPv6 literals bracketed, so every
/// spelling of the same peer maps to one key.
///
/// ```
/// use sip_transport::{channel_key, TransportKind};
///
/// assert_eq!(channel_key("Proxy.Example.com", 5060, TransportKind::Tcp), "proxy.example.com:5060/TCP");
/// assert_eq!(channel_key("::1", 443, TransportKind::Wss), "[::1]:443/WSS");
/// ```
pub fn channel_key(host: &str, port: u16, transport: TransportKind) -> String {
    let host = host.to_ascii_lowercase();
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}/{}", host, port, transport.via_transport())
    } else {
        format!("{}:{}/{}", host, port, transport.via_transport())
    }
}

/// Splits a connected stream into boxed halves.
pub(crate) fn split_boxed<S>(stream: S) -> (BoxedReader, BoxedWriter)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    (Box::new(reader), Box::new(writer))
}

/// Lifecycle of the WebSocket layer on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsPhase {
    /// Waiting for the client's HTTP upgrade request.
    Handshaking,
    /// Upgrade accepted; the 101 reply is being written.
    Upgrading,
    /// Frames flow in both directions.
    Framed,
}

#[derive(Debug)]
pub(crate) struct WsFraming {
    role: WsRole,
    phase: WsPhase,
    decoder: WsDecoder,
}

/// How bytes on the wire map to SIP messages.
#[derive(Debug)]
pub(crate) enum Framing {
    /// Content-Length delimited messages on the raw stream.
    Stream,
    /// One SIP message per WebSocket message.
    WebSocket(WsFraming),
}

impl Framing {
    /// Framing for a connection we accepted.
    pub(crate) fn accepted(transport: TransportKind, max_len: usize) -> Self {
        if transport.is_websocket() {
            Framing::WebSocket(WsFraming {
                role: WsRole::Server,
                phase: WsPhase::Handshaking,
                decoder: WsDecoder::new(WsRole::Server, max_len),
            })
        } else {
            Framing::Stream
        }
    }

    /// Framing for a connection we opened. WebSocket upgrades finish before
    /// the channel exists.
    pub(crate) fn connected(transport: TransportKind, max_len: usize) -> Self {
        if transport.is_websocket() {
            Framing::WebSocket(WsFraming {
                role: WsRole::Client,
                phase: WsPhase::Framed,
                decoder: WsDecoder::new(WsRole::Client, max_len),
            })
        } else {
            Framing::Stream
        }
    }
}

/// What one pass over a channel's read buffer produced.
#[derive(Debug, Default)]
pub(crate) struct Ingest {
    /// Complete SIP messages for the parser.
    pub messages: Vec<Bytes>,
    /// Bytes the reactor must write back (upgrade reply, pong, close).
    pub replies: Vec<Bytes>,
    /// The upgrade reply is among `replies`; call `complete_upgrade` once written.
    pub upgraded: bool,
    /// The peer asked to close.
    pub close: bool,
}

pub(crate) struct ChannelSpec {
    pub key: String,
    pub host: SmolStr,
    pub port: u16,
    pub peer: SocketAddr,
    pub local: Option<SocketAddr>,
    pub transport: TransportKind,
    pub cached: bool,
    pub max_message_size: usize,
}

/// A keyed, bidirectional connection to one peer over one stream transport.
///
/// Writes happen on the caller's task under a per-channel lock, so concurrent
/// sends never interleave. Reads are driven by the owning processor's reactor.
pub struct Channel {
    id: u64,
    key: String,
    host: SmolStr,
    port: u16,
    peer: SocketAddr,
    local: Option<SocketAddr>,
    transport: TransportKind,
    cached: AtomicBool,
    max_message_size: usize,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    framing: Mutex<Framing>,
    last_activity: Mutex<Instant>,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    reactor: UnboundedSender<ReactorCommand>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("peer", &self.peer)
            .field("cached", &self.is_cached())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(
        spec: ChannelSpec,
        writer: BoxedWriter,
        framing: Framing,
        reactor: UnboundedSender<ReactorCommand>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            key: spec.key,
            host: spec.host,
            port: spec.port,
            peer: spec.peer,
            local: spec.local,
            transport: spec.transport,
            cached: AtomicBool::new(spec.cached),
            max_message_size: spec.max_message_size,
            writer: tokio::sync::Mutex::new(Some(writer)),
            framing: Mutex::new(framing),
            last_activity: Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            reactor,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Peer host as requested (or the peer IP for accepted channels).
    pub fn host(&self) -> &str {
        self.host.as_str()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn is_secure(&self) -> bool {
        self.transport.is_secure()
    }

    /// Cached channels live in the processor registry and are reused.
    pub fn is_cached(&self) -> bool {
        self.cached.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True while a send is in progress.
    pub fn is_in_use(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) > 0
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// Current WebSocket phase, or `None` for plain stream channels.
    pub fn ws_phase(&self) -> Option<WsPhase> {
        match &*self.framing.lock() {
            Framing::Stream => None,
            Framing::WebSocket(ws) => Some(ws.phase),
        }
    }

    /// Frames and writes one SIP message.
    pub async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if payload.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                len: payload.len(),
                max: self.max_message_size,
            });
        }
        let _busy = InFlight::enter(&self.in_flight);
        let wire = self.frame_outbound(payload)?;
        self.write_wire(&wire).await?;
        transport_metrics().on_message_sent(self.transport.as_str());
        Ok(())
    }

    /// Closes the socket and tells the reactor to forget the channel.
    pub async fn close(&self) {
        if self.mark_closed() {
            debug!(key = %self.key, "closing channel");
        }
        self.shutdown_writer().await;
        // The reactor may already be gone.
        let _ = self.reactor.send(ReactorCommand::Evict { id: self.id });
    }

    fn frame_outbound(&self, payload: &[u8]) -> Result<Bytes, TransportError> {
        match &*self.framing.lock() {
            Framing::Stream => Ok(Bytes::copy_from_slice(payload)),
            Framing::WebSocket(ws) if ws.phase == WsPhase::Framed => {
                Ok(ws::encode_message(ws.role, payload))
            }
            Framing::WebSocket(_) => Err(TransportError::Handshake(
                "websocket upgrade not complete".into(),
            )),
        }
    }

    /// Writes already-framed bytes under the channel's write lock.
    pub(crate) async fn write_wire(&self, wire: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(TransportError::Closed)?;
        let outcome = match stream.write_all(wire).await {
            Ok(()) => stream.flush().await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                self.touch();
                Ok(())
            }
            Err(e) => {
                transport_metrics().on_error(self.transport.as_str(), "write");
                debug!(key = %self.key, error = %e, "write failed; channel unusable");
                *writer = None;
                self.closed.store(true, Ordering::Release);
                // Stop reading and drop the registry entry too.
                let _ = self.reactor.send(ReactorCommand::Evict { id: self.id });
                Err(e.into())
            }
        }
    }

    /// Turns buffered inbound bytes into messages and replies.
    ///
    /// Consumed bytes are removed from `buf`; a trailing partial message stays.
    pub(crate) fn ingest(&self, buf: &mut BytesMut) -> Result<Ingest, TransportError> {
        let mut out = Ingest::default();
        let mut state = self.framing.lock();
        match &mut *state {
            Framing::Stream => {
                let drained = drain_sip_frames(buf, self.max_message_size)?;
                out.replies
                    .extend((0..drained.pings).map(|_| Bytes::from_static(KEEPALIVE_PONG)));
                out.messages = drained.messages;
            }
            Framing::WebSocket(ws) => match ws.phase {
                WsPhase::Handshaking => {
                    let lead = &buf[..buf.len().min(4)];
                    if !b"GET ".starts_with(lead) {
                        return Err(TransportError::Handshake(
                            "expected an HTTP upgrade request".into(),
                        ));
                    }
                    match ws::head_len(buf) {
                        Some(len) => {
                            let head = buf.split_to(len);
                            let request = ws::parse_upgrade_request(&head)?;
                            debug!(key = %self.key, path = %request.path, "websocket upgrade accepted");
                            out.replies.push(ws::upgrade_response(&request));
                            out.upgraded = true;
                            ws.phase = WsPhase::Upgrading;
                        }
                        None if buf.len() > MAX_HANDSHAKE_LEN => {
                            return Err(TransportError::Handshake("upgrade request too long".into()));
                        }
                        None => {}
                    }
                }
                WsPhase::Upgrading => {}
                WsPhase::Framed => loop {
                    match ws.decoder.decode(buf)? {
                        None => break,
                        Some(WsMessage::Data(message)) => out.messages.push(message),
                        Some(WsMessage::Ping(data)) => {
                            out.replies.push(ws::encode_control(ws.role, Opcode::Pong, &data))
                        }
                        Some(WsMessage::Pong) => {}
                        Some(WsMessage::Close(code)) => {
                            let echo = code.map(|c| c.to_be_bytes().to_vec()).unwrap_or_default();
                            out.replies.push(ws::encode_control(ws.role, Opcode::Close, &echo));
                            out.close = true;
                            break;
                        }
                    }
                },
            },
        }
        Ok(out)
    }

    /// Moves an upgrading WebSocket channel to `Framed` once the reply is out.
    pub(crate) fn complete_upgrade(&self) {
        if let Framing::WebSocket(ws) = &mut *self.framing.lock() {
            if ws.phase == WsPhase::Upgrading {
                ws.phase = WsPhase::Framed;
            }
        }
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Idle channels have had no traffic for `timeout` and no send in progress.
    pub(crate) fn is_idle(&self, timeout: Duration) -> bool {
        !self.is_in_use() && self.last_activity().elapsed() > timeout
    }

    pub(crate) fn set_uncached(&self) {
        self.cached.store(false, Ordering::Release);
    }

    /// Returns true if this call closed the channel.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) async fn shutdown_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }
}

/// Counts a send as in flight for as long as the guard lives.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

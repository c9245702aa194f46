// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-processor event loop.
//!
//! One task per processor accepts connections, reads every registered
//! channel, answers keep-alives and upgrades, hands complete messages to the
//! embedding stack and closes idle channels. Writes never pass through here:
//! callers write on their own tasks, and the replies the reactor generates
//! (pongs, upgrade responses, close frames) go through a bounded per-channel
//! queue drained by a writer task, so a peer that stops reading can only
//! stall its own channel.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use sip_observe::{span_with_channel, span_with_transport, transport_metrics};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_stream::{Stream, StreamExt, StreamMap};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn, Instrument};

use crate::channel::{split_boxed, BoxedReader, Channel};
use crate::processor::Shared;
use crate::{InboundFrame, TransportError};

/// Requests from the processor (and channels) to the reactor.
pub(crate) enum ReactorCommand {
    /// Start reading a channel. `pending` holds bytes already read past a
    /// client-side upgrade. Inbound channels are adopted into the registry
    /// when their key is free.
    Register {
        channel: Arc<Channel>,
        reader: BoxedReader,
        pending: BytesMut,
        inbound: bool,
    },
    /// Stop reading a channel and forget it.
    Evict { id: u64 },
    /// The 101 reply for a server-side upgrade has been written.
    Upgraded { id: u64 },
    Shutdown,
}

/// Reactor replies a channel may have queued before its peer counts as not
/// reading and the channel is dropped.
const REPLY_QUEUE: usize = 64;

type ReadStream = Pin<Box<dyn Stream<Item = io::Result<Option<Bytes>>> + Send>>;

struct Session {
    channel: Arc<Channel>,
    buf: BytesMut,
    replies: mpsc::Sender<Reply>,
}

/// Bytes the reactor wants written on a channel.
struct Reply {
    wire: Bytes,
    /// Contains the 101 upgrade response.
    upgrade: bool,
}

enum Event {
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Command(Option<ReactorCommand>),
    Read(u64, io::Result<Option<Bytes>>),
    Sweep,
}

pub(crate) struct Reactor {
    shared: Arc<Shared>,
    listener: Option<TcpListener>,
    commands: mpsc::UnboundedReceiver<ReactorCommand>,
    inbound: mpsc::Sender<InboundFrame>,
    readers: StreamMap<u64, ReadStream>,
    sessions: HashMap<u64, Session>,
}

impl Reactor {
    pub(crate) fn new(
        shared: Arc<Shared>,
        listener: Option<TcpListener>,
        commands: mpsc::UnboundedReceiver<ReactorCommand>,
        inbound: mpsc::Sender<InboundFrame>,
    ) -> Self {
        Self {
            shared,
            listener,
            commands,
            inbound,
            readers: StreamMap::new(),
            sessions: HashMap::new(),
        }
    }

    pub(crate) async fn run(self) {
        let span = span_with_transport("reactor", self.shared.transport.as_str());
        self.event_loop().instrument(span).await
    }

    async fn event_loop(mut self) {
        let mut sweep = time::interval(self.shared.config.idle_sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                accepted = accept(self.listener.as_ref()) => Event::Accepted(accepted),
                command = self.commands.recv() => Event::Command(command),
                Some((id, read)) = self.readers.next(), if !self.readers.is_empty() => Event::Read(id, read),
                _ = sweep.tick() => Event::Sweep,
            };

            match event {
                Event::Accepted(Ok((stream, peer))) => self.on_accept(stream, peer),
                Event::Accepted(Err(e)) => {
                    error!(%e, "accept error");
                    transport_metrics().on_error(self.shared.transport.as_str(), "accept");
                }
                Event::Command(Some(ReactorCommand::Register {
                    channel,
                    reader,
                    pending,
                    inbound,
                })) => self.register(channel, reader, pending, inbound).await,
                Event::Command(Some(ReactorCommand::Evict { id })) => self.close_session(id, "evicted"),
                Event::Command(Some(ReactorCommand::Upgraded { id })) => self.on_upgraded(id).await,
                Event::Command(Some(ReactorCommand::Shutdown)) | Event::Command(None) => break,
                Event::Read(id, read) => self.on_read(id, read).await,
                Event::Sweep => self.sweep_idle(),
            }
        }

        self.shutdown().await;
    }

    fn on_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let transport = self.shared.transport;
        transport_metrics().on_accept(transport.as_str());
        let _ = stream.set_nodelay(true);
        let local = stream.local_addr().ok();
        debug!(%peer, "accepted connection");

        if transport.is_secure() {
            self.spawn_secure_accept(stream, peer, local);
            return;
        }

        let (reader, writer) = split_boxed(stream);
        let channel = self.shared.accepted_channel(peer, local, writer);
        // Commands are handled in order, so this lands before any eviction.
        let _ = self.shared.commands.send(ReactorCommand::Register {
            channel,
            reader,
            pending: BytesMut::new(),
            inbound: true,
        });
    }

    #[cfg(feature = "tls")]
    fn spawn_secure_accept(&self, stream: TcpStream, peer: SocketAddr, local: Option<SocketAddr>) {
        let shared = self.shared.clone();
        let timeout = shared.config.handshake_timeout();
        tokio::spawn(async move {
            let Some(settings) = shared.tls.as_ref() else {
                return;
            };
            let handshake = time::timeout(timeout, crate::tls::accept(settings, stream)).await;
            let (reader, writer) = match handshake {
                Ok(Ok(halves)) => halves,
                Ok(Err(e)) => {
                    warn!(%peer, %e, "tls handshake error");
                    transport_metrics().on_error(shared.transport.as_str(), "handshake");
                    return;
                }
                Err(_) => {
                    warn!(%peer, "tls handshake timed out");
                    transport_metrics().on_error(shared.transport.as_str(), "handshake");
                    return;
                }
            };
            let channel = shared.accepted_channel(peer, local, writer);
            let _ = shared.commands.send(ReactorCommand::Register {
                channel,
                reader,
                pending: BytesMut::new(),
                inbound: true,
            });
        });
    }

    #[cfg(not(feature = "tls"))]
    fn spawn_secure_accept(&self, _stream: TcpStream, peer: SocketAddr, _local: Option<SocketAddr>) {
        warn!(%peer, "secure transport without tls support; dropping connection");
    }

    async fn register(&mut self, channel: Arc<Channel>, reader: BoxedReader, pending: BytesMut, inbound: bool) {
        if channel.is_closed() {
            channel.shutdown_writer().await;
            return;
        }

        if inbound {
            match self.shared.registry.entry(channel.key().to_owned()) {
                Entry::Occupied(mut slot) if slot.get().is_closed() => {
                    slot.insert(channel.clone());
                }
                Entry::Occupied(_) => {
                    // The key already maps to a live channel; serve this one
                    // without caching it.
                    channel.set_uncached();
                }
                Entry::Vacant(slot) => {
                    slot.insert(channel.clone());
                }
            }
        }

        let id = channel.id();
        let capacity = self.shared.config.read_buffer_size;
        let stream = ReaderStream::with_capacity(reader, capacity)
            .map(|chunk| chunk.map(Some))
            .chain(tokio_stream::once(Ok(None)));
        self.readers.insert(id, Box::pin(stream));

        let (replies, queue) = mpsc::channel(REPLY_QUEUE);
        let span = span_with_channel(self.shared.transport.as_str(), channel.key());
        tokio::spawn(
            write_replies(
                channel.clone(),
                queue,
                self.shared.commands.clone(),
                self.shared.config.handshake_timeout(),
            )
            .instrument(span),
        );

        let has_pending = !pending.is_empty();
        self.sessions.insert(
            id,
            Session {
                channel,
                buf: pending,
                replies,
            },
        );
        if has_pending {
            self.process(id).await;
        }
    }

    async fn on_read(&mut self, id: u64, read: io::Result<Option<Bytes>>) {
        let transport = self.shared.transport.as_str();
        match read {
            Ok(Some(chunk)) => {
                let Some(session) = self.sessions.get_mut(&id) else {
                    return;
                };
                transport_metrics().on_bytes_read(transport, chunk.len());
                session.channel.touch();
                session.buf.extend_from_slice(&chunk);
                self.process(id).await;
            }
            Ok(None) => self.close_session(id, "eof"),
            Err(e) => {
                debug!(%e, "read error");
                transport_metrics().on_error(transport, "read");
                self.close_session(id, "read_error");
            }
        }
    }

    /// Runs the channel's framing over its buffer and acts on the result.
    async fn process(&mut self, id: u64) {
        match self.drain(id).await {
            Ok(true) => {}
            Ok(false) => self.close_session(id, "peer_close"),
            Err(e) => {
                debug!(%e, "closing channel after framing error");
                transport_metrics().on_error(self.shared.transport.as_str(), e.stage());
                self.close_session(id, e.stage());
            }
        }
    }

    /// Returns false once the peer has asked to close.
    ///
    /// After an upgrade request, buffered bytes wait until the writer task
    /// reports the 101 as written (`ReactorCommand::Upgraded`).
    async fn drain(&mut self, id: u64) -> Result<bool, TransportError> {
        let Some(session) = self.sessions.get_mut(&id) else {
            return Ok(true);
        };
        let channel = session.channel.clone();
        let ingest = channel.ingest(&mut session.buf)?;
        if !ingest.replies.is_empty() {
            let wire = match <[Bytes; 1]>::try_from(ingest.replies) {
                Ok([single]) => single,
                Err(replies) => Bytes::from(replies.concat()),
            };
            let reply = Reply {
                wire,
                upgrade: ingest.upgraded,
            };
            session.replies.try_send(reply).map_err(|_| TransportError::Stalled)?;
        }
        for payload in ingest.messages {
            transport_metrics().on_message_received(self.shared.transport.as_str());
            let frame = InboundFrame {
                transport: self.shared.transport,
                peer: channel.peer(),
                key: channel.key().to_owned(),
                payload,
                channel: channel.clone(),
            };
            if self.inbound.send(frame).await.is_err() {
                error!("inbound receiver dropped");
                transport_metrics().on_error(self.shared.transport.as_str(), "dispatch");
                return Err(TransportError::Closed);
            }
        }
        Ok(!ingest.close)
    }

    async fn on_upgraded(&mut self, id: u64) {
        let Some(session) = self.sessions.get(&id) else {
            return;
        };
        session.channel.complete_upgrade();
        if !session.buf.is_empty() {
            self.process(id).await;
        }
    }

    fn sweep_idle(&mut self) {
        let timeout = self.shared.config.idle_timeout();
        let idle: Vec<u64> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.channel.is_idle(timeout))
            .map(|(id, _)| *id)
            .collect();
        for id in idle {
            self.close_session(id, "idle");
        }
    }

    /// Detaching drops the session's reply queue; its writer task flushes what
    /// is queued and then shuts the write side.
    fn close_session(&mut self, id: u64, reason: &'static str) {
        self.detach(id, reason);
    }

    /// Forgets a session: stops reading, drops its registry entry if that
    /// entry is still this channel, and marks it closed.
    fn detach(&mut self, id: u64, reason: &'static str) -> Option<Arc<Channel>> {
        self.readers.remove(&id);
        let session = self.sessions.remove(&id)?;
        let channel = session.channel;
        channel.mark_closed();
        self.shared
            .registry
            .remove_if(channel.key(), |_, current| current.id() == channel.id());
        transport_metrics().on_channel_closed(self.shared.transport.as_str(), reason);
        debug!(key = %channel.key(), reason, "channel closed");
        Some(channel)
    }

    async fn shutdown(&mut self) {
        self.listener = None;
        let ids: Vec<u64> = self.sessions.keys().copied().collect();
        for id in ids {
            self.detach(id, "shutdown");
        }
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let ReactorCommand::Register { channel, .. } = command {
                channel.mark_closed();
                channel.shutdown_writer().await;
            }
        }
        self.shared.registry.clear();
        info!("reactor stopped");
    }
}

/// Writes a channel's reactor replies in order until its session is dropped,
/// then shuts the write side. A write that makes no progress within `stall`
/// evicts the channel.
async fn write_replies(
    channel: Arc<Channel>,
    mut queue: mpsc::Receiver<Reply>,
    reactor: mpsc::UnboundedSender<ReactorCommand>,
    stall: Duration,
) {
    while let Some(reply) = queue.recv().await {
        match time::timeout(stall, channel.write_wire(&reply.wire)).await {
            Ok(Ok(())) if reply.upgrade => {
                let _ = reactor.send(ReactorCommand::Upgraded { id: channel.id() });
            }
            Ok(Ok(())) => {}
            // `write_wire` already closed and evicted the channel.
            Ok(Err(_)) => break,
            Err(_) => {
                warn!("peer is not reading; dropping channel");
                transport_metrics().on_error(channel.transport().as_str(), "stalled");
                channel.mark_closed();
                let _ = reactor.send(ReactorCommand::Evict { id: channel.id() });
                break;
            }
        }
    }
    if time::timeout(stall, channel.shutdown_writer()).await.is_err() {
        debug!("write side shutdown timed out");
    }
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-transport channel registry and factory.
//!
//! A [`ChannelProcessor`] owns every channel of one stream transport. Callers
//! ask it for a channel by peer; concurrent requests for the same peer share
//! one connection, requests for different peers proceed in parallel. Reading
//! is delegated to the processor's reactor task.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use sip_observe::transport_metrics;
use smol_str::SmolStr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::channel::{channel_key, split_boxed, BoxedReader, BoxedWriter, Channel, ChannelSpec, Framing};
use crate::keyed_mutex::KeyedMutex;
use crate::reactor::{Reactor, ReactorCommand};
#[cfg(feature = "tls")]
use crate::tls::TlsSettings;
use crate::ws::{self, MAX_HANDSHAKE_LEN};
use crate::{InboundFrame, TransportError, TransportKind};

/// Tunables for a channel processor.
///
/// Deserializes from a partial JSON object; missing fields take the defaults.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use sip_transport::ProcessorConfig;
///
/// let config = ProcessorConfig::default()
///     .with_bind("0.0.0.0:5060".parse().unwrap())
///     .with_idle_timeout(Duration::from_secs(60));
/// assert_eq!(config.idle_timeout(), Duration::from_secs(60));
/// assert_eq!(config.max_message_size, 64 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Listen address. `None` makes an outbound-only processor.
    pub bind: Option<SocketAddr>,

    /// Largest SIP message accepted or sent, in bytes.
    ///
    /// Default: 65536
    pub max_message_size: usize,

    /// Channels with no traffic and no send in progress for this long are closed.
    ///
    /// Default: 300000 (5 minutes)
    pub idle_timeout_ms: u64,

    /// How often the reactor looks for idle channels.
    ///
    /// Default: 30000
    pub idle_sweep_interval_ms: u64,

    /// Bound on waiting for the per-peer creation lock.
    ///
    /// Default: 10000
    pub lock_timeout_ms: u64,

    /// Bound on establishing the TCP connection.
    ///
    /// Default: 10000
    pub connect_timeout_ms: u64,

    /// Bound on TLS and WebSocket handshakes.
    ///
    /// Default: 10000
    pub handshake_timeout_ms: u64,

    /// Read chunk size per channel.
    ///
    /// Default: 4096
    pub read_buffer_size: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            bind: None,
            max_message_size: 64 * 1024,
            idle_timeout_ms: 300_000,
            idle_sweep_interval_ms: 30_000,
            lock_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            read_buffer_size: 4096,
        }
    }
}

impl ProcessorConfig {
    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = Some(bind);
        self
    }

    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_idle_sweep_interval(mut self, interval: Duration) -> Self {
        self.idle_sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Never zero; tokio intervals reject a zero period.
    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.idle_sweep_interval_ms.max(1))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// State shared by a processor and its reactor.
pub(crate) struct Shared {
    pub(crate) transport: TransportKind,
    pub(crate) config: ProcessorConfig,
    pub(crate) registry: DashMap<String, Arc<Channel>>,
    pub(crate) commands: mpsc::UnboundedSender<ReactorCommand>,
    #[cfg(feature = "tls")]
    pub(crate) tls: Option<TlsSettings>,
}

impl Shared {
    /// Wraps a connection we accepted. The key is the peer's source address.
    pub(crate) fn accepted_channel(
        &self,
        peer: SocketAddr,
        local: Option<SocketAddr>,
        writer: BoxedWriter,
    ) -> Arc<Channel> {
        let host = peer.ip().to_string();
        Channel::new(
            ChannelSpec {
                key: channel_key(&host, peer.port(), self.transport),
                host: SmolStr::new(&host),
                port: peer.port(),
                peer,
                local,
                transport: self.transport,
                cached: true,
                max_message_size: self.config.max_message_size,
            },
            writer,
            Framing::accepted(self.transport, self.config.max_message_size),
            self.commands.clone(),
        )
    }
}

/// Registry and factory of channels for one stream transport.
pub struct ChannelProcessor {
    shared: Arc<Shared>,
    locks: KeyedMutex,
    pending_commands: Mutex<Option<mpsc::UnboundedReceiver<ReactorCommand>>>,
    reactor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    running: AtomicBool,
}

impl fmt::Debug for ChannelProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelProcessor")
            .field("transport", &self.shared.transport)
            .field("channels", &self.shared.registry.len())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl ChannelProcessor {
    /// Creates a processor for a plain stream transport (TCP or WS).
    ///
    /// UDP has no channel processor. Secure transports need
    /// [`ChannelProcessor::with_tls`].
    pub fn new(transport: TransportKind, config: ProcessorConfig) -> Result<Self, TransportError> {
        if !transport.is_stream_based() || transport.is_secure() {
            return Err(TransportError::Unsupported(transport));
        }
        #[cfg(feature = "tls")]
        let processor = Self::build(transport, config, None);
        #[cfg(not(feature = "tls"))]
        let processor = Self::build(transport, config);
        Ok(processor)
    }

    /// Creates a processor for any stream transport with TLS material.
    #[cfg(feature = "tls")]
    pub fn with_tls(
        transport: TransportKind,
        config: ProcessorConfig,
        tls: TlsSettings,
    ) -> Result<Self, TransportError> {
        if !transport.is_stream_based() {
            return Err(TransportError::Unsupported(transport));
        }
        Ok(Self::build(transport, config, Some(tls)))
    }

    fn build(
        transport: TransportKind,
        config: ProcessorConfig,
        #[cfg(feature = "tls")] tls: Option<TlsSettings>,
    ) -> Self {
        let (commands, pending) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                registry: DashMap::new(),
                commands,
                #[cfg(feature = "tls")]
                tls,
            }),
            locks: KeyedMutex::new(),
            pending_commands: Mutex::new(Some(pending)),
            reactor: tokio::sync::Mutex::new(None),
            local_addr: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Binds the listener (if configured) and spawns the reactor.
    ///
    /// Returns the bound address. Calling `start` on a running processor
    /// returns the existing address; a stopped processor cannot be restarted.
    pub async fn start(
        &self,
        inbound: mpsc::Sender<InboundFrame>,
    ) -> Result<Option<SocketAddr>, TransportError> {
        if self.running.load(Ordering::Acquire) {
            return Ok(self.local_addr());
        }

        let listener = match self.shared.config.bind {
            Some(bind) => Some(TcpListener::bind(bind).await?),
            None => None,
        };
        let local = listener.as_ref().map(TcpListener::local_addr).transpose()?;
        let commands = self
            .pending_commands
            .lock()
            .take()
            .ok_or(TransportError::Closed)?;

        *self.local_addr.lock() = local;
        let transport = self.shared.transport;
        match local {
            Some(addr) => info!(transport = transport.as_str(), %addr, "listening"),
            None => info!(transport = transport.as_str(), "outbound-only processor started"),
        }

        let reactor = Reactor::new(self.shared.clone(), listener, commands, inbound);
        *self.reactor.lock().await = Some(tokio::spawn(reactor.run()));
        self.running.store(true, Ordering::Release);
        Ok(local)
    }

    /// Stops the reactor, closes every channel and empties the registry.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let _ = self.shared.commands.send(ReactorCommand::Shutdown);
        let handle = self.reactor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(%e, "reactor task ended abnormally");
            }
        }
        self.shared.registry.clear();
        info!(transport = self.shared.transport.as_str(), "channel processor stopped");
    }

    /// Returns the cached channel to `host:port`, connecting if needed.
    ///
    /// Concurrent calls for the same peer open at most one connection and all
    /// receive the same channel.
    pub async fn create_channel(&self, host: &str, port: u16) -> Result<Arc<Channel>, TransportError> {
        self.obtain(host, port, None).await
    }

    /// Like [`ChannelProcessor::create_channel`] for an already resolved address.
    pub async fn create_channel_addr(&self, addr: SocketAddr) -> Result<Arc<Channel>, TransportError> {
        self.obtain(&addr.ip().to_string(), addr.port(), Some(addr)).await
    }

    async fn obtain(
        &self,
        host: &str,
        port: u16,
        addr: Option<SocketAddr>,
    ) -> Result<Arc<Channel>, TransportError> {
        self.ensure_running()?;
        let key = channel_key(host, port, self.shared.transport);
        if let Some(channel) = self.channel(&key) {
            return Ok(channel);
        }

        // Released on drop, so a cancelled caller frees the key too.
        let _guard = self.locks.lock(&key, self.shared.config.lock_timeout()).await?;
        self.obtain_locked(&key, host, port, addr).await
    }

    async fn obtain_locked(
        &self,
        key: &str,
        host: &str,
        port: u16,
        addr: Option<SocketAddr>,
    ) -> Result<Arc<Channel>, TransportError> {
        if let Some(channel) = self.channel(key) {
            debug!(key, "channel opened by a concurrent caller");
            return Ok(channel);
        }
        let (channel, reader, pending) = self.connect(key, host, port, addr, true).await?;
        self.shared.registry.insert(key.to_owned(), channel.clone());
        self.register(&channel, reader, pending)?;
        // `stop` may have cleared the registry while we were connecting.
        if !self.is_running() {
            self.discard(&channel).await;
            return Err(TransportError::NotStarted);
        }
        debug!(key, peer = %channel.peer(), "channel created");
        Ok(channel)
    }

    /// Opens a channel that is never cached; close it after use.
    pub async fn open_ephemeral(&self, host: &str, port: u16) -> Result<Arc<Channel>, TransportError> {
        self.ensure_running()?;
        let key = channel_key(host, port, self.shared.transport);
        let (channel, reader, pending) = self.connect(&key, host, port, None, false).await?;
        self.register(&channel, reader, pending)?;
        if !self.is_running() {
            self.discard(&channel).await;
            return Err(TransportError::NotStarted);
        }
        debug!(key = %key, "ephemeral channel opened");
        Ok(channel)
    }

    /// Sends one message on a fresh uncached channel, then closes it.
    pub async fn send_once(&self, host: &str, port: u16, payload: &[u8]) -> Result<(), TransportError> {
        let channel = self.open_ephemeral(host, port).await?;
        let result = channel.send(payload).await;
        channel.close().await;
        result
    }

    /// Closes and forgets the channel for `key`, then drops the key's lock.
    ///
    /// Returns whether a channel was registered under the key.
    pub async fn remove_channel(&self, key: &str) -> Result<bool, TransportError> {
        let guard = self.locks.lock(key, self.shared.config.lock_timeout()).await?;
        let removed = self.shared.registry.remove(key).map(|(_, channel)| channel);
        if let Some(channel) = &removed {
            channel.close().await;
            debug!(key, "channel removed");
        }
        self.locks.remove_key(key);
        drop(guard);
        Ok(removed.is_some())
    }

    /// Live cached channel for `key`, if any.
    pub fn channel(&self, key: &str) -> Option<Arc<Channel>> {
        self.shared
            .registry
            .get(key)
            .map(|entry| entry.value().clone())
            .filter(|channel| !channel.is_closed())
    }

    /// Number of cached channels.
    pub fn len(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.registry.is_empty()
    }

    /// True while any cached channel has a send in progress.
    pub fn is_in_use(&self) -> bool {
        self.shared
            .registry
            .iter()
            .any(|entry| entry.value().is_in_use())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn transport(&self) -> TransportKind {
        self.shared.transport
    }

    pub fn default_port(&self) -> u16 {
        self.shared.transport.default_port()
    }

    pub fn max_message_size(&self) -> usize {
        self.shared.config.max_message_size
    }

    pub fn is_secure(&self) -> bool {
        self.shared.transport.is_secure()
    }

    /// Bound listener address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.shared.config
    }

    fn ensure_running(&self) -> Result<(), TransportError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(TransportError::NotStarted)
        }
    }

    fn register(
        &self,
        channel: &Arc<Channel>,
        reader: BoxedReader,
        pending: BytesMut,
    ) -> Result<(), TransportError> {
        let command = ReactorCommand::Register {
            channel: channel.clone(),
            reader,
            pending,
            inbound: false,
        };
        if self.shared.commands.send(command).is_err() {
            channel.mark_closed();
            self.shared
                .registry
                .remove_if(channel.key(), |_, current| current.id() == channel.id());
            return Err(TransportError::NotStarted);
        }
        Ok(())
    }

    /// Undoes a creation that lost the race with `stop`.
    async fn discard(&self, channel: &Arc<Channel>) {
        self.shared
            .registry
            .remove_if(channel.key(), |_, current| current.id() == channel.id());
        channel.close().await;
        debug!(key = %channel.key(), "channel discarded; processor stopped");
    }

    /// Connects, runs TLS and WebSocket handshakes, and builds the channel.
    async fn connect(
        &self,
        key: &str,
        host: &str,
        port: u16,
        addr: Option<SocketAddr>,
        cached: bool,
    ) -> Result<(Arc<Channel>, BoxedReader, BytesMut), TransportError> {
        let transport = self.shared.transport;
        let config = &self.shared.config;
        let peer = match addr {
            Some(addr) => addr,
            None => resolve(host, port).await?,
        };

        let stream = match time::timeout(config.connect_timeout(), TcpStream::connect(peer)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                transport_metrics().on_error(transport.as_str(), "connect");
                return Err(e.into());
            }
            Err(_) => {
                transport_metrics().on_error(transport.as_str(), "connect");
                return Err(TransportError::ConnectTimeout {
                    key: key.to_owned(),
                    after: config.connect_timeout(),
                });
            }
        };
        let _ = stream.set_nodelay(true);
        let local = stream.local_addr().ok();
        transport_metrics().on_connect(transport.as_str());

        let (mut reader, mut writer) = self.secure_split(host, stream).await?;
        let pending = if transport.is_websocket() {
            let authority = host_authority(host, port);
            match time::timeout(
                config.handshake_timeout(),
                client_upgrade(&mut reader, &mut writer, &authority),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => return Err(TransportError::Handshake("upgrade timed out".into())),
            }
        } else {
            BytesMut::new()
        };

        let channel = Channel::new(
            ChannelSpec {
                key: key.to_owned(),
                host: SmolStr::new(host),
                port,
                peer,
                local,
                transport,
                cached,
                max_message_size: config.max_message_size,
            },
            writer,
            Framing::connected(transport, config.max_message_size),
            self.shared.commands.clone(),
        );
        Ok((channel, reader, pending))
    }

    #[cfg(feature = "tls")]
    async fn secure_split(
        &self,
        host: &str,
        stream: TcpStream,
    ) -> Result<(BoxedReader, BoxedWriter), TransportError> {
        let settings = match (&self.shared.tls, self.shared.transport.is_secure()) {
            (Some(settings), true) => settings,
            _ => return Ok(split_boxed(stream)),
        };
        let timeout = self.shared.config.handshake_timeout();
        match time::timeout(timeout, crate::tls::connect(settings, host, stream)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Handshake("tls handshake timed out".into())),
        }
    }

    #[cfg(not(feature = "tls"))]
    async fn secure_split(
        &self,
        _host: &str,
        stream: TcpStream,
    ) -> Result<(BoxedReader, BoxedWriter), TransportError> {
        Ok(split_boxed(stream))
    }
}

impl Drop for ChannelProcessor {
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            let _ = self.shared.commands.send(ReactorCommand::Shutdown);
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    lookup_host((bare, port))
        .await
        .map_err(|_| TransportError::Resolve(host.to_owned()))?
        .next()
        .ok_or_else(|| TransportError::Resolve(host.to_owned()))
}

/// `Host:` header value; IPv6 literals need brackets.
fn host_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Client side of the WebSocket upgrade. Returns bytes read past the 101.
async fn client_upgrade(
    reader: &mut BoxedReader,
    writer: &mut BoxedWriter,
    authority: &str,
) -> Result<BytesMut, TransportError> {
    let (request, key) = ws::upgrade_request(authority, "/");
    writer.write_all(&request).await?;
    writer.flush().await?;

    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(len) = ws::head_len(&buf) {
            let head = buf.split_to(len);
            ws::verify_upgrade_response(&head, &key)?;
            return Ok(buf);
        }
        if buf.len() > MAX_HANDSHAKE_LEN {
            return Err(TransportError::Handshake("upgrade response too long".into()));
        }
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(TransportError::Handshake("connection closed during upgrade".into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const SHORT: Duration = Duration::from_millis(100);

    /// Listener that counts accepts and keeps every connection open.
    async fn counting_listener() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = accepts.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });
        (addr, accepts)
    }

    async fn started(config: ProcessorConfig) -> (Arc<ChannelProcessor>, mpsc::Receiver<InboundFrame>) {
        let processor = Arc::new(ChannelProcessor::new(TransportKind::Tcp, config).unwrap());
        let (tx, rx) = mpsc::channel(16);
        processor.start(tx).await.unwrap();
        (processor, rx)
    }

    #[test]
    fn rejects_udp() {
        let err = ChannelProcessor::new(TransportKind::Udp, ProcessorConfig::default()).unwrap_err();
        assert!(matches!(err, TransportError::Unsupported(TransportKind::Udp)));
    }

    #[test]
    fn config_fills_missing_fields_from_defaults() {
        let config: ProcessorConfig =
            serde_json::from_str(r#"{"bind":"127.0.0.1:5070","idle_timeout_ms":1000}"#).unwrap();
        assert_eq!(config.bind, Some("127.0.0.1:5070".parse().unwrap()));
        assert_eq!(config.idle_timeout(), Duration::from_secs(1));
        assert_eq!(config.lock_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_message_size, 64 * 1024);
    }

    #[test]
    fn host_authority_brackets_ipv6() {
        assert_eq!(host_authority("::1", 5060), "[::1]:5060");
        assert_eq!(host_authority("[::1]", 5060), "[::1]:5060");
        assert_eq!(host_authority("proxy.example.com", 80), "proxy.example.com:80");
        assert_eq!(host_authority("10.0.0.1", 8080), "10.0.0.1:8080");
    }

    #[test]
    fn zero_sweep_interval_is_clamped() {
        let config = ProcessorConfig::default().with_idle_sweep_interval(Duration::ZERO);
        assert!(config.idle_sweep_interval() > Duration::ZERO);
    }

    #[tokio::test]
    async fn metadata_reflects_transport() {
        let processor = ChannelProcessor::new(TransportKind::Ws, ProcessorConfig::default()).unwrap();
        assert_eq!(processor.transport(), TransportKind::Ws);
        assert_eq!(processor.default_port(), 80);
        assert!(!processor.is_secure());
        assert_eq!(processor.max_message_size(), 64 * 1024);
        assert!(processor.local_addr().is_none());
        assert!(processor.is_empty());
    }

    #[tokio::test]
    async fn create_before_start_fails() {
        let processor = ChannelProcessor::new(TransportKind::Tcp, ProcessorConfig::default()).unwrap();
        let err = processor.create_channel("127.0.0.1", 5060).await.unwrap_err();
        assert!(matches!(err, TransportError::NotStarted));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_share_one_connection() {
        let (addr, accepts) = counting_listener().await;
        let (processor, _rx) = started(ProcessorConfig::default()).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let processor = processor.clone();
            handles.push(tokio::spawn(async move {
                processor.create_channel("127.0.0.1", addr.port()).await.unwrap()
            }));
        }
        let mut channels = Vec::new();
        for handle in handles {
            channels.push(handle.await.unwrap());
        }

        for channel in &channels[1..] {
            assert!(Arc::ptr_eq(&channels[0], channel));
        }
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
        assert_eq!(processor.len(), 1);
        assert!(channels[0].is_cached());
    }

    #[tokio::test]
    async fn held_key_does_not_block_other_peers() {
        let (a, _) = counting_listener().await;
        let (b, _) = counting_listener().await;
        let (processor, _rx) = started(ProcessorConfig::default().with_lock_timeout(SHORT)).await;

        let key_a = channel_key("127.0.0.1", a.port(), TransportKind::Tcp);
        processor.locks.acquire(&key_a, SHORT).await.unwrap();

        processor.create_channel("127.0.0.1", b.port()).await.unwrap();
        let err = processor.create_channel("127.0.0.1", a.port()).await.unwrap_err();
        assert!(matches!(err, TransportError::AcquisitionTimeout(_)));

        processor.locks.release(&key_a);
        processor.create_channel("127.0.0.1", a.port()).await.unwrap();
        assert_eq!(processor.len(), 2);
    }

    #[tokio::test]
    async fn raw_address_and_host_share_a_key() {
        let (addr, accepts) = counting_listener().await;
        let (processor, _rx) = started(ProcessorConfig::default()).await;
        let by_addr = processor.create_channel_addr(addr).await.unwrap();
        let by_host = processor.create_channel("127.0.0.1", addr.port()).await.unwrap();
        assert!(Arc::ptr_eq(&by_addr, &by_host));
        assert_eq!(by_addr.key(), format!("127.0.0.1:{}/TCP", addr.port()));
        time::sleep(Duration::from_millis(20)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idle_channels_are_swept() {
        let (addr, _) = counting_listener().await;
        let config = ProcessorConfig::default()
            .with_idle_timeout(Duration::from_millis(50))
            .with_idle_sweep_interval(Duration::from_millis(20));
        let (processor, _rx) = started(config).await;

        let channel = processor.create_channel("127.0.0.1", addr.port()).await.unwrap();
        time::sleep(Duration::from_millis(300)).await;
        assert!(channel.is_closed());
        assert!(processor.is_empty());
    }

    #[tokio::test]
    async fn peer_close_evicts_and_next_create_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // First connection is dropped at once, the second is kept.
            let (first, _) = listener.accept().await.unwrap();
            drop(first);
            let (_second, _) = listener.accept().await.unwrap();
            time::sleep(Duration::from_secs(5)).await;
        });
        let (processor, _rx) = started(ProcessorConfig::default()).await;

        let first = processor.create_channel("127.0.0.1", addr.port()).await.unwrap();
        time::sleep(Duration::from_millis(100)).await;
        assert!(first.is_closed());
        assert!(processor.channel(first.key()).is_none());

        let second = processor.create_channel("127.0.0.1", addr.port()).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn remove_channel_closes_and_forgets_lock() {
        let (addr, _) = counting_listener().await;
        let (processor, _rx) = started(ProcessorConfig::default()).await;
        let channel = processor.create_channel("127.0.0.1", addr.port()).await.unwrap();

        assert!(processor.remove_channel(channel.key()).await.unwrap());
        assert!(channel.is_closed());
        assert!(processor.is_empty());
        assert!(processor.locks.is_empty());
        assert!(!processor.remove_channel(channel.key()).await.unwrap());
    }

    #[tokio::test]
    async fn send_once_is_not_cached() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let reader = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            received
        });
        let (processor, _rx) = started(ProcessorConfig::default()).await;

        processor
            .send_once("127.0.0.1", addr.port(), b"OPTIONS sip:a SIP/2.0\r\n\r\n")
            .await
            .unwrap();
        assert!(processor.is_empty());
        assert_eq!(reader.await.unwrap(), b"OPTIONS sip:a SIP/2.0\r\n\r\n");
    }

    #[tokio::test]
    async fn connect_refused_is_reported() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let (processor, _rx) = started(ProcessorConfig::default()).await;
        let err = processor.create_channel_addr(addr).await.unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
        assert!(processor.is_empty());
        // The key lock was released on failure.
        assert!(!processor.locks.is_locked(&channel_key("127.0.0.1", addr.port(), TransportKind::Tcp)));
    }

    #[tokio::test]
    async fn stop_closes_channels_and_refuses_new_work() {
        let (addr, _) = counting_listener().await;
        let (processor, _rx) = started(ProcessorConfig::default()).await;
        let channel = processor.create_channel("127.0.0.1", addr.port()).await.unwrap();

        processor.stop().await;
        assert!(channel.is_closed());
        assert!(processor.is_empty());
        assert!(!processor.is_running());
        assert!(matches!(
            processor.create_channel("127.0.0.1", addr.port()).await,
            Err(TransportError::NotStarted)
        ));
    }
}

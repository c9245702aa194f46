// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! sipedge - a stateless SIP edge on stream transports.
//!
//! Accepts SIP over TCP, WebSocket and (with the `tls` feature) TLS, admits
//! each request through the congestion valve, and answers OPTIONS with 200.
//! Anything else gets 501 since there is no core behind the edge yet.

mod config;
mod request;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sip_congestion::{AdmissionValve, TransactionTable};
use sip_observe::{set_transport_metrics, TracingTransportMetrics};
use sip_transport::{ChannelProcessor, InboundFrame, TransportKind, Transports};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{EdgeConfig, Overrides};
use crate::request::{build_response, RequestHead, StatelessResponses};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stateless SIP edge on stream transports")]
struct Args {
    /// JSON config file; command-line flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// TCP listen address
    #[arg(long)]
    tcp_bind: Option<std::net::SocketAddr>,

    /// WebSocket listen address
    #[arg(long)]
    ws_bind: Option<std::net::SocketAddr>,

    /// TLS listen address (requires --tls-cert and --tls-key)
    #[arg(long)]
    tls_bind: Option<std::net::SocketAddr>,

    #[arg(long)]
    tls_cert: Option<String>,

    #[arg(long)]
    tls_key: Option<String>,

    /// Transactions in progress before new requests are shed
    #[arg(long)]
    high_water_mark: Option<usize>,

    /// Status sent when shedding; 0 drops silently
    #[arg(long)]
    drop_status: Option<u16>,

    /// Idle channel timeout in seconds
    #[arg(long)]
    idle_timeout_secs: Option<u64>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            tcp_bind: self.tcp_bind,
            ws_bind: self.ws_bind,
            tls_bind: self.tls_bind,
            tls_cert: self.tls_cert.clone(),
            tls_key: self.tls_key.clone(),
            high_water_mark: self.high_water_mark,
            drop_status: self.drop_status,
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Requests currently being handled; the valve's notion of table size.
#[derive(Debug, Default)]
struct InProgress(AtomicUsize);

impl TransactionTable for InProgress {
    fn current_size(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

struct InProgressGuard(Arc<InProgress>);

impl InProgressGuard {
    fn enter(table: &Arc<InProgress>) -> Self {
        table.0.fetch_add(1, Ordering::Relaxed);
        Self(table.clone())
    }
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        self.0 .0.fetch_sub(1, Ordering::Relaxed);
    }
}

struct Edge {
    valve: AdmissionValve<RequestHead>,
    in_progress: Arc<InProgress>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();
    set_transport_metrics(Arc::new(TracingTransportMetrics::default()));

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => EdgeConfig::load(path).await?,
        None => EdgeConfig::default(),
    };
    config.apply(&args.overrides());

    let in_progress = Arc::new(InProgress::default());
    let edge = Arc::new(Edge {
        valve: AdmissionValve::new(
            config.congestion.clone(),
            in_progress.clone(),
            Arc::new(StatelessResponses),
        ),
        in_progress,
    });

    let (tx, mut rx) = mpsc::channel::<InboundFrame>(1024);
    let mut transports = Transports::new();

    if let Some(tcp) = config.tcp.clone() {
        let processor = ChannelProcessor::new(TransportKind::Tcp, tcp).context("tcp processor")?;
        let addr = processor.start(tx.clone()).await.context("starting tcp")?;
        info!(?addr, "listening on tcp");
        transports.insert(Arc::new(processor));
    }
    if let Some(ws) = config.ws.clone() {
        let processor = ChannelProcessor::new(TransportKind::Ws, ws).context("ws processor")?;
        let addr = processor.start(tx.clone()).await.context("starting ws")?;
        info!(?addr, "listening on ws");
        transports.insert(Arc::new(processor));
    }
    if let Some(tls) = config.tls.clone() {
        start_tls(&config, tls, &tx, &mut transports).await?;
    }
    drop(tx);

    info!(
        high_water_mark = config.congestion.high_water_mark,
        drop_status = config.congestion.drop_response_status,
        "sipedge ready"
    );

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let edge = edge.clone();
                tokio::spawn(handle_frame(edge, frame));
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    transports.stop_all().await;
    Ok(())
}

#[cfg(feature = "tls")]
async fn start_tls(
    config: &EdgeConfig,
    tls: sip_transport::ProcessorConfig,
    tx: &mpsc::Sender<InboundFrame>,
    transports: &mut Transports,
) -> Result<()> {
    use sip_transport::{load_rustls_server_config, TlsSettings};

    let (Some(cert), Some(key)) = (config.tls_cert.as_deref(), config.tls_key.as_deref()) else {
        anyhow::bail!("tls listener needs tls_cert and tls_key");
    };
    let server = load_rustls_server_config(cert, key).context("loading tls certificate")?;
    let processor = ChannelProcessor::with_tls(
        TransportKind::Tls,
        tls,
        TlsSettings::default().with_server(server),
    )
    .context("tls processor")?;
    let addr = processor.start(tx.clone()).await.context("starting tls")?;
    info!(?addr, "listening on tls");
    transports.insert(Arc::new(processor));
    Ok(())
}

#[cfg(not(feature = "tls"))]
async fn start_tls(
    _config: &EdgeConfig,
    _tls: sip_transport::ProcessorConfig,
    _tx: &mpsc::Sender<InboundFrame>,
    _transports: &mut Transports,
) -> Result<()> {
    anyhow::bail!("tls listener configured but sipedge was built without the tls feature")
}

async fn handle_frame(edge: Arc<Edge>, frame: InboundFrame) {
    let Some(head) = RequestHead::peek(&frame.payload) else {
        // Responses have no transaction to match at a stateless edge.
        debug!(peer = %frame.peer, "ignoring non-request message");
        return;
    };

    if !edge.valve.admit(&head, frame.channel.as_ref()).await {
        return;
    }
    if head.method == "ACK" {
        return;
    }

    let _guard = InProgressGuard::enter(&edge.in_progress);
    debug!(method = %head.method, uri = %head.uri, peer = %frame.peer, "handling request");
    let status = if head.method == "OPTIONS" { 200 } else { 501 };
    let response = build_response(&head, status);
    if let Err(e) = frame.channel.send(&response).await {
        warn!(peer = %frame.peer, key = %frame.key, %e, "failed to send response");
    }
}

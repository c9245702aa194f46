// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Observability hooks for the stream transport core.
//!
//! Channel processors, their reactors and the admission valve report through a
//! single process-wide [`TransportMetrics`] sink. Nothing is recorded until a
//! sink is installed; the default is a no-op.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use sip_observe::{set_transport_metrics, TracingTransportMetrics};
//! set_transport_metrics(Arc::new(TracingTransportMetrics));
//! // Channel and admission events are now emitted as tracing events
//! ```

use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::Level;

/// Metrics sink used by transports to emit observability events.
///
/// `transport`, `stage`, `reason` and `method` are low-cardinality identifiers
/// (e.g. "ws", "handshake", "idle", "INVITE"). Peer addresses and payloads are
/// never passed in.
pub trait TransportMetrics: Send + Sync + 'static {
    fn on_bytes_read(&self, transport: &str, len: usize);
    fn on_message_received(&self, transport: &str);
    fn on_message_sent(&self, transport: &str);
    fn on_error(&self, transport: &str, stage: &str);
    fn on_accept(&self, transport: &str);
    fn on_connect(&self, transport: &str);
    fn on_channel_closed(&self, transport: &str, reason: &str);
    fn on_admission_rejected(&self, method: &str, status: u16);
}

#[derive(Debug, Default)]
struct NoopTransportMetrics;

impl TransportMetrics for NoopTransportMetrics {
    fn on_bytes_read(&self, _transport: &str, _len: usize) {}
    fn on_message_received(&self, _transport: &str) {}
    fn on_message_sent(&self, _transport: &str) {}
    fn on_error(&self, _transport: &str, _stage: &str) {}
    fn on_accept(&self, _transport: &str) {}
    fn on_connect(&self, _transport: &str) {}
    fn on_channel_closed(&self, _transport: &str, _reason: &str) {}
    fn on_admission_rejected(&self, _method: &str, _status: u16) {}
}

static TRANSPORT_METRICS: OnceCell<Arc<dyn TransportMetrics>> = OnceCell::new();
static NOOP_TRANSPORT_METRICS: NoopTransportMetrics = NoopTransportMetrics;

/// Installs the global transport metrics implementation.
///
/// Returns `true` if the metrics sink was installed, or `false` if it was
/// already configured.
pub fn set_transport_metrics(metrics: Arc<dyn TransportMetrics>) -> bool {
    TRANSPORT_METRICS.set(metrics).is_ok()
}

/// Returns the currently configured transport metrics sink.
pub fn transport_metrics() -> &'static dyn TransportMetrics {
    TRANSPORT_METRICS
        .get()
        .map(|arc| arc.as_ref())
        .unwrap_or(&NOOP_TRANSPORT_METRICS)
}

/// Creates a tracing span for work done on behalf of one transport.
pub fn span_with_transport(name: &'static str, transport: &str) -> tracing::Span {
    tracing::span!(Level::INFO, "transport", op = name, transport = transport)
}

/// Creates a tracing span scoped to a single channel.
pub fn span_with_channel(transport: &str, key: &str) -> tracing::Span {
    tracing::span!(Level::DEBUG, "channel", transport = transport, key = key)
}

/// Metrics implementation that logs via `tracing`.
#[derive(Debug, Default)]
pub struct TracingTransportMetrics;

impl TransportMetrics for TracingTransportMetrics {
    fn on_bytes_read(&self, transport: &str, len: usize) {
        tracing::trace!(transport, len, "bytes read");
    }

    fn on_message_received(&self, transport: &str) {
        tracing::debug!(transport, "message received");
    }

    fn on_message_sent(&self, transport: &str) {
        tracing::debug!(transport, "message sent");
    }

    fn on_error(&self, transport: &str, stage: &str) {
        tracing::warn!(transport, stage, "transport error");
    }

    fn on_accept(&self, transport: &str) {
        tracing::debug!(transport, "accept");
    }

    fn on_connect(&self, transport: &str) {
        tracing::debug!(transport, "connect");
    }

    fn on_channel_closed(&self, transport: &str, reason: &str) {
        tracing::debug!(transport, reason, "channel closed");
    }

    fn on_admission_rejected(&self, method: &str, status: u16) {
        tracing::info!(method, status, "request shed by admission valve");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_sink_is_used_until_installed() {
        // Must not panic with nothing installed.
        transport_metrics().on_error("tcp", "read");
        transport_metrics().on_channel_closed("ws", "idle");
    }

    #[test]
    fn spans_carry_transport_fields() {
        let span = span_with_transport("reactor", "tcp");
        let _entered = span.enter();
        let channel = span_with_channel("tcp", "10.0.0.1:5060/TCP");
        let _inner = channel.enter();
    }
}

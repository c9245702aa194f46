// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Hop-based outbound sends across processors.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::hop::HopAddress;
use crate::processor::ChannelProcessor;
use crate::{Channel, TransportError, TransportKind};

/// The set of running channel processors, one per transport.
#[derive(Debug, Default)]
pub struct Transports {
    processors: HashMap<TransportKind, Arc<ChannelProcessor>>,
}

impl Transports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a processor, replacing any previous one for its transport.
    pub fn with(mut self, processor: Arc<ChannelProcessor>) -> Self {
        self.insert(processor);
        self
    }

    pub fn insert(&mut self, processor: Arc<ChannelProcessor>) {
        self.processors.insert(processor.transport(), processor);
    }

    pub fn get(&self, transport: TransportKind) -> Option<&Arc<ChannelProcessor>> {
        self.processors.get(&transport)
    }

    /// Cached channel for the hop, opened on demand.
    pub async fn channel_for(&self, hop: &HopAddress) -> Result<Arc<Channel>, TransportError> {
        let processor = self
            .get(hop.transport())
            .ok_or(TransportError::Unsupported(hop.transport()))?;
        processor.create_channel(hop.host(), hop.port()).await
    }

    /// Writes one message to the hop and returns the channel used.
    pub async fn send(&self, hop: &HopAddress, payload: &[u8]) -> Result<Arc<Channel>, TransportError> {
        let channel = self.channel_for(hop).await?;
        channel.send(payload).await?;
        debug!(%hop, len = payload.len(), "sent to hop");
        Ok(channel)
    }

    /// True while any processor has a send in progress.
    pub fn is_in_use(&self) -> bool {
        self.processors.values().any(|p| p.is_in_use())
    }

    pub async fn stop_all(&self) {
        for processor in self.processors.values() {
            processor.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProcessorConfig;

    #[tokio::test]
    async fn unknown_transport_is_unsupported() {
        let transports = Transports::new();
        let hop = HopAddress::parse("example.com:5060/UDP").unwrap();
        let err = transports.send(&hop, b"x").await.unwrap_err();
        assert!(matches!(err, TransportError::Unsupported(TransportKind::Udp)));
    }

    #[tokio::test]
    async fn processors_are_keyed_by_transport() {
        let tcp = Arc::new(ChannelProcessor::new(TransportKind::Tcp, ProcessorConfig::default()).unwrap());
        let ws = Arc::new(ChannelProcessor::new(TransportKind::Ws, ProcessorConfig::default()).unwrap());
        let transports = Transports::new().with(tcp.clone()).with(ws);
        assert!(Arc::ptr_eq(transports.get(TransportKind::Tcp).unwrap(), &tcp));
        assert!(transports.get(TransportKind::Tls).is_none());
        assert!(!transports.is_in_use());
    }
}

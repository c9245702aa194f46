// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! ACK delivery override point.
//!
//! ACKs for 2xx responses are sent outside any client transaction, so the
//! stack asks a strategy to deliver them. Tests and proxies install their own
//! strategy to observe or redirect ACKs; [`ChannelAckDispatch`] is the default.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::warn;

use crate::dispatch::Transports;
use crate::hop::HopAddress;
use crate::TransportError;

/// A serialized ACK and the hop chosen for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundAck {
    pub hop: HopAddress,
    pub payload: Bytes,
}

/// Why an ACK could not be handed to the network.
#[derive(Debug)]
pub enum SendError {
    /// No processor serves the hop's transport.
    NoRoute(HopAddress),
    /// The channel could not be opened or written.
    Transport {
        hop: HopAddress,
        source: TransportError,
    },
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRoute(hop) => write!(f, "no transport for hop {}", hop),
            Self::Transport { hop, source } => write!(f, "sending ACK to {} failed: {}", hop, source),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport { source, .. } => Some(source),
            Self::NoRoute(_) => None,
        }
    }
}

/// Sends ACKs and remembers the last hop it tried.
#[async_trait]
pub trait AckDispatchStrategy: Send + Sync {
    async fn send(&self, ack: &OutboundAck) -> Result<(), SendError>;

    /// Hop of the most recent `send`, successful or not.
    fn last_hop_attempted(&self) -> Option<HopAddress>;
}

/// Default strategy: the ACK goes out on the hop's cached channel.
pub struct ChannelAckDispatch {
    transports: Arc<Transports>,
    last_hop: Mutex<Option<HopAddress>>,
}

impl ChannelAckDispatch {
    pub fn new(transports: Arc<Transports>) -> Self {
        Self {
            transports,
            last_hop: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AckDispatchStrategy for ChannelAckDispatch {
    async fn send(&self, ack: &OutboundAck) -> Result<(), SendError> {
        *self.last_hop.lock() = Some(ack.hop.clone());
        if self.transports.get(ack.hop.transport()).is_none() {
            return Err(SendError::NoRoute(ack.hop.clone()));
        }
        self.transports
            .send(&ack.hop, &ack.payload)
            .await
            .map(|_| ())
            .map_err(|source| {
                warn!(hop = %ack.hop, %source, "ACK send failed");
                SendError::Transport {
                    hop: ack.hop.clone(),
                    source,
                }
            })
    }

    fn last_hop_attempted(&self) -> Option<HopAddress> {
        self.last_hop.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChannelProcessor, ProcessorConfig, TransportKind};

    /// Strategy that records instead of sending.
    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<OutboundAck>>,
    }

    #[async_trait]
    impl AckDispatchStrategy for Recording {
        async fn send(&self, ack: &OutboundAck) -> Result<(), SendError> {
            self.sent.lock().push(ack.clone());
            Ok(())
        }

        fn last_hop_attempted(&self) -> Option<HopAddress> {
            self.sent.lock().last().map(|ack| ack.hop.clone())
        }
    }

    fn ack(hop: &str) -> OutboundAck {
        OutboundAck {
            hop: HopAddress::parse(hop).unwrap(),
            payload: Bytes::from_static(b"ACK sip:a SIP/2.0\r\n\r\n"),
        }
    }

    #[tokio::test]
    async fn custom_strategy_is_usable_as_trait_object() {
        let strategy: Arc<dyn AckDispatchStrategy> = Arc::new(Recording::default());
        assert!(strategy.last_hop_attempted().is_none());
        strategy.send(&ack("10.0.0.1:5060/TCP")).await.unwrap();
        assert_eq!(
            strategy.last_hop_attempted().unwrap().to_string(),
            "10.0.0.1:5060/TCP"
        );
    }

    #[tokio::test]
    async fn missing_transport_is_no_route_and_still_recorded() {
        let dispatch = ChannelAckDispatch::new(Arc::new(Transports::new()));
        let err = dispatch.send(&ack("10.0.0.1:5060/UDP")).await.unwrap_err();
        assert!(matches!(err, SendError::NoRoute(_)));
        assert_eq!(
            dispatch.last_hop_attempted(),
            Some(HopAddress::parse("10.0.0.1:5060/UDP").unwrap())
        );
    }

    #[tokio::test]
    async fn failure_records_hop_and_wraps_transport_error() {
        let tcp = Arc::new(ChannelProcessor::new(TransportKind::Tcp, ProcessorConfig::default()).unwrap());
        let dispatch = ChannelAckDispatch::new(Arc::new(Transports::new().with(tcp)));
        // Processor never started.
        let err = dispatch.send(&ack("127.0.0.1:5060/TCP")).await.unwrap_err();
        assert!(matches!(
            err,
            SendError::Transport { source: TransportError::NotStarted, .. }
        ));
        assert!(dispatch.last_hop_attempted().is_some());
    }
}

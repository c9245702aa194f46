// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Load shedding for SIP services
//!
//! This crate provides an admission valve that protects a bounded transaction
//! table from overload. It runs once per inbound request, before any
//! transaction lookup, and decides whether the request may proceed.
//!
//! # Policy
//!
//! Evaluated in order:
//!
//! 1. **Exempt methods** (BYE, ACK, PRACK, CANCEL) are always admitted; they
//!    release resources, so shedding them would deepen the overload.
//! 2. **Below the high-water mark** the request is admitted.
//! 3. **In-dialog requests** (a To tag is present) are admitted so calls in
//!    progress are not starved.
//! 4. Anything else is **rejected**, either with the configured error status
//!    sent back on the originating channel or silently when the status is 0.
//!
//! The valve owns no counters. It reads the table size from the stack through
//! [`TransactionTable`] and builds rejections through [`ResponseFactory`].
//!
//! # Example
//!
//! ```
//! use std::sync::atomic::AtomicUsize;
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use sip_congestion::{
//!     AdmissionRequest, AdmissionValve, CongestionConfig, Decision, ResponseFactory,
//! };
//!
//! struct Request { method: &'static str, to_tag: bool }
//!
//! impl AdmissionRequest for Request {
//!     fn method(&self) -> &str { self.method }
//!     fn has_to_tag(&self) -> bool { self.to_tag }
//! }
//!
//! struct Responses;
//!
//! impl ResponseFactory<Request> for Responses {
//!     fn create_error_response(&self, _request: &Request, status: u16) -> Bytes {
//!         Bytes::from(format!("SIP/2.0 {} Service Unavailable\r\n\r\n", status))
//!     }
//! }
//!
//! let table = Arc::new(AtomicUsize::new(0));
//! let valve: AdmissionValve<Request> =
//!     AdmissionValve::new(CongestionConfig::new(100), table, Arc::new(Responses));
//!
//! let invite = Request { method: "INVITE", to_tag: false };
//! assert!(valve.decide(&invite, 99).is_admit());
//! assert_eq!(valve.decide(&invite, 100), Decision::Reject { status: Some(503) });
//! ```

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use sip_observe::transport_metrics;
use sip_transport::{Channel, TransportError};
use tracing::{debug, trace, warn};

/// Methods that free resources and are never shed.
pub const EXEMPT_METHODS: [&str; 4] = ["BYE", "ACK", "PRACK", "CANCEL"];

/// Configuration for the admission valve
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CongestionConfig {
    /// Transaction-table size at which new work is shed.
    pub high_water_mark: usize,

    /// Status sent back for shed requests. 0 drops them silently.
    pub drop_response_status: u16,
}

impl CongestionConfig {
    /// Create a configuration with the given high-water mark and a 503 drop
    /// response.
    ///
    /// # Example
    ///
    /// ```
    /// use sip_congestion::CongestionConfig;
    ///
    /// let config = CongestionConfig::new(5000);
    /// assert_eq!(config.drop_response_status, 503);
    /// ```
    pub fn new(high_water_mark: usize) -> Self {
        Self {
            high_water_mark,
            drop_response_status: 503,
        }
    }

    /// Set the status used for drop responses (0 for silent drop)
    pub fn with_drop_response_status(mut self, status: u16) -> Self {
        self.drop_response_status = status;
        self
    }

    /// Shed requests without answering them
    pub fn with_silent_drop(self) -> Self {
        self.with_drop_response_status(0)
    }

    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    pub fn is_silent_drop(&self) -> bool {
        self.drop_response_status == 0
    }
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self::new(10_000)
    }
}

/// Source of the current transaction-table size.
pub trait TransactionTable: Send + Sync {
    fn current_size(&self) -> usize;
}

impl TransactionTable for AtomicUsize {
    fn current_size(&self) -> usize {
        self.load(Ordering::Acquire)
    }
}

/// The parts of a parsed request the valve looks at.
pub trait AdmissionRequest {
    /// Request method as it appears on the wire.
    fn method(&self) -> &str;

    /// True if the To header carries a tag, i.e. the request is in-dialog.
    fn has_to_tag(&self) -> bool;
}

/// Builds the wire form of a rejection for a request.
pub trait ResponseFactory<R>: Send + Sync {
    fn create_error_response(&self, request: &R, status: u16) -> Bytes;
}

/// Where a rejection is written; the channel the request arrived on.
#[async_trait]
pub trait ResponseChannel: Send + Sync {
    async fn send_response(&self, response: Bytes) -> Result<(), TransportError>;
}

#[async_trait]
impl ResponseChannel for Channel {
    async fn send_response(&self, response: Bytes) -> Result<(), TransportError> {
        self.send(&response).await
    }
}

/// Why a request was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitReason {
    ExemptMethod,
    BelowHighWaterMark,
    InDialog,
}

/// Outcome of the admission policy for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admit(AdmitReason),
    /// Shed the request; answer with `status` if present.
    Reject { status: Option<u16> },
}

impl Decision {
    pub fn is_admit(&self) -> bool {
        matches!(self, Decision::Admit(_))
    }
}

/// High-water-mark gate in front of transaction processing.
pub struct AdmissionValve<R> {
    config: CongestionConfig,
    table: Arc<dyn TransactionTable>,
    responses: Arc<dyn ResponseFactory<R>>,
}

impl<R> fmt::Debug for AdmissionValve<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionValve")
            .field("config", &self.config)
            .finish()
    }
}

impl<R: AdmissionRequest> AdmissionValve<R> {
    pub fn new(
        config: CongestionConfig,
        table: Arc<dyn TransactionTable>,
        responses: Arc<dyn ResponseFactory<R>>,
    ) -> Self {
        Self {
            config,
            table,
            responses,
        }
    }

    pub fn config(&self) -> &CongestionConfig {
        &self.config
    }

    /// Applies the policy to a request given a table size. Has no side effects.
    pub fn decide(&self, request: &R, table_size: usize) -> Decision {
        if EXEMPT_METHODS.iter().any(|m| *m == request.method()) {
            return Decision::Admit(AdmitReason::ExemptMethod);
        }
        if table_size < self.config.high_water_mark {
            return Decision::Admit(AdmitReason::BelowHighWaterMark);
        }
        if request.has_to_tag() {
            return Decision::Admit(AdmitReason::InDialog);
        }
        Decision::Reject {
            status: (!self.config.is_silent_drop()).then_some(self.config.drop_response_status),
        }
    }

    /// Returns true if processing of `request` may continue.
    ///
    /// On rejection the drop response (if configured) is sent on `channel`.
    /// A failed send is logged and counted; the request stays rejected.
    pub async fn admit<C>(&self, request: &R, channel: &C) -> bool
    where
        C: ResponseChannel + ?Sized,
    {
        let size = self.table.current_size();
        let status = match self.decide(request, size) {
            Decision::Admit(reason) => {
                trace!(method = request.method(), ?reason, "request admitted");
                return true;
            }
            Decision::Reject { status } => status,
        };

        transport_metrics().on_admission_rejected(request.method(), status.unwrap_or(0));
        match status {
            Some(status) => {
                debug!(
                    method = request.method(),
                    size,
                    high_water_mark = self.config.high_water_mark,
                    status,
                    "transaction table full; rejecting request"
                );
                let response = self.responses.create_error_response(request, status);
                if let Err(e) = channel.send_response(response).await {
                    warn!(%e, status, "failed to send drop response");
                    transport_metrics().on_error("congestion", "drop_response");
                }
            }
            None => {
                debug!(
                    method = request.method(),
                    size,
                    high_water_mark = self.config.high_water_mark,
                    "transaction table full; dropping request silently"
                );
            }
        }
        false
    }
}

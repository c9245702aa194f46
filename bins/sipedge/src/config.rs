// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

/// Configuration for the sipedge daemon.
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use sip_congestion::CongestionConfig;
use sip_transport::ProcessorConfig;

/// Daemon settings, loadable from a JSON file.
///
/// ```json
/// {
///   "tcp": { "bind": "0.0.0.0:5060", "idle_timeout_ms": 120000 },
///   "ws": { "bind": "0.0.0.0:8080" },
///   "congestion": { "high_water_mark": 5000, "drop_response_status": 503 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub tcp: Option<ProcessorConfig>,
    pub ws: Option<ProcessorConfig>,
    /// TLS listener; needs `tls_cert` and `tls_key`.
    pub tls: Option<ProcessorConfig>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub congestion: CongestionConfig,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            tcp: Some(ProcessorConfig::default().with_bind(SocketAddr::from(([0, 0, 0, 0], 5060)))),
            ws: None,
            tls: None,
            tls_cert: None,
            tls_key: None,
            congestion: CongestionConfig::default(),
        }
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub tcp_bind: Option<SocketAddr>,
    pub ws_bind: Option<SocketAddr>,
    pub tls_bind: Option<SocketAddr>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub high_water_mark: Option<usize>,
    pub drop_status: Option<u16>,
    pub idle_timeout: Option<Duration>,
}

impl EdgeConfig {
    /// Reads a JSON config file. Missing fields keep their defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(serde_json::from_str(contents)?)
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(bind) = overrides.tcp_bind {
            self.tcp = Some(self.tcp.take().unwrap_or_default().with_bind(bind));
        }
        if let Some(bind) = overrides.ws_bind {
            self.ws = Some(self.ws.take().unwrap_or_default().with_bind(bind));
        }
        if let Some(bind) = overrides.tls_bind {
            self.tls = Some(self.tls.take().unwrap_or_default().with_bind(bind));
        }
        if overrides.tls_cert.is_some() {
            self.tls_cert = overrides.tls_cert.clone();
        }
        if overrides.tls_key.is_some() {
            self.tls_key = overrides.tls_key.clone();
        }
        if let Some(mark) = overrides.high_water_mark {
            self.congestion.high_water_mark = mark;
        }
        if let Some(status) = overrides.drop_status {
            self.congestion.drop_response_status = status;
        }
        if let Some(timeout) = overrides.idle_timeout {
            for processor in [&mut self.tcp, &mut self.ws, &mut self.tls].into_iter().flatten() {
                processor.idle_timeout_ms = timeout.as_millis() as u64;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_listens_on_tcp_only() {
        let config = EdgeConfig::default();
        assert_eq!(
            config.tcp.as_ref().and_then(|c| c.bind),
            Some("0.0.0.0:5060".parse().unwrap())
        );
        assert!(config.ws.is_none());
        assert_eq!(config.congestion.high_water_mark, 10_000);
    }

    #[test]
    fn parses_partial_file() {
        let config = EdgeConfig::parse(
            r#"{"ws":{"bind":"127.0.0.1:8080"},"congestion":{"drop_response_status":0}}"#,
        )
        .unwrap();
        assert_eq!(config.ws.unwrap().bind, Some("127.0.0.1:8080".parse().unwrap()));
        assert!(config.tcp.is_some());
        assert!(config.congestion.is_silent_drop());
    }

    #[test]
    fn rejects_malformed_file() {
        assert!(EdgeConfig::parse("{ not json").is_err());
    }

    #[test]
    fn overrides_win_over_file() {
        let mut config = EdgeConfig::parse(r#"{"congestion":{"high_water_mark":5}}"#).unwrap();
        config.apply(&Overrides {
            ws_bind: Some("127.0.0.1:9000".parse().unwrap()),
            high_water_mark: Some(50),
            drop_status: Some(486),
            idle_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        assert_eq!(config.congestion.high_water_mark, 50);
        assert_eq!(config.congestion.drop_response_status, 486);
        let ws = config.ws.unwrap();
        assert_eq!(ws.bind, Some("127.0.0.1:9000".parse().unwrap()));
        assert_eq!(ws.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.tcp.unwrap().idle_timeout(), Duration::from_secs(30));
    }
}

// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! rustls plumbing for TLS and WSS channel processors.

use std::fs::File;
use std::io::{self, BufReader};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::rustls::{
    self,
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::channel::{split_boxed, BoxedReader, BoxedWriter};
use crate::TransportError;

/// TLS material for a secure processor.
///
/// `server` is required to accept connections, `client` to open them. A
/// processor with only one side configured refuses the other direction.
#[derive(Clone, Default)]
pub struct TlsSettings {
    pub server: Option<Arc<rustls::ServerConfig>>,
    pub client: Option<Arc<rustls::ClientConfig>>,
}

impl std::fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSettings")
            .field("server", &self.server.is_some())
            .field("client", &self.client.is_some())
            .finish()
    }
}

impl TlsSettings {
    pub fn with_server(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.server = Some(config);
        self
    }

    pub fn with_client(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.client = Some(config);
        self
    }
}

/// Runs the client handshake. `host` is the name checked against the peer
/// certificate.
pub(crate) async fn connect(
    settings: &TlsSettings,
    host: &str,
    stream: TcpStream,
) -> Result<(BoxedReader, BoxedWriter), TransportError> {
    let config = settings
        .client
        .clone()
        .ok_or_else(|| TransportError::Handshake("no TLS client configuration".into()))?;
    let name = host.trim_start_matches('[').trim_end_matches(']').to_owned();
    let server_name = ServerName::try_from(name)
        .map_err(|_| TransportError::Handshake(format!("invalid TLS server name {}", host)))?;
    let tls_stream = TlsConnector::from(config).connect(server_name, stream).await?;
    Ok(split_boxed(tls_stream))
}

/// Runs the server handshake on an accepted connection.
pub(crate) async fn accept(
    settings: &TlsSettings,
    stream: TcpStream,
) -> Result<(BoxedReader, BoxedWriter), TransportError> {
    let config = settings
        .server
        .clone()
        .ok_or_else(|| TransportError::Handshake("no TLS server configuration".into()))?;
    let tls_stream = TlsAcceptor::from(config).accept(stream).await?;
    Ok(split_boxed(tls_stream))
}

/// Error for PEM material that is present but unusable.
fn bad_pem(path: &str, what: impl std::fmt::Display) -> TransportError {
    TransportError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{}: {}", path, what),
    ))
}

fn pem_reader(path: &str) -> Result<BufReader<File>, TransportError> {
    Ok(BufReader::new(File::open(path)?))
}

/// Every certificate in a PEM file, leaf first.
fn read_cert_chain(path: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let chain = rustls_pemfile::certs(&mut pem_reader(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| bad_pem(path, e))?;
    if chain.is_empty() {
        return Err(bad_pem(path, "no certificates"));
    }
    Ok(chain)
}

/// First private key in a PEM file (PKCS#8, PKCS#1 or SEC1).
fn read_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    rustls_pemfile::private_key(&mut pem_reader(path)?)
        .map_err(|e| bad_pem(path, e))?
        .ok_or_else(|| bad_pem(path, "no private key"))
}

/// Builds a server config for TLS/WSS listeners from PEM files.
///
/// Client certificates are not requested.
pub fn load_rustls_server_config(
    cert_path: &str,
    key_path: &str,
) -> Result<Arc<rustls::ServerConfig>, TransportError> {
    let chain = read_cert_chain(cert_path)?;
    let key = read_private_key(key_path)?;
    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map(Arc::new)
        .map_err(|e| bad_pem(cert_path, format!("certificate does not match key: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_surface_io_errors() {
        let err = load_rustls_server_config("/nonexistent/cert.pem", "/nonexistent/key.pem")
            .unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }

    #[test]
    fn empty_certificate_file_is_rejected() {
        let dir = std::env::temp_dir().join(format!("sip-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("empty.pem");
        std::fs::write(&cert, b"").unwrap();
        let err = load_rustls_server_config(cert.to_str().unwrap(), "/nonexistent/key.pem")
            .unwrap_err();
        assert!(err.to_string().contains("no certificates"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn key_file_without_key_is_rejected() {
        let dir = std::env::temp_dir().join(format!("sip-tls-key-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let key = dir.join("nokey.pem");
        std::fs::write(&key, b"not a pem file\n").unwrap();
        let err = read_private_key(key.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("no private key"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}

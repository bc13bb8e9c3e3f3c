//! Byte transport under a session: plain TCP or TLS over TCP.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};
use tokio_rustls::rustls::{self, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::trace;

use super::error::{WireError, WireResult};
use crate::config::ClientConfig;

/// An open stream to the server.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Opens transports to one endpoint. Built once per pool so the TLS root
/// store is loaded once.
#[derive(Clone)]
pub struct Connector {
    addr: String,
    connect_timeout: Duration,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl Connector {
    pub fn new(config: &ClientConfig) -> WireResult<Self> {
        let tls = if config.tls {
            Some((tls_connector(config)?, server_name(&config.host)?))
        } else {
            None
        };

        Ok(Self {
            addr: config.addr(),
            connect_timeout: config.connect_timeout,
            tls,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// TCP connect plus TLS handshake when enabled, both within `connect_timeout`.
    pub async fn connect(&self) -> WireResult<Transport> {
        match timeout(self.connect_timeout, self.establish()).await {
            Ok(result) => result,
            Err(_) => Err(WireError::Connect(format!(
                "{}: no connection within {:?}",
                self.addr, self.connect_timeout
            ))),
        }
    }

    async fn establish(&self) -> WireResult<Transport> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| WireError::Connect(format!("{}: {}", self.addr, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| WireError::Connect(format!("{}: {}", self.addr, e)))?;

        let Some((connector, name)) = &self.tls else {
            return Ok(Transport::Plain(stream));
        };

        trace!(addr = %self.addr, "starting TLS handshake");
        let stream = connector
            .connect(name.clone(), stream)
            .await
            .map_err(|e| {
                WireError::Connect(format!("{}: TLS handshake failed: {}", self.addr, e))
            })?;
        Ok(Transport::Tls(Box::new(stream)))
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("addr", &self.addr)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Client TLS setup: public web roots plus any configured extra roots.
fn tls_connector(config: &ClientConfig) -> WireResult<TlsConnector> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for der in &config.root_certificates {
        roots
            .add(CertificateDer::from(der.clone()))
            .map_err(|e| WireError::Connect(format!("invalid root certificate: {}", e)))?;
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls_config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| WireError::Connect(format!("TLS setup failed: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(tls_config)))
}

fn server_name(host: &str) -> WireResult<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| WireError::Connect(format!("invalid TLS server name '{}': {}", host, e)))
}

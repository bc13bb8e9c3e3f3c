//! Session: one connection and its login state.
//!
//! This module provides the connection type that handles:
//! - Connection establishment (plain TCP or TLS)
//! - The `login` handshake
//! - Exactly one command in flight at a time
//! - Graceful shutdown
//!
//! The protocol carries no request identifiers, so a `Connection` is never
//! shared: whoever holds `&mut Connection` owns the socket.

use std::future::poll_fn;
use std::io::ErrorKind;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::Poll;
use std::time::Duration;

use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use super::error::{WireError, WireResult};
use super::protocol::{encode_frame, FrameDecoder, LoginMessage, Response};
use super::transport::{Connector, Transport};
use crate::config::{ClientConfig, Credentials};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Protocol state of a session.
///
/// A `Connection` value only exists once the transport is open, so
/// the "connecting" phase is the pending [`Connection::connect`] future
/// (and the pool's `connecting` count) rather than a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket closed or broken; terminal.
    Disconnected,
    /// Connected, login not yet acknowledged.
    Authenticating,
    /// Logged in and idle.
    Ready,
    /// A command is in flight.
    Busy,
}

/// A VNDB session.
pub struct Connection {
    reader: BufReader<ReadHalf<Transport>>,
    writer: BufWriter<WriteHalf<Transport>>,
    /// Frames not yet pulled
    decoder: FrameDecoder,
    state: SessionState,
    /// Process-unique id, used in logs
    id: u64,
    /// Login identity once authenticated
    identity: Option<String>,
    auth_timeout: Duration,
    request_timeout: Option<Duration>,
    close_timeout: Duration,
    /// Set once `close` has run
    closed: bool,
}

impl Connection {
    /// Open the transport. The session is left waiting for [`authenticate`](Self::authenticate).
    pub async fn connect(config: &ClientConfig) -> WireResult<Self> {
        Self::connect_with(&Connector::new(config)?, config).await
    }

    /// Like [`connect`](Self::connect), reusing a prepared connector.
    pub async fn connect_with(connector: &Connector, config: &ClientConfig) -> WireResult<Self> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        trace!(session = id, addr = connector.addr(), "connecting");

        let transport = connector.connect().await?;
        let tls = transport.is_tls();
        let (read_half, write_half) = tokio::io::split(transport);
        debug!(session = id, addr = connector.addr(), tls, "connected");

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            decoder: FrameDecoder::new(),
            state: SessionState::Authenticating,
            id,
            identity: None,
            auth_timeout: config.auth_timeout,
            request_timeout: config.request_timeout,
            close_timeout: config.close_timeout,
            closed: false,
        })
    }

    /// Connect and log in with a fresh identity.
    pub async fn open(config: &ClientConfig) -> WireResult<Self> {
        Self::open_with(&Connector::new(config)?, config).await
    }

    pub async fn open_with(connector: &Connector, config: &ClientConfig) -> WireResult<Self> {
        let mut conn = Self::connect_with(connector, config).await?;
        let identity = config.session_identity();
        conn.authenticate(&identity, config.credentials.as_ref()).await?;
        Ok(conn)
    }

    /// Perform the login handshake.
    ///
    /// The server acknowledges with a bare `ok` frame; anything else, a socket
    /// error, or silence past the auth timeout fails the session.
    pub async fn authenticate(
        &mut self,
        identity: &str,
        credentials: Option<&Credentials>,
    ) -> WireResult<()> {
        if self.state != SessionState::Authenticating {
            return Err(WireError::InvalidState(format!(
                "cannot log in while {:?}",
                self.state
            )));
        }

        let mut login = LoginMessage::new(identity);
        if let Some(creds) = credentials {
            login = login.with_credentials(&creds.username, &creds.password);
        }
        let command = login.to_command()?.to_string();

        let auth_timeout = self.auth_timeout;
        let frame = match timeout(auth_timeout, self.exchange(&command)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                self.state = SessionState::Disconnected;
                return Err(WireError::Auth(e.to_string()));
            }
            Err(_) => {
                self.state = SessionState::Disconnected;
                return Err(WireError::Auth(format!(
                    "no reply to login within {:?}",
                    auth_timeout
                )));
            }
        };

        if frame != "ok" {
            self.state = SessionState::Disconnected;
            let reason = match Response::from_frame(&frame) {
                Ok(Response::Error(e)) => format!("{} ({})", e.msg, e.id),
                _ => format!("unexpected reply '{}'", frame),
            };
            return Err(WireError::Auth(reason));
        }

        self.state = SessionState::Ready;
        self.identity = Some(identity.to_string());
        debug!(session = self.id, identity, "authenticated");
        Ok(())
    }

    /// Send one command and wait for its single response frame.
    ///
    /// A transport failure, or no reply within the request timeout, leaves the
    /// session `Disconnected`; the caller must not reuse it.
    pub async fn send(&mut self, command: &str) -> WireResult<Response> {
        if self.state != SessionState::Ready {
            return Err(WireError::InvalidState(format!(
                "cannot send while {:?}",
                self.state
            )));
        }

        // Whatever arrived between commands belongs to no request.
        match self.discard_unsolicited().await {
            Ok(0) => {}
            Ok(bytes) => warn!(session = self.id, bytes, "discarding unsolicited data"),
            Err(e) => {
                self.state = SessionState::Disconnected;
                return Err(match e {
                    WireError::Io(e) => WireError::ConnectionLost(e.to_string()),
                    other => other,
                });
            }
        }

        self.state = SessionState::Busy;
        trace!(session = self.id, command, "sending");

        let request_timeout = self.request_timeout;
        let result = match request_timeout {
            Some(limit) => match timeout(limit, self.exchange(command)).await {
                Ok(result) => result,
                Err(_) => Err(WireError::ConnectionLost(format!(
                    "no response within {:?}",
                    limit
                ))),
            },
            None => self.exchange(command).await,
        };

        match result {
            Ok(frame) => {
                self.state = SessionState::Ready;
                Response::from_frame(&frame)
            }
            // The frame boundary was consumed, the socket is still in sync.
            Err(WireError::MalformedFrame(msg)) => {
                self.state = SessionState::Ready;
                Err(WireError::MalformedFrame(msg))
            }
            Err(WireError::Io(e)) => {
                self.state = SessionState::Disconnected;
                Err(WireError::ConnectionLost(e.to_string()))
            }
            Err(e) => {
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Close the connection gracefully.
    ///
    /// Shuts down the write side (TLS `close_notify`, then FIN) and waits for
    /// the peer to close its side, bounded by the close timeout. Calling it again is a no-op.
    pub async fn close(&mut self) -> WireResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.state = SessionState::Disconnected;
        self.decoder.clear();

        let close_timeout = self.close_timeout;
        match timeout(close_timeout, self.shutdown()).await {
            Ok(result) => {
                debug!(session = self.id, "closed");
                result
            }
            Err(_) => Err(WireError::ConnectionLost(format!(
                "peer did not confirm close within {:?}",
                close_timeout
            ))),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Login identity, once authenticated.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Check if the connection is closed or broken.
    pub fn is_closed(&self) -> bool {
        self.closed || self.state == SessionState::Disconnected
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    /// Write one frame and read one frame back.
    async fn exchange(&mut self, text: &str) -> WireResult<String> {
        self.write_frame(text).await?;
        self.read_frame().await
    }

    /// Drop buffered bytes and everything the socket can hand over without
    /// waiting. Returns how many bytes were thrown away.
    async fn discard_unsolicited(&mut self) -> WireResult<usize> {
        let mut discarded = self.decoder.buffered();
        self.decoder.clear();

        let mut buf = [0u8; 4096];
        loop {
            let mut read_buf = ReadBuf::new(&mut buf);
            let reader = &mut self.reader;
            let polled = poll_fn(|cx| match Pin::new(&mut *reader).poll_read(cx, &mut read_buf) {
                Poll::Ready(result) => Poll::Ready(Some(result)),
                Poll::Pending => Poll::Ready(None),
            })
            .await;

            match polled {
                None => return Ok(discarded),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(())) if read_buf.filled().is_empty() => {
                    return Err(WireError::ConnectionLost(
                        "connection closed by server".to_string(),
                    ))
                }
                Some(Ok(())) => discarded += read_buf.filled().len(),
            }
        }
    }

    async fn write_frame(&mut self, text: &str) -> WireResult<()> {
        let encoded = encode_frame(text);
        self.writer.write_all(&encoded).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_frame(&mut self) -> WireResult<String> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(frame);
            }

            let mut buf = [0u8; 4096];
            let n = self.reader.read(&mut buf).await?;
            if n == 0 {
                return Err(WireError::ConnectionLost(
                    "connection closed by server".to_string(),
                ));
            }
            self.decoder.feed(&buf[..n]);
        }
    }

    async fn shutdown(&mut self) -> WireResult<()> {
        self.writer.shutdown().await?;

        let mut buf = [0u8; 1024];
        loop {
            match self.reader.read(&mut buf).await {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                // A TLS peer that closes without close_notify.
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("identity", &self.identity)
            .finish()
    }
}

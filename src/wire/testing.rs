//! In-process mock server for protocol tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::TlsAcceptor;

use super::protocol::{FrameDecoder, EOT};
use crate::config::{ClientConfig, RateInterval};

/// Test CA that signed [`SERVER_CERT`].
pub(crate) const CA_CERT: &[u8] = include_bytes!("testdata/ca.der");
/// Leaf for `localhost` and `127.0.0.1`.
const SERVER_CERT: &[u8] = include_bytes!("testdata/server.der");
const SERVER_KEY: &[u8] = include_bytes!("testdata/server.key.der");

/// Route `tracing` output through the test harness; `RUST_LOG` filters it.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it holds, for at most two seconds.
pub(crate) async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// What the mock does with one received frame.
pub(crate) enum Reply {
    /// Send this text followed by the terminator.
    Frame(String),
    /// Send these bytes as-is, one write each, with a short pause between.
    Chunks(Vec<Vec<u8>>),
    /// Wait, then send this text followed by the terminator.
    Delayed(Duration, String),
    /// Send nothing.
    Silence,
    /// Drop the connection.
    Hangup,
}

impl Reply {
    pub(crate) fn frame(text: &str) -> Self {
        Reply::Frame(text.to_string())
    }
}

type Handler = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

#[derive(Default)]
pub(crate) struct ServerStats {
    pub accepted: AtomicUsize,
    pub commands: AtomicUsize,
    pub disconnects: AtomicUsize,
    /// Connections currently open
    pub open: AtomicUsize,
    /// Highest value `open` ever reached
    pub peak_open: AtomicUsize,
    pub logins: Mutex<Vec<String>>,
}

pub(crate) struct MockServer {
    addr: SocketAddr,
    tls: bool,
    stats: Arc<ServerStats>,
    handle: JoinHandle<()>,
}

impl MockServer {
    /// Accept every login; answer other frames with `handler`.
    pub(crate) async fn spawn<F>(handler: F) -> Self
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        Self::start(None, Arc::new(|_: &str| Reply::frame("ok")), Arc::new(handler)).await
    }

    pub(crate) async fn spawn_with_login<L, F>(login: L, handler: F) -> Self
    where
        L: Fn(&str) -> Reply + Send + Sync + 'static,
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        Self::start(None, Arc::new(login), Arc::new(handler)).await
    }

    /// Like [`spawn`](Self::spawn), behind TLS with the test certificate.
    pub(crate) async fn spawn_tls<F>(handler: F) -> Self
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        let acceptor = tls_acceptor();
        Self::start(
            Some(acceptor),
            Arc::new(|_: &str| Reply::frame("ok")),
            Arc::new(handler),
        )
        .await
    }

    async fn start(acceptor: Option<TlsAcceptor>, login: Handler, handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(ServerStats::default());
        let tls = acceptor.is_some();

        let handle = tokio::spawn({
            let stats = Arc::clone(&stats);
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    stats.accepted.fetch_add(1, Ordering::SeqCst);
                    let open = stats.open.fetch_add(1, Ordering::SeqCst) + 1;
                    stats.peak_open.fetch_max(open, Ordering::SeqCst);

                    let login = Arc::clone(&login);
                    let handler = Arc::clone(&handler);
                    let stats = Arc::clone(&stats);
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match acceptor {
                            None => serve(socket, login, handler, stats).await,
                            Some(acceptor) => match acceptor.accept(socket).await {
                                Ok(socket) => serve(socket, login, handler, stats).await,
                                Err(_) => disconnected(&stats),
                            },
                        }
                    });
                }
            }
        });

        Self {
            addr,
            tls,
            stats,
            handle,
        }
    }

    /// Client configuration pointing at this server, with short timeouts.
    /// A TLS server is reached as `localhost` and trusts the test CA.
    pub(crate) fn config(&self) -> ClientConfig {
        let config = if self.tls {
            ClientConfig::new("vndbkit-test")
                .host("localhost")
                .tls(true)
                .add_root_certificate(CA_CERT)
        } else {
            ClientConfig::new("vndbkit-test").host("127.0.0.1")
        };
        config
            .port(self.addr.port())
            .min_connections(0)
            .max_connections(4)
            .connect_timeout(Duration::from_secs(2))
            .auth_timeout(Duration::from_secs(2))
            .close_timeout(Duration::from_secs(1))
            .rate_limit(1000, RateInterval::Second)
    }

    pub(crate) fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub(crate) fn accepted(&self) -> usize {
        self.stats.accepted.load(Ordering::SeqCst)
    }

    pub(crate) fn commands(&self) -> usize {
        self.stats.commands.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.stats.disconnects.load(Ordering::SeqCst)
    }

    pub(crate) fn logins(&self) -> Vec<String> {
        self.stats.logins.lock().clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn tls_acceptor() -> TlsAcceptor {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            vec![CertificateDer::from(SERVER_CERT.to_vec())],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(SERVER_KEY.to_vec())),
        )
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

fn disconnected(stats: &ServerStats) {
    stats.open.fetch_sub(1, Ordering::SeqCst);
    stats.disconnects.fetch_add(1, Ordering::SeqCst);
}

async fn serve<S>(mut socket: S, login: Handler, handler: Handler, stats: Arc<ServerStats>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];

    'conn: loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let Ok(frames) = decoder.decode(&buf[..n]) else {
            break;
        };

        for frame in frames {
            let reply = if frame.starts_with("login ") {
                stats.logins.lock().push(frame.clone());
                login(&frame)
            } else {
                stats.commands.fetch_add(1, Ordering::SeqCst);
                handler(&frame)
            };

            match reply {
                Reply::Frame(text) => {
                    if send_frame(&mut socket, text).await.is_err() {
                        break 'conn;
                    }
                }
                Reply::Delayed(wait, text) => {
                    tokio::time::sleep(wait).await;
                    if send_frame(&mut socket, text).await.is_err() {
                        break 'conn;
                    }
                }
                Reply::Chunks(chunks) => {
                    for chunk in chunks {
                        if socket.write_all(&chunk).await.is_err() {
                            break 'conn;
                        }
                        let _ = socket.flush().await;
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                }
                Reply::Silence => {}
                Reply::Hangup => break 'conn,
            }
        }
    }

    // Counted before the socket goes away, so a client whose close has
    // returned always sees it.
    disconnected(&stats);
    let _ = socket.shutdown().await;
}

async fn send_frame<S>(socket: &mut S, text: String) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut out = text.into_bytes();
    out.push(EOT);
    socket.write_all(&out).await?;
    socket.flush().await
}

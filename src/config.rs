//! Client configuration.
//!
//! Every recognised option lives on [`ClientConfig`] with its default;
//! [`ClientConfig::validate`] runs once when a client is built.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::error::{Result, VndbError};
use crate::wire::protocol::{DEFAULT_HOST, DEFAULT_PORT, DEFAULT_TLS_PORT};

// ============================================================================
// Credentials
// ============================================================================

/// Optional account login sent with the handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// Rate Interval
// ============================================================================

/// Refill period of the outbound rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateInterval {
    Second,
    Minute,
    Hour,
    Custom(Duration),
}

impl RateInterval {
    pub fn as_duration(&self) -> Duration {
        match self {
            RateInterval::Second => Duration::from_secs(1),
            RateInterval::Minute => Duration::from_secs(60),
            RateInterval::Hour => Duration::from_secs(3600),
            RateInterval::Custom(d) => *d,
        }
    }
}

impl From<Duration> for RateInterval {
    fn from(d: Duration) -> Self {
        RateInterval::Custom(d)
    }
}

impl FromStr for RateInterval {
    type Err = VndbError;

    /// Accepts `second`, `minute`, `hour`, or a number suffixed with `ms` or `s`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "second" | "sec" => return Ok(RateInterval::Second),
            "minute" | "min" => return Ok(RateInterval::Minute),
            "hour" => return Ok(RateInterval::Hour),
            _ => {}
        }

        let invalid = || VndbError::ConfigError(format!("Invalid rate interval: {}", s));
        if let Some(ms) = s.strip_suffix("ms") {
            let ms = ms.trim().parse::<u64>().map_err(|_| invalid())?;
            Ok(RateInterval::Custom(Duration::from_millis(ms)))
        } else if let Some(secs) = s.strip_suffix('s') {
            let secs = secs.trim().parse::<u64>().map_err(|_| invalid())?;
            Ok(RateInterval::Custom(Duration::from_secs(secs)))
        } else {
            Err(invalid())
        }
    }
}

// ============================================================================
// Client Configuration
// ============================================================================

/// Full configuration of a client instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server hostname or IP address
    pub host: String,
    /// Server port (default: 19534, or 19535 with TLS)
    pub port: u16,
    /// Wrap the connection in TLS
    pub tls: bool,
    /// Extra DER-encoded trust anchors for TLS, on top of the public web roots
    pub root_certificates: Vec<Vec<u8>>,
    /// Text encoding of the wire (only UTF-8 is supported)
    pub encoding: String,
    /// Application name; each session logs in as `{client_name}-{id}`
    pub client_name: String,
    /// Optional account credentials
    pub credentials: Option<Credentials>,
    /// Commands allowed per `rate_interval`
    pub rate_limit: u32,
    /// Rate limiter refill period
    pub rate_interval: RateInterval,
    /// Sessions the pool keeps open even when idle
    pub min_connections: u32,
    /// Hard cap on live sessions
    pub max_connections: u32,
    /// Idle sessions older than this are closed (down to `min_connections`)
    pub idle_timeout: Duration,
    /// How long `acquire` may wait for a free session (None = forever)
    pub acquire_timeout: Option<Duration>,
    /// TCP connect deadline
    pub connect_timeout: Duration,
    /// Login handshake deadline
    pub auth_timeout: Duration,
    /// Per-command response deadline (None = wait indefinitely)
    pub request_timeout: Option<Duration>,
    /// How long to wait for the peer to confirm a graceful close
    pub close_timeout: Duration,
    /// Period of the idle eviction sweep
    pub eviction_interval: Duration,
    /// Cap on throttle retries per query (None = unbounded)
    pub max_throttle_retries: Option<u32>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            tls: false,
            root_certificates: Vec::new(),
            encoding: "utf8".to_string(),
            client_name: "vndbkit".to_string(),
            credentials: None,
            rate_limit: 10,
            rate_interval: RateInterval::Second,
            min_connections: 1,
            max_connections: 10,
            idle_timeout: Duration::from_secs(30),
            acquire_timeout: None,
            connect_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            request_timeout: None,
            close_timeout: Duration::from_secs(5),
            eviction_interval: Duration::from_secs(1),
            max_throttle_retries: None,
        }
    }
}

impl ClientConfig {
    /// Create a configuration with defaults and the given application name.
    pub fn new(client_name: &str) -> Self {
        Self {
            client_name: client_name.to_string(),
            ..Self::default()
        }
    }

    /// Parse a connection URL.
    ///
    /// Format: `vndb://[user:password@]host[:port]`, or `vndbs://` for TLS
    pub fn from_url(url: &str) -> Result<Self> {
        let (tls, rest) = if let Some(rest) = url.strip_prefix("vndbs://") {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix("vndb://") {
            (false, rest)
        } else {
            return Err(VndbError::ConfigError(format!("Invalid URL scheme: {}", url)));
        };
        let default_port = if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT };
        let rest = rest.trim_end_matches('/');

        let (credentials, host_port) = match rest.rfind('@') {
            Some(at) => (Some(&rest[..at]), &rest[at + 1..]),
            None => (None, rest),
        };

        let credentials = match credentials {
            Some(creds) => {
                let (user, password) = creds.split_once(':').ok_or_else(|| {
                    VndbError::ConfigError("Credentials must be user:password".to_string())
                })?;
                Some(Credentials::new(user, password))
            }
            None => None,
        };

        let (host, port) = match host_port.rfind(':') {
            Some(colon) => {
                let port_str = &host_port[colon + 1..];
                let port = port_str
                    .parse::<u16>()
                    .map_err(|_| VndbError::ConfigError(format!("Invalid port: {}", port_str)))?;
                (host_port[..colon].to_string(), port)
            }
            None => (host_port.to_string(), default_port),
        };

        if host.is_empty() {
            return Err(VndbError::ConfigError("Missing host".to_string()));
        }

        Ok(Self {
            host,
            port,
            tls,
            credentials,
            ..Self::default()
        })
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Enable or disable TLS. A port still at the default of the other mode
    /// follows along; an explicitly chosen port is kept.
    pub fn tls(mut self, enabled: bool) -> Self {
        if enabled && self.port == DEFAULT_PORT {
            self.port = DEFAULT_TLS_PORT;
        } else if !enabled && self.port == DEFAULT_TLS_PORT {
            self.port = DEFAULT_PORT;
        }
        self.tls = enabled;
        self
    }

    /// Trust an additional DER-encoded root certificate.
    pub fn add_root_certificate(mut self, der: impl Into<Vec<u8>>) -> Self {
        self.root_certificates.push(der.into());
        self
    }

    pub fn encoding(mut self, encoding: &str) -> Self {
        self.encoding = encoding.to_string();
        self
    }

    pub fn client_name(mut self, name: &str) -> Self {
        self.client_name = name.to_string();
        self
    }

    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    /// Allow `limit` commands per `interval`.
    pub fn rate_limit(mut self, limit: u32, interval: impl Into<RateInterval>) -> Self {
        self.rate_limit = limit;
        self.rate_interval = interval.into();
        self
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    pub fn max_throttle_retries(mut self, retries: u32) -> Self {
        self.max_throttle_retries = Some(retries);
        self
    }

    /// `host:port` for socket connection.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// A fresh login identity, unique per session.
    pub fn session_identity(&self) -> String {
        let id = Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.client_name, &id[..10])
    }

    /// Check that every option is usable.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(VndbError::ConfigError(msg.to_string()));

        if self.host.is_empty() {
            return fail("host must not be empty");
        }
        if self.port == 0 {
            return fail("port must not be 0");
        }
        if !matches!(self.encoding.to_ascii_lowercase().as_str(), "utf8" | "utf-8") {
            return Err(VndbError::ConfigError(format!(
                "Unsupported encoding: {} (only utf8)",
                self.encoding
            )));
        }
        if self.client_name.trim().is_empty() {
            return fail("client_name must not be empty");
        }
        if let Some(creds) = &self.credentials {
            if creds.username.is_empty() || creds.password.is_empty() {
                return fail("username and password must both be set");
            }
        }
        if self.rate_limit == 0 {
            return fail("rate_limit must be at least 1");
        }
        if self.rate_interval.as_duration().is_zero() {
            return fail("rate_interval must be non-zero");
        }
        if self.max_connections == 0 {
            return fail("max_connections must be at least 1");
        }
        if self.min_connections > self.max_connections {
            return fail("min_connections must not exceed max_connections");
        }
        if self.eviction_interval.is_zero() {
            return fail("eviction_interval must be non-zero");
        }
        Ok(())
    }
}

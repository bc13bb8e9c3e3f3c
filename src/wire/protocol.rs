//! VNDB wire protocol framing, encoding and response classification.
//!
//! Every message in either direction is UTF-8 text terminated by a single
//! `0x04` byte. Requests look like `<verb> <args...>`, responses like
//! `<token> <json>` where the token is one of `ok`, `results`, `dbstats`
//! or `error`.

use std::fmt;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{WireError, WireResult};

// ============================================================================
// Protocol Constants
// ============================================================================

/// End-of-transmission byte terminating every frame.
pub const EOT: u8 = 0x04;

/// Protocol version announced in the login payload.
pub const PROTOCOL_VERSION: u32 = 1;

/// Client version announced in the login payload.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_HOST: &str = "api.vndb.org";
pub const DEFAULT_PORT: u16 = 19534;
pub const DEFAULT_TLS_PORT: u16 = 19535;

const OK_TOKEN: &str = "ok";
const RESULTS_TOKEN: &str = "results";
const DBSTATS_TOKEN: &str = "dbstats";
const ERROR_TOKEN: &str = "error";

/// Error id the server uses when it is rate limiting this client.
pub const THROTTLED_ID: &str = "throttled";

// ============================================================================
// Encoding
// ============================================================================

/// Append the frame terminator to a command string.
pub fn encode_frame(command: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(command.len() + 1);
    buf.put_slice(command.as_bytes());
    buf.put_u8(EOT);
    buf
}

/// An outbound command: a verb, optional arguments and optional JSON options.
///
/// Commands built from a plain string are treated as opaque; the verb is just
/// the text up to the first space and `Display` reproduces the input exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    verb: String,
    args: Option<String>,
    options: Option<Value>,
}

impl Command {
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            args: None,
            options: None,
        }
    }

    /// Set the positional arguments (everything between the verb and the options).
    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = Some(args.into());
        self
    }

    /// Set the trailing JSON options object.
    pub fn with_options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }

    /// The `dbstats` command.
    pub fn dbstats() -> Self {
        Self::new(DBSTATS_TOKEN)
    }

    pub fn verb(&self) -> &str {
        &self.verb
    }

    pub fn args(&self) -> Option<&str> {
        self.args.as_deref()
    }

    pub fn options(&self) -> Option<&Value> {
        self.options.as_ref()
    }

    /// Serialize with the frame terminator appended.
    pub fn encode(&self) -> BytesMut {
        encode_frame(&self.to_string())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.verb)?;
        if let Some(args) = &self.args {
            write!(f, " {}", args)?;
        }
        if let Some(options) = &self.options {
            write!(f, " {}", options)?;
        }
        Ok(())
    }
}

impl From<&str> for Command {
    fn from(raw: &str) -> Self {
        match raw.split_once(' ') {
            Some((verb, rest)) => Command::new(verb).with_args(rest),
            None => Command::new(raw),
        }
    }
}

impl From<String> for Command {
    fn from(raw: String) -> Self {
        Command::from(raw.as_str())
    }
}

impl From<&String> for Command {
    fn from(raw: &String) -> Self {
        Command::from(raw.as_str())
    }
}

/// Payload of the `login` command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoginMessage {
    pub protocol: u32,
    pub client: String,
    pub clientver: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl LoginMessage {
    pub fn new(client: impl Into<String>) -> Self {
        Self {
            protocol: PROTOCOL_VERSION,
            client: client.into(),
            clientver: CLIENT_VERSION.to_string(),
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    /// Build the `login {...}` command carrying this payload.
    pub fn to_command(&self) -> WireResult<Command> {
        let options = serde_json::to_value(self)
            .map_err(|e| WireError::Auth(format!("cannot encode login payload: {}", e)))?;
        Ok(Command::new("login").with_options(options))
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Buffered, restartable frame decoder.
///
/// Bytes are fed in whatever chunks the transport produced; complete frames
/// are pulled out one at a time. A trailing partial frame stays buffered
/// until more bytes arrive.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    /// Prefix of `buf` already known not to contain a terminator.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
            scanned: 0,
        }
    }

    /// Append received bytes to the buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next complete frame, without its terminator.
    pub fn next_frame(&mut self) -> WireResult<Option<String>> {
        let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == EOT) else {
            self.scanned = self.buf.len();
            return Ok(None);
        };

        let end = self.scanned + offset;
        let frame = self.buf.split_to(end + 1);
        self.scanned = 0;

        std::str::from_utf8(&frame[..end])
            .map(|s| Some(s.to_owned()))
            .map_err(|e| WireError::MalformedFrame(format!("frame is not valid UTF-8: {}", e)))
    }

    /// Feed bytes and drain every frame that is now complete.
    pub fn decode(&mut self, bytes: &[u8]) -> WireResult<Vec<String>> {
        self.feed(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Number of bytes held that do not yet form a complete frame (or have not been pulled).
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }
}

/// Split a frame into its header token and JSON body.
pub fn split_header(frame: &str) -> WireResult<(&str, Value)> {
    let (token, body) = frame
        .split_once(' ')
        .ok_or_else(|| WireError::MalformedFrame(format!("missing header separator in '{}'", frame)))?;

    if token.is_empty() {
        return Err(WireError::MalformedFrame("empty header token".to_string()));
    }

    let body = serde_json::from_str(body)
        .map_err(|e| WireError::MalformedFrame(format!("invalid JSON body after '{}': {}", token, e)))?;

    Ok((token, body))
}

// ============================================================================
// Responses
// ============================================================================

/// Body of a `results` response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultSet {
    #[serde(default)]
    pub items: Vec<Value>,
    #[serde(default)]
    pub more: bool,
    #[serde(default)]
    pub num: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Body of a `dbstats` response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DbStats {
    pub users: Option<u64>,
    pub threads: Option<u64>,
    pub tags: Option<u64>,
    pub releases: Option<u64>,
    pub producers: Option<u64>,
    pub chars: Option<u64>,
    pub posts: Option<u64>,
    pub vn: Option<u64>,
    pub traits: Option<u64>,
    pub staff: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Body of an `error` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    pub id: String,
    #[serde(default)]
    pub msg: String,
    /// Everything else the server sent (`field`, `type`, `minwait`, `fullwait`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What an `error` response means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    /// Ordinary failure; surfaced as-is.
    Application,
    /// Server-side rate limit; wait and resubmit.
    Throttled { retry_after: Duration },
}

impl ServerError {
    pub fn new(id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            msg: msg.into(),
            extra: Map::new(),
        }
    }

    pub fn kind(&self) -> ServerErrorKind {
        if self.id != THROTTLED_ID {
            return ServerErrorKind::Application;
        }

        // fullwait is the wait until every queued request would pass;
        // minwait only until the first one does.
        let seconds = self
            .extra
            .get("fullwait")
            .and_then(Value::as_f64)
            .or_else(|| self.extra.get("minwait").and_then(Value::as_f64))
            .unwrap_or(0.0);

        ServerErrorKind::Throttled {
            retry_after: seconds_to_duration(seconds),
        }
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self.kind(), ServerErrorKind::Throttled { .. })
    }
}

fn seconds_to_duration(seconds: f64) -> Duration {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
}

/// A decoded and classified server response.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok,
    Results(ResultSet),
    Stats(DbStats),
    Error(ServerError),
}

impl Response {
    /// Classify one decoded frame.
    pub fn from_frame(frame: &str) -> WireResult<Self> {
        if frame == OK_TOKEN {
            return Ok(Response::Ok);
        }

        let (token, body) = split_header(frame)?;
        match token {
            OK_TOKEN => Ok(Response::Ok),
            RESULTS_TOKEN => serde_json::from_value(body)
                .map(Response::Results)
                .map_err(|e| body_error(token, e)),
            DBSTATS_TOKEN => serde_json::from_value(body)
                .map(Response::Stats)
                .map_err(|e| body_error(token, e)),
            ERROR_TOKEN => serde_json::from_value(body)
                .map(Response::Error)
                .map_err(|e| body_error(token, e)),
            other => Err(WireError::MalformedFrame(format!(
                "unknown response token '{}'",
                other
            ))),
        }
    }

    /// The header token this response was decoded from.
    pub fn token(&self) -> &'static str {
        match self {
            Response::Ok => OK_TOKEN,
            Response::Results(_) => RESULTS_TOKEN,
            Response::Stats(_) => DBSTATS_TOKEN,
            Response::Error(_) => ERROR_TOKEN,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error(_))
    }
}

fn body_error(token: &str, e: serde_json::Error) -> WireError {
    WireError::MalformedFrame(format!("unexpected '{}' body: {}", token, e))
}

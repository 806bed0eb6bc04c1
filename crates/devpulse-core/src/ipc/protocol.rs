//! Wire protocol for the daemon socket
//!
//! Each connection carries one JSON request object and at most one JSON
//! reply object. There is no length prefix: the reader consumes bytes until
//! exactly one complete JSON value has been seen.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on a single request
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Errors decoding a socket request
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("connection closed before a complete message")]
    Incomplete,

    #[error("message exceeds {0} bytes")]
    TooLarge(usize),

    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Request kinds accepted on the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Sync,
    Heartbeat,
    Status,
    CcInfo,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Sync => "sync",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Status => "status",
            MessageType::CcInfo => "cc_info",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sync" => Some(MessageType::Sync),
            "heartbeat" => Some(MessageType::Heartbeat),
            "status" => Some(MessageType::Status),
            "cc_info" => Some(MessageType::CcInfo),
            _ => None,
        }
    }
}

/// First decoding pass: the discriminator plus an untyped payload
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// `cc_info` request payload; both fields optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CcInfoRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

impl CcInfoRequest {
    /// Field-by-field decode; a missing or wrongly typed field is left unset
    /// so the request still gets a reply with defaults.
    pub fn from_payload(payload: &Value) -> Self {
        let field = |name: &str| {
            payload
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Self {
            time_range: field("timeRange"),
            working_directory: field("workingDirectory"),
        }
    }
}

/// A decoded socket request
#[derive(Debug, Clone, PartialEq)]
pub enum SocketMessage {
    /// Opaque sync payload, forwarded as-is
    Sync(Value),
    /// Heartbeat batch, decoded by the consumer
    Heartbeat(Value),
    Status,
    CcInfo(CcInfoRequest),
}

impl SocketMessage {
    /// Second decoding pass: route on `type`, then decode the payload.
    /// Unknown extra fields are ignored.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_value(value)?;
        let kind =
            MessageType::parse(&raw.kind).ok_or_else(|| ProtocolError::UnknownType(raw.kind))?;
        Ok(match kind {
            MessageType::Sync => SocketMessage::Sync(raw.payload),
            MessageType::Heartbeat => SocketMessage::Heartbeat(raw.payload),
            MessageType::Status => SocketMessage::Status,
            MessageType::CcInfo => {
                SocketMessage::CcInfo(CcInfoRequest::from_payload(&raw.payload))
            }
        })
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::from_value(serde_json::from_slice(bytes)?)
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            SocketMessage::Sync(_) => MessageType::Sync,
            SocketMessage::Heartbeat(_) => MessageType::Heartbeat,
            SocketMessage::Status => MessageType::Status,
            SocketMessage::CcInfo(_) => MessageType::CcInfo,
        }
    }
}

/// Build a request envelope
pub fn envelope(kind: MessageType, payload: Option<Value>) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("type".to_string(), Value::String(kind.as_str().to_string()));
    if let Some(payload) = payload {
        obj.insert("payload".to_string(), payload);
    }
    Value::Object(obj)
}

/// Reply to `status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub version: String,
    /// RFC3339
    pub started_at: String,
    pub uptime: String,
    /// Toolchain the daemon was built for
    pub go_version: String,
    /// `<os>/<arch>`
    pub platform: String,
}

/// Reply to `cc_info`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CcInfoResponse {
    pub total_cost_usd: f64,
    pub total_session_seconds: i64,
    pub time_range: String,
    /// RFC3339; the Unix epoch when never fetched
    pub cached_at: String,
    pub git_branch: String,
    pub git_dirty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub five_hour_utilization: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seven_day_utilization: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_login: Option<String>,
}

/// Synchronous reply to `heartbeat`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub status: String,
}

impl HeartbeatAck {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            status: "disabled".to_string(),
        }
    }
}

/// Toolchain identifier reported as `goVersion`
pub fn runtime_version() -> String {
    format!("rust{}", env!("CARGO_PKG_RUST_VERSION"))
}

/// `<os>/<arch>` of the running binary
pub fn platform() -> String {
    format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Format an uptime as `1d 1h 1m 5s`, dropping leading zero units
pub fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    let units = [(days, 'd'), (hours, 'h'), (minutes, 'm')];
    let mut parts: Vec<String> = units
        .iter()
        .skip_while(|(v, _)| *v == 0)
        .map(|(v, u)| format!("{}{}", v, u))
        .collect();
    parts.push(format!("{}s", seconds));
    parts.join(" ")
}

/// Encode a message as JSON followed by a newline
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut json = serde_json::to_vec(msg)?;
    json.push(b'\n');
    Ok(json)
}

/// Read exactly one JSON value from `reader`.
///
/// Bytes after the value are ignored. EOF before a complete value is
/// [`ProtocolError::Incomplete`]. Objects and arrays are delimited with
/// [`ValueScanner`] and parsed once; a bare scalar is parsed at EOF.
pub async fn read_json_value<R>(reader: &mut R) -> Result<Value, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    let mut scanner = ValueScanner::default();
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if scanner.is_scalar() {
                return try_parse_one(&buf)?.ok_or(ProtocolError::Incomplete);
            }
            return Err(ProtocolError::Incomplete);
        }
        buf.extend_from_slice(&chunk[..n]);

        match scanner.advance(&buf) {
            Scan::Complete(end) => return Ok(serde_json::from_slice(&buf[..end])?),
            Scan::Invalid => return Ok(serde_json::from_slice(&buf)?),
            Scan::Pending => {}
        }
        if buf.len() > MAX_MESSAGE_BYTES {
            return Err(ProtocolError::TooLarge(MAX_MESSAGE_BYTES));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    /// Need more bytes
    Pending,
    /// The top-level object or array ends before this offset
    Complete(usize),
    /// The first byte cannot start any JSON value
    Invalid,
}

/// Finds the end of the first top-level object or array, looking at every
/// byte once across successive reads. Bracket pairing is not checked; the
/// final parse rejects mismatches.
#[derive(Debug, Default)]
struct ValueScanner {
    offset: usize,
    first: Option<u8>,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl ValueScanner {
    fn is_container(&self) -> bool {
        matches!(self.first, Some(b'{' | b'['))
    }

    fn is_scalar(&self) -> bool {
        self.first.is_some() && !self.is_container()
    }

    /// Scan the bytes of `buf` not seen yet; `buf` only ever grows
    fn advance(&mut self, buf: &[u8]) -> Scan {
        while self.offset < buf.len() {
            let b = buf[self.offset];
            self.offset += 1;

            let Some(first) = self.first else {
                if b.is_ascii_whitespace() {
                    continue;
                }
                self.first = Some(b);
                match b {
                    b'{' | b'[' => {
                        self.depth = 1;
                        continue;
                    }
                    b'"' | b'-' | b'0'..=b'9' | b't' | b'f' | b'n' => return Scan::Pending,
                    _ => return Scan::Invalid,
                }
            };
            if first != b'{' && first != b'[' {
                // Scalars are left for the parse at EOF
                self.offset = buf.len();
                return Scan::Pending;
            }

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        return Scan::Complete(self.offset);
                    }
                }
                _ => {}
            }
        }
        Scan::Pending
    }
}

/// `Ok(None)` while the buffer holds only a prefix of a value
fn try_parse_one(buf: &[u8]) -> Result<Option<Value>, ProtocolError> {
    let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => Ok(Some(value)),
        Some(Err(e)) if e.is_eof() => Ok(None),
        Some(Err(e)) => Err(ProtocolError::Malformed(e)),
        None => Ok(None),
    }
}

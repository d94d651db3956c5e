//! Core protocol types: frames, commands and headers.

use std::fmt;

use bytes::Bytes;

/// Byte that terminates every frame on the wire.
pub const FRAME_TERMINATOR: u8 = 0;

/// Well-known header names.
pub mod header {
    // CONNECT
    pub const LOGIN: &str = "login";
    pub const PASSCODE: &str = "passcode";
    pub const CLIENT_ID: &str = "client-id";
    pub const REQUEST_ID: &str = "request-id";

    // any request
    pub const RECEIPT: &str = "receipt";

    // responses
    pub const SESSION: &str = "session";
    pub const RESPONSE_ID: &str = "response-id";
    pub const RECEIPT_ID: &str = "receipt-id";
    pub const ERROR_MESSAGE: &str = "message";

    // SEND / MESSAGE
    pub const DESTINATION: &str = "destination";
    pub const TRANSACTION: &str = "transaction";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const PERSISTENT: &str = "persistent";
    pub const PRIORITY: &str = "priority";
    pub const EXPIRATION_TIME: &str = "expiration-time";
    pub const CORRELATION_ID: &str = "correlation-id";
    pub const TYPE: &str = "type";
    pub const REPLY_TO: &str = "reply-to";
    pub const MESSAGE_ID: &str = "message-id";
    pub const REDELIVERED: &str = "redelivered";
    pub const TIMESTAMP: &str = "timestamp";
    pub const SUBSCRIPTION: &str = "subscription";

    // SUBSCRIBE / UNSUBSCRIBE
    pub const SELECTOR: &str = "selector";
    pub const ACK: &str = "ack";
    pub const ID: &str = "id";
    pub const NO_LOCAL: &str = "no-local";
    pub const DURABLE_SUBSCRIPTION_NAME: &str = "durable-subscription-name";
}

/// Frame action, decoded once by the codec.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Send,
    Subscribe,
    Unsubscribe,
    Begin,
    Commit,
    Abort,
    Ack,
    Disconnect,
    Connected,
    Message,
    Receipt,
    Error,
    /// Anything not in the dialect. Kept verbatim so the engine can report it.
    Other(String),
}

impl Command {
    pub fn parse(action: &str) -> Self {
        match action {
            "CONNECT" => Command::Connect,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "ACK" => Command::Ack,
            "DISCONNECT" => Command::Disconnect,
            "CONNECTED" => Command::Connected,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => Command::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Command::Connect => "CONNECT",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Ack => "ACK",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Other(action) => action,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered, case-sensitive header map.
///
/// Insertion order is preserved so that encoding is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Sets `key`, replacing an existing value in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Adds `key` only if it is not present yet. Returns whether it was added.
    pub fn insert_if_absent(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if self.contains(&key) {
            return false;
        }
        self.entries.push((key, value.into()));
        true
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{k}={v}")?;
        }
        f.write_str("}")
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// One protocol unit: action, headers and body.
///
/// `binary` records whether the body is length-delimited on the wire. The
/// `content-length` header itself never appears in `headers`; the codec
/// consumes it on decode and re-adds it on encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Headers,
    pub body: Bytes,
    pub binary: bool,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Headers::new(),
            body: Bytes::new(),
            binary: false,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Sets a text body, sent NUL-delimited.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.binary = false;
        self
    }

    /// Sets a binary body, sent with a `content-length` header.
    pub fn with_binary_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.binary = true;
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// The body as text, lossily decoded.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command)?;
        for (k, v) in self.headers.iter() {
            write!(f, " {k}:{v}")?;
        }
        write!(f, " ({} byte body)", self.body.len())
    }
}

/// Acknowledgement policy requested on SUBSCRIBE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    #[default]
    Auto,
    Client,
}

impl AckMode {
    /// Anything other than `client` means automatic acknowledgement.
    pub fn from_header(value: Option<&str>) -> Self {
        match value {
            Some("client") => AckMode::Client,
            _ => AckMode::Auto,
        }
    }
}

/// Lifecycle of a client connection as seen by the protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Unconnected,
    Connected,
    Closed,
}

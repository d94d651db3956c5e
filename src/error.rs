//! Error types for the gateway.
//!
//! Errors are split by who can recover from them:
//!
//! * [`FrameError`] is a malformed-but-resynchronisable frame. The codec hands
//!   it to the protocol engine as a value and the engine answers with an
//!   `ERROR` frame.
//! * [`ProtocolError`] is anything a command handler can fail with. It is
//!   always converted into an `ERROR` frame and never closes the connection.
//! * [`StompError`] is transport-level. The channel is unusable afterwards.
//! * [`BrokerError`] is whatever the messaging backend reports.

use std::io;

use thiserror::Error;

/// Transport-level failure. Terminates the connection it occurs on.
#[derive(Debug, Error)]
pub enum StompError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("stream ended in the middle of a frame")]
    FrameTruncated,

    #[error("frame of {size} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("cannot encode frame: {0}")]
    InvalidFrame(#[from] FrameError),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("connection has already been started")]
    AlreadyStarted,

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// A malformed frame that the decoder skipped over.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Format(String),
}

/// Failures raised while interpreting a command.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Not connected.")]
    NotConnected,

    #[error("Already connected.")]
    AlreadyConnected,

    #[error("Unknown STOMP action: {0}")]
    UnknownCommand(String),

    #[error("Illegal destination name: [{0}] -- destinations must begin with one of: /queue/ /topic/ /temp-queue/ /temp-topic/")]
    InvalidDestination(String),

    #[error("There already is a subscription for: {0}. Either use unique subscription IDs or do not create multiple subscriptions for the same destination")]
    DuplicateSubscription(String),

    #[error("Cannot unsubscribe as no subscription exists for id: {0}")]
    UnknownSubscription(String),

    #[error("The transaction was already started: {0}")]
    DuplicateTransaction(String),

    #[error("Invalid transaction id: {0}")]
    UnknownTransaction(String),

    #[error("No such message for message-id: {0}")]
    UnknownMessage(String),

    #[error("Missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid value for header {name}: {value}")]
    InvalidHeader { name: &'static str, value: String },

    #[error("Message body is not valid UTF-8 text")]
    InvalidText(#[source] std::string::FromUtf8Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Backend failure")]
    Broker(#[from] BrokerError),
}

/// Failures reported by a messaging backend.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("the backend object is closed")]
    Closed,

    #[error("invalid selector {selector:?}: {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("authentication failed for {0:?}")]
    Authentication(Option<String>),

    #[error("client id {0:?} is already in use")]
    ClientIdInUse(String),

    #[error("{0}")]
    Backend(String),
}

/// Rejected configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("unknown backend {0:?}; available backends: memory")]
    UnknownBackend(String),
}

pub type Result<T> = std::result::Result<T, StompError>;

//! Messaging backend abstraction.
//!
//! The gateway never stores or routes messages itself. Everything durable
//! happens behind these traits: a [`Broker`] hands out connections,
//! connections hand out sessions, and sessions create producers and
//! consumers. [`memory::MemoryBroker`] is the in-process implementation.

pub mod memory;
pub mod selector;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BrokerError;

pub use memory::MemoryBroker;

/// Priority used when a producer does not specify one.
pub const DEFAULT_PRIORITY: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    Queue,
    Topic,
    TempQueue,
    TempTopic,
}

impl DestinationKind {
    /// Name prefix used for this kind on the wire.
    pub fn prefix(self) -> &'static str {
        match self {
            DestinationKind::Queue => "/queue/",
            DestinationKind::Topic => "/topic/",
            DestinationKind::TempQueue => "/temp-queue/",
            DestinationKind::TempTopic => "/temp-topic/",
        }
    }

    pub fn is_topic(self) -> bool {
        matches!(self, DestinationKind::Topic | DestinationKind::TempTopic)
    }

    pub fn is_temporary(self) -> bool {
        matches!(self, DestinationKind::TempQueue | DestinationKind::TempTopic)
    }
}

/// A backend destination: a kind plus its physical name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub kind: DestinationKind,
    pub name: String,
}

impl Destination {
    pub fn new(kind: DestinationKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn queue(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::Queue, name)
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::Topic, name)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    Bytes(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    #[default]
    Persistent,
    NonPersistent,
}

/// A backend message.
///
/// `message_id`, `timestamp` and `expiration` are assigned by the backend on
/// send. `expiration` and `timestamp` are milliseconds since the Unix epoch;
/// an `expiration` of zero never expires.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_id: Option<String>,
    pub destination: Option<Destination>,
    pub body: MessageBody,
    pub properties: BTreeMap<String, String>,
    pub correlation_id: Option<String>,
    pub message_type: Option<String>,
    pub reply_to: Option<Destination>,
    pub delivery_mode: DeliveryMode,
    pub priority: u8,
    pub expiration: u64,
    pub timestamp: u64,
    pub redelivered: bool,
}

impl Message {
    pub fn new(body: MessageBody) -> Self {
        Self {
            message_id: None,
            destination: None,
            body,
            properties: BTreeMap::new(),
            correlation_id: None,
            message_type: None,
            reply_to: None,
            delivery_mode: DeliveryMode::default(),
            priority: DEFAULT_PRIORITY,
            expiration: 0,
            timestamp: 0,
            redelivered: false,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MessageBody::Text(text.into()))
    }

    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Self::new(MessageBody::Bytes(bytes.into()))
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expiration != 0 && self.expiration <= now_millis
    }
}

/// Per-send overrides, JMS style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub delivery_mode: DeliveryMode,
    pub priority: u8,
    /// `None` means the message never expires.
    pub time_to_live: Option<Duration>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::Persistent,
            priority: DEFAULT_PRIORITY,
            time_to_live: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    pub login: Option<String>,
    pub passcode: Option<String>,
    pub client_id: Option<String>,
}

/// Acknowledgement behaviour of a backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionMode {
    /// Deliveries are consumed as soon as they are handed out.
    Auto,
    /// Deliveries stay outstanding until acknowledged.
    Client,
    /// Sends and deliveries settle on commit.
    Transacted,
}

/// What a consumer listens to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub destination: Destination,
    pub selector: Option<String>,
    /// Topics only: skip messages published on the consumer's own connection.
    pub no_local: bool,
    /// Topics only: attach to (or create) a named durable subscription.
    pub durable_name: Option<String>,
}

impl ConsumerSpec {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            selector: None,
            no_local: false,
            durable_name: None,
        }
    }
}

/// Settles one delivery with the backend.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn acknowledge(&self) -> Result<(), BrokerError>;
}

/// A message handed to a consumer, together with the means to acknowledge it.
#[derive(Clone)]
pub struct Delivery {
    pub message: Message,
    acknowledger: Arc<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(message: Message, acknowledger: Arc<dyn Acknowledge>) -> Self {
        Self {
            message,
            acknowledger,
        }
    }

    pub async fn acknowledge(&self) -> Result<(), BrokerError> {
        self.acknowledger.acknowledge().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Entry point to a messaging backend.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn connect(&self, options: ConnectOptions)
        -> Result<Box<dyn BrokerConnection>, BrokerError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn client_id(&self) -> &str;

    async fn create_session(&self, mode: SessionMode)
        -> Result<Box<dyn BrokerSession>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerSession: Send + Sync {
    fn mode(&self) -> SessionMode;

    async fn create_producer(&self) -> Result<Box<dyn BrokerProducer>, BrokerError>;

    async fn create_consumer(&self, spec: ConsumerSpec)
        -> Result<Box<dyn BrokerConsumer>, BrokerError>;

    /// Creates a new temporary destination with a backend-assigned name.
    async fn create_temporary(&self, kind: DestinationKind) -> Result<Destination, BrokerError>;

    async fn commit(&self) -> Result<(), BrokerError>;

    async fn rollback(&self) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerProducer: Send + Sync {
    async fn send(
        &self,
        destination: &Destination,
        message: Message,
        options: SendOptions,
    ) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerConsumer: Send {
    /// Next delivery, or `None` once the consumer or its session is closed.
    async fn recv(&mut self) -> Option<Delivery>;

    async fn close(&mut self) -> Result<(), BrokerError>;
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

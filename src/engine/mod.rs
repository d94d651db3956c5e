//! The per-connection STOMP state machine.
//!
//! A [`ProtocolEngine`] sits behind every client connection. It turns
//! inbound frames into backend operations and writes responses, errors and
//! deliveries back through the connection's [`FrameSink`].
//!
//! Every command failure becomes a single `ERROR` frame and the connection
//! stays usable. Only a transport failure ends it.

pub mod session;
pub mod subscription;

use std::collections::HashMap;
use std::error::Error as _;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerConnection, ConnectOptions, ConsumerSpec, Delivery, SessionMode};
use crate::error::{BrokerError, ProtocolError, StompError};
use crate::frame::DecodedFrame;
use crate::tcp::{FrameHandler, FrameSink};
use crate::types::{header, AckMode, Command, ConnectionState, Frame};

pub use session::Session;
pub use subscription::Subscription;

/// Prefix of the subscription id derived from a destination when the client
/// gives none.
pub const AUTO_SUBSCRIPTION_PREFIX: &str = "/subscription-to/";

/// Client-ack deliveries awaiting an ACK, keyed by message id.
///
/// Shared between the engine and its subscriptions' delivery tasks.
#[derive(Clone, Default)]
pub struct PendingAcks {
    inner: Arc<Mutex<HashMap<String, Delivery>>>,
}

impl PendingAcks {
    /// Records a delivery under its message id, replacing any earlier entry.
    pub async fn register(&self, delivery: Delivery) {
        let Some(id) = delivery.message.message_id.clone() else {
            warn!("client-ack delivery without a message id cannot be acknowledged");
            return;
        };
        self.inner.lock().await.insert(id, delivery);
    }

    /// Removes and returns the delivery for `message_id`.
    pub async fn take(&self, message_id: &str) -> Option<Delivery> {
        self.inner.lock().await.remove(message_id)
    }

    /// Number of deliveries awaiting an ACK.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn clear(&self) {
        self.inner.lock().await.clear();
    }
}

struct SubscriptionEntry {
    subscription: Subscription,
    /// Transaction whose session the subscription was created on.
    transaction: Option<String>,
}

/// Per-connection STOMP state machine.
///
/// Runs on the connection's read-loop task: frames are handled one at a
/// time, and every failed command is answered with a single ERROR frame
/// without closing the connection.
pub struct ProtocolEngine {
    broker: Arc<dyn Broker>,
    sink: FrameSink,
    state: ConnectionState,
    connection: Option<Box<dyn BrokerConnection>>,
    default_session: Option<Arc<Session>>,
    client_ack_session: Option<Arc<Session>>,
    transactions: HashMap<String, Arc<Session>>,
    subscriptions: HashMap<String, SubscriptionEntry>,
    pending_acks: PendingAcks,
}

impl ProtocolEngine {
    /// Creates an unconnected engine answering through `sink`. The backend
    /// connection is opened by CONNECT.
    pub fn new(broker: Arc<dyn Broker>, sink: FrameSink) -> Self {
        Self {
            broker,
            sink,
            state: ConnectionState::Unconnected,
            connection: None,
            default_session: None,
            client_ack_session: None,
            transactions: HashMap::new(),
            subscriptions: HashMap::new(),
            pending_acks: PendingAcks::default(),
        }
    }

    /// Current protocol state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Client-ack deliveries the client has not acknowledged yet.
    pub fn pending_acks(&self) -> &PendingAcks {
        &self.pending_acks
    }

    /// Processes one inbound frame, answering failures with an ERROR frame.
    pub async fn handle(&mut self, frame: DecodedFrame) {
        let (receipt, result) = match frame {
            Ok(frame) => {
                let receipt = frame.header(header::RECEIPT).map(str::to_string);
                (receipt, self.dispatch(frame).await)
            }
            Err(e) => (None, Err(ProtocolError::from(e))),
        };

        match result {
            Ok(Some(response)) => self.reply(response).await,
            Ok(None) => {}
            Err(e) => {
                debug!("command failed on {}: {}", self.sink.peer(), e);
                self.reply(error_frame(&e, receipt.as_deref())).await;
            }
        }
    }

    /// Runs one command. Returns the frame to answer with, if any.
    async fn dispatch(&mut self, frame: Frame) -> Result<Option<Frame>, ProtocolError> {
        let receipt = frame.header(header::RECEIPT).map(str::to_string);
        match frame.command.clone() {
            Command::Connect => return self.on_connect(frame, receipt).await.map(Some),
            Command::Send => self.on_send(frame).await?,
            Command::Subscribe => self.on_subscribe(frame).await?,
            Command::Unsubscribe => self.on_unsubscribe(frame).await?,
            Command::Begin => self.on_begin(frame).await?,
            Command::Commit => self.on_commit(frame).await?,
            Command::Abort => self.on_abort(frame).await?,
            Command::Ack => self.on_ack(frame).await?,
            Command::Disconnect => self.on_disconnect().await?,
            other => return Err(ProtocolError::UnknownCommand(other.as_str().to_string())),
        }
        Ok(receipt.map(|id| Frame::new(Command::Receipt).with_header(header::RECEIPT_ID, id)))
    }

    async fn on_connect(
        &mut self,
        frame: Frame,
        receipt: Option<String>,
    ) -> Result<Frame, ProtocolError> {
        if self.state == ConnectionState::Connected {
            return Err(ProtocolError::AlreadyConnected);
        }
        let options = ConnectOptions {
            login: frame.header(header::LOGIN).map(str::to_string),
            passcode: frame.header(header::PASSCODE).map(str::to_string),
            client_id: frame.header(header::CLIENT_ID).map(str::to_string),
        };
        let connection = self.broker.connect(options).await?;
        info!(
            "client {} connected from {}",
            connection.client_id(),
            self.sink.peer()
        );

        let mut response =
            Frame::new(Command::Connected).with_header(header::SESSION, connection.client_id());
        if let Some(id) = frame.header(header::REQUEST_ID).map(str::to_string).or(receipt) {
            response.headers.insert(header::RESPONSE_ID, id.as_str());
            response.headers.insert(header::RECEIPT_ID, id);
        }
        self.connection = Some(connection);
        self.state = ConnectionState::Connected;
        Ok(response)
    }

    async fn on_send(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        self.check_connected()?;
        let session = match frame.header(header::TRANSACTION) {
            Some(tx) => self.transaction(tx)?,
            None => self.shared_session(SessionMode::Auto).await?,
        };
        session.send(frame).await
    }

    async fn on_subscribe(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        self.check_connected()?;
        let transaction = frame.header(header::TRANSACTION).map(str::to_string);
        let session = match &transaction {
            Some(tx) => self.transaction(tx)?,
            None => match AckMode::from_header(frame.header(header::ACK)) {
                AckMode::Client => self.shared_session(SessionMode::Client).await?,
                AckMode::Auto => self.shared_session(SessionMode::Auto).await?,
            },
        };

        let name = frame
            .header(header::DESTINATION)
            .ok_or(ProtocolError::MissingHeader(header::DESTINATION))?;
        let id = subscription_id(&frame, name);
        if self.subscriptions.contains_key(&id) {
            return Err(ProtocolError::DuplicateSubscription(id));
        }
        let destination = session.resolve_destination(name).await?;

        let topic = destination.kind.is_topic();
        let spec = ConsumerSpec {
            destination: destination.clone(),
            selector: frame
                .header(header::SELECTOR)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            no_local: topic
                && frame
                    .header(header::NO_LOCAL)
                    .is_some_and(|v| v.eq_ignore_ascii_case("true")),
            durable_name: frame
                .header(header::DURABLE_SUBSCRIPTION_NAME)
                .filter(|_| topic)
                .map(str::to_string),
        };
        let consumer = session.backend().create_consumer(spec).await?;
        let pending = (session.mode() == SessionMode::Client).then(|| self.pending_acks.clone());

        debug!("subscription {} to {} created", id, destination);
        let subscription =
            Subscription::start(id.clone(), destination, consumer, self.sink.clone(), pending);
        self.subscriptions.insert(
            id,
            SubscriptionEntry {
                subscription,
                transaction,
            },
        );
        Ok(())
    }

    async fn on_unsubscribe(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        self.check_connected()?;
        let id = match (frame.header(header::ID), frame.header(header::DESTINATION)) {
            (Some(id), _) => id.to_string(),
            (None, Some(name)) => format!("{AUTO_SUBSCRIPTION_PREFIX}{name}"),
            (None, None) => return Err(ProtocolError::MissingHeader(header::ID)),
        };
        let entry = self
            .subscriptions
            .remove(&id)
            .ok_or(ProtocolError::UnknownSubscription(id))?;
        debug!(
            "closing subscription {} to {}",
            entry.subscription.id(),
            entry.subscription.destination()
        );
        entry.subscription.close().await?;
        Ok(())
    }

    async fn on_begin(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        self.check_connected()?;
        let tx = required(&frame, header::TRANSACTION)?;
        if self.transactions.contains_key(tx) {
            return Err(ProtocolError::DuplicateTransaction(tx.to_string()));
        }
        let session = self.open_session(SessionMode::Transacted).await?;
        self.transactions.insert(tx.to_string(), Arc::new(session));
        debug!("transaction {} started", tx);
        Ok(())
    }

    async fn on_commit(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        self.check_connected()?;
        let tx = required(&frame, header::TRANSACTION)?;
        let session = self.end_transaction(tx).await?;
        let committed = session.backend().commit().await;
        let closed = session.backend().close().await;
        committed?;
        closed?;
        debug!("transaction {} committed", tx);
        Ok(())
    }

    async fn on_abort(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        self.check_connected()?;
        let tx = required(&frame, header::TRANSACTION)?;
        let session = self.end_transaction(tx).await?;
        let rolled_back = session.backend().rollback().await;
        let closed = session.backend().close().await;
        rolled_back?;
        closed?;
        debug!("transaction {} aborted", tx);
        Ok(())
    }

    async fn on_ack(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        self.check_connected()?;
        let message_id = required(&frame, header::MESSAGE_ID)?;
        let delivery = self
            .pending_acks
            .take(message_id)
            .await
            .ok_or_else(|| ProtocolError::UnknownMessage(message_id.to_string()))?;
        delivery.acknowledge().await?;
        Ok(())
    }

    async fn on_disconnect(&mut self) -> Result<(), ProtocolError> {
        self.check_connected()?;
        let result = self.close().await;
        self.state = ConnectionState::Unconnected;
        info!("client on {} disconnected", self.sink.peer());
        result
    }

    /// Releases every backend resource held for this connection.
    ///
    /// Safe to call repeatedly. Keeps going past individual failures and
    /// returns the first one.
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        let mut first: Option<BrokerError> = None;
        let mut keep_first = |result: Result<(), BrokerError>| {
            if let Err(e) = result {
                warn!("error while closing connection state: {}", e);
                first.get_or_insert(e);
            }
        };

        for (_, entry) in self.subscriptions.drain() {
            keep_first(entry.subscription.close().await);
        }
        let sessions = self
            .default_session
            .take()
            .into_iter()
            .chain(self.client_ack_session.take())
            .chain(self.transactions.drain().map(|(_, session)| session));
        for session in sessions {
            keep_first(session.backend().close().await);
        }
        if let Some(connection) = self.connection.take() {
            keep_first(connection.close().await);
        }
        self.pending_acks.clear().await;

        match first {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn check_connected(&self) -> Result<(), ProtocolError> {
        match self.state {
            ConnectionState::Connected => Ok(()),
            _ => Err(ProtocolError::NotConnected),
        }
    }

    fn transaction(&self, tx: &str) -> Result<Arc<Session>, ProtocolError> {
        self.transactions
            .get(tx)
            .cloned()
            .ok_or_else(|| ProtocolError::UnknownTransaction(tx.to_string()))
    }

    /// Removes a transaction and closes the subscriptions created on it.
    async fn end_transaction(&mut self, tx: &str) -> Result<Arc<Session>, ProtocolError> {
        let session = self
            .transactions
            .remove(tx)
            .ok_or_else(|| ProtocolError::UnknownTransaction(tx.to_string()))?;
        let bound: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|(_, entry)| entry.transaction.as_deref() == Some(tx))
            .map(|(id, _)| id.clone())
            .collect();
        for id in bound {
            if let Some(entry) = self.subscriptions.remove(&id) {
                if let Err(e) = entry.subscription.close().await {
                    warn!("closing subscription {} of transaction {}: {}", id, tx, e);
                }
            }
        }
        Ok(session)
    }

    /// The connection-wide auto-ack or client-ack session, created on first use.
    async fn shared_session(&mut self, mode: SessionMode) -> Result<Arc<Session>, ProtocolError> {
        let existing = match mode {
            SessionMode::Client => self.client_ack_session.clone(),
            _ => self.default_session.clone(),
        };
        if let Some(session) = existing {
            return Ok(session);
        }
        let session = Arc::new(self.open_session(mode).await?);
        match mode {
            SessionMode::Client => self.client_ack_session = Some(session.clone()),
            _ => self.default_session = Some(session.clone()),
        }
        Ok(session)
    }

    async fn open_session(&self, mode: SessionMode) -> Result<Session, ProtocolError> {
        let connection = self
            .connection
            .as_ref()
            .ok_or(ProtocolError::NotConnected)?;
        Ok(Session::new(connection.create_session(mode).await?))
    }

    async fn reply(&self, frame: Frame) {
        if let Err(e) = self.sink.send(frame).await {
            warn!("could not send response to {}: {}", self.sink.peer(), e);
        }
    }
}

#[async_trait]
impl FrameHandler for ProtocolEngine {
    async fn on_frame(&mut self, frame: DecodedFrame) {
        self.handle(frame).await;
    }

    async fn on_error(&mut self, error: StompError) {
        info!("connection {} ended: {}", self.sink.peer(), error);
        self.state = ConnectionState::Closed;
        if let Err(e) = self.close().await {
            warn!("cleanup after {} failed: {}", self.sink.peer(), e);
        }
    }

    async fn on_stop(&mut self) {
        self.state = ConnectionState::Closed;
        if let Err(e) = self.close().await {
            warn!("cleanup after stopping {} failed: {}", self.sink.peer(), e);
        }
    }
}

fn required<'a>(frame: &'a Frame, name: &'static str) -> Result<&'a str, ProtocolError> {
    frame.header(name).ok_or(ProtocolError::MissingHeader(name))
}

fn subscription_id(frame: &Frame, destination: &str) -> String {
    match frame.header(header::ID) {
        Some(id) => id.to_string(),
        None => format!("{AUTO_SUBSCRIPTION_PREFIX}{destination}"),
    }
}

/// Builds the ERROR frame reporting `error`.
///
/// The `message` header carries the whole cause chain on one line; the body
/// repeats it with one `caused by:` line per cause.
pub fn error_frame(error: &ProtocolError, receipt: Option<&str>) -> Frame {
    let mut summary = error.to_string();
    let mut body = summary.clone();
    let mut source = error.source();
    while let Some(cause) = source {
        summary.push_str(": ");
        summary.push_str(&cause.to_string());
        body.push_str("\ncaused by: ");
        body.push_str(&cause.to_string());
        source = cause.source();
    }
    body.push('\n');

    let summary: String = summary
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    let mut frame = Frame::new(Command::Error).with_header(header::ERROR_MESSAGE, summary);
    if let Some(receipt) = receipt {
        frame.headers.insert(header::RECEIPT_ID, receipt);
    }
    frame.with_body(body)
}

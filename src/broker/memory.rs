//! In-process message broker.
//!
//! All state lives behind one lock. Queues buffer until a matching consumer
//! exists and hand messages out round-robin; topics fan out to whoever is
//! subscribed at publish time. Consumers receive over unbounded channels, so
//! a slow subscriber never blocks a publisher.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use super::selector::Selector;
use super::{
    now_millis, Acknowledge, Broker, BrokerConnection, BrokerConsumer, BrokerProducer,
    BrokerSession, ConnectOptions, ConsumerSpec, Delivery, Destination, DestinationKind, Message,
    SendOptions, SessionMode,
};
use crate::error::BrokerError;

/// A broker that keeps everything in memory. Cloning shares the broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    /// login -> passcode. `None` accepts any credentials.
    users: Option<HashMap<String, String>>,
}

/// (client id, durable subscription name)
type DurableKey = (String, String);

#[derive(Default)]
struct State {
    queues: HashMap<Destination, QueueState>,
    topics: HashMap<Destination, Vec<ConsumerSlot>>,
    durables: HashMap<DurableKey, DurableState>,
    sessions: HashMap<u64, SessionState>,
    temporaries: HashMap<String, Vec<Destination>>,
    client_ids: HashSet<String>,
    next_id: u64,
}

#[derive(Clone)]
struct Envelope {
    message: Message,
    /// Connection that published the message.
    publisher: String,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Envelope>,
    consumers: Vec<ConsumerSlot>,
    next: usize,
}

struct DurableState {
    topic: Destination,
    selector: Option<Selector>,
    pending: VecDeque<Envelope>,
    consumer: Option<ConsumerSlot>,
}

struct ConsumerSlot {
    id: u64,
    session_id: u64,
    connection_id: String,
    selector: Option<Selector>,
    no_local: bool,
    tx: mpsc::UnboundedSender<Handoff>,
}

impl ConsumerSlot {
    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    fn accepts(&self, envelope: &Envelope, topic: bool) -> bool {
        if topic && self.no_local && envelope.publisher == self.connection_id {
            return false;
        }
        self.selector
            .as_ref()
            .map_or(true, |s| s.matches(&envelope.message))
    }
}

struct SessionState {
    mode: SessionMode,
    /// Delivered but not yet settled. Empty for auto-ack sessions.
    outstanding: Vec<Outstanding>,
    /// Sends buffered until commit. Transacted sessions only.
    sends: Vec<(Destination, Envelope)>,
    consumers: Vec<u64>,
}

struct Outstanding {
    token: u64,
    envelope: Envelope,
    origin: Origin,
}

/// Where a delivered message goes back to if it is not settled.
#[derive(Clone, PartialEq, Eq, Hash)]
enum Origin {
    Queue(Destination),
    Durable(DurableKey),
    /// Plain topic deliveries are not retained.
    Topic,
}

/// What travels down a consumer channel.
struct Handoff {
    delivery: Delivery,
    token: Option<u64>,
    envelope: Envelope,
    origin: Origin,
}

enum Target {
    Queue(Destination),
    Topic(Destination),
    Durable(DurableKey),
}

struct Dispatch<'a> {
    inner: &'a Weak<Inner>,
    sessions: &'a mut HashMap<u64, SessionState>,
    next_id: &'a mut u64,
    now: u64,
}

impl Dispatch<'_> {
    fn token(&mut self) -> u64 {
        *self.next_id += 1;
        *self.next_id
    }

    /// Hand an envelope to one consumer. Gives it back if the consumer is gone.
    fn deliver(
        &mut self,
        slot: &ConsumerSlot,
        envelope: Envelope,
        origin: Origin,
    ) -> Result<(), Envelope> {
        let Some(mode) = self.sessions.get(&slot.session_id).map(|s| s.mode) else {
            return Err(envelope);
        };
        let (token, acknowledger): (Option<u64>, Arc<dyn Acknowledge>) = match mode {
            SessionMode::Auto => (None, Arc::new(AutoAck)),
            SessionMode::Client | SessionMode::Transacted => {
                let token = self.token();
                let ack = MemoryAck {
                    inner: self.inner.clone(),
                    session_id: slot.session_id,
                    token,
                };
                (Some(token), Arc::new(ack))
            }
        };
        let handoff = Handoff {
            delivery: Delivery::new(envelope.message.clone(), acknowledger),
            token,
            envelope: envelope.clone(),
            origin: origin.clone(),
        };
        if slot.tx.send(handoff).is_err() {
            return Err(envelope);
        }
        if let (Some(token), Some(session)) = (token, self.sessions.get_mut(&slot.session_id)) {
            session.outstanding.push(Outstanding {
                token,
                envelope,
                origin,
            });
        }
        Ok(())
    }

    fn drain_queue(&mut self, destination: &Destination, queue: &mut QueueState) {
        queue.consumers.retain(ConsumerSlot::is_open);
        let mut kept = VecDeque::new();
        while let Some(envelope) = queue.pending.pop_front() {
            if envelope.message.is_expired(self.now) {
                debug!("dropping expired message on {}", destination);
                continue;
            }
            if let Err(envelope) = self.offer(destination, queue, envelope) {
                kept.push_back(envelope);
            }
        }
        queue.pending = kept;
    }

    fn offer(
        &mut self,
        destination: &Destination,
        queue: &mut QueueState,
        mut envelope: Envelope,
    ) -> Result<(), Envelope> {
        let count = queue.consumers.len();
        for step in 0..count {
            let index = (queue.next + step) % count;
            let slot = &queue.consumers[index];
            if !slot.accepts(&envelope, false) {
                continue;
            }
            match self.deliver(slot, envelope, Origin::Queue(destination.clone())) {
                Ok(()) => {
                    queue.next = (index + 1) % count;
                    return Ok(());
                }
                Err(returned) => envelope = returned,
            }
        }
        Err(envelope)
    }

    fn drain_durable(&mut self, key: &DurableKey, durable: &mut DurableState) {
        while let Some(envelope) = durable.pending.pop_front() {
            if envelope.message.is_expired(self.now) {
                continue;
            }
            let Some(slot) = durable.consumer.as_ref().filter(|s| s.is_open()) else {
                durable.pending.push_front(envelope);
                break;
            };
            if !slot.accepts(&envelope, true) {
                continue;
            }
            if let Err(envelope) = self.deliver(slot, envelope, Origin::Durable(key.clone())) {
                durable.pending.push_front(envelope);
                break;
            }
        }
    }
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn publish(&mut self, inner: &Weak<Inner>, destination: Destination, envelope: Envelope) {
        let State {
            queues,
            topics,
            durables,
            sessions,
            next_id,
            ..
        } = self;
        let mut dispatch = Dispatch {
            inner,
            sessions,
            next_id,
            now: now_millis(),
        };

        if envelope.message.is_expired(dispatch.now) {
            debug!("dropping message that expired before dispatch to {}", destination);
            return;
        }

        if destination.kind.is_topic() {
            if let Some(consumers) = topics.get_mut(&destination) {
                consumers.retain(ConsumerSlot::is_open);
                for slot in consumers.iter().filter(|s| s.accepts(&envelope, true)) {
                    let _ = dispatch.deliver(slot, envelope.clone(), Origin::Topic);
                }
            }
            for (key, durable) in durables.iter_mut() {
                if durable.topic != destination {
                    continue;
                }
                let wanted = durable
                    .selector
                    .as_ref()
                    .map_or(true, |s| s.matches(&envelope.message));
                if wanted {
                    durable.pending.push_back(envelope.clone());
                    dispatch.drain_durable(key, durable);
                }
            }
        } else {
            let queue = queues.entry(destination.clone()).or_default();
            queue.pending.push_back(envelope);
            dispatch.drain_queue(&destination, queue);
        }
    }

    /// Put unsettled messages back where they came from, oldest first.
    fn restore(&mut self, inner: &Weak<Inner>, items: Vec<(Envelope, Origin)>, redelivered: bool) {
        let mut touched = HashSet::new();
        for (mut envelope, origin) in items.into_iter().rev() {
            envelope.message.redelivered |= redelivered;
            match &origin {
                Origin::Queue(destination) => self
                    .queues
                    .entry(destination.clone())
                    .or_default()
                    .pending
                    .push_front(envelope),
                Origin::Durable(key) => match self.durables.get_mut(key) {
                    Some(durable) => durable.pending.push_front(envelope),
                    None => continue,
                },
                Origin::Topic => continue,
            }
            touched.insert(origin);
        }

        let State {
            queues,
            durables,
            sessions,
            next_id,
            ..
        } = self;
        let mut dispatch = Dispatch {
            inner,
            sessions,
            next_id,
            now: now_millis(),
        };
        for origin in touched {
            match origin {
                Origin::Queue(destination) => {
                    if let Some(queue) = queues.get_mut(&destination) {
                        dispatch.drain_queue(&destination, queue);
                    }
                }
                Origin::Durable(key) => {
                    if let Some(durable) = durables.get_mut(&key) {
                        dispatch.drain_durable(&key, durable);
                    }
                }
                Origin::Topic => {}
            }
        }
    }

    fn remove_consumer(&mut self, id: u64) {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.id != id);
        }
        for consumers in self.topics.values_mut() {
            consumers.retain(|c| c.id != id);
        }
        for durable in self.durables.values_mut() {
            if durable.consumer.as_ref().is_some_and(|c| c.id == id) {
                durable.consumer = None;
            }
        }
    }

    fn close_session(&mut self, inner: &Weak<Inner>, session_id: u64) {
        let Some(session) = self.sessions.remove(&session_id) else {
            return;
        };
        for id in &session.consumers {
            self.remove_consumer(*id);
        }
        if !session.sends.is_empty() {
            debug!(
                "discarding {} uncommitted sends from closed session {}",
                session.sends.len(),
                session_id
            );
        }
        let unsettled = session
            .outstanding
            .into_iter()
            .map(|o| (o.envelope, o.origin))
            .collect();
        self.restore(inner, unsettled, true);
    }
}

impl MemoryBroker {
    /// An empty broker that accepts any credentials.
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that only accepts the given login/passcode pairs.
    pub fn with_users<I, L, P>(users: I) -> Self
    where
        I: IntoIterator<Item = (L, P)>,
        L: Into<String>,
        P: Into<String>,
    {
        let users = users
            .into_iter()
            .map(|(l, p)| (l.into(), p.into()))
            .collect();
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                users: Some(users),
            }),
        }
    }

    /// Number of messages waiting on a queue with no consumer to take them.
    pub async fn queue_depth(&self, destination: &Destination) -> usize {
        let state = self.inner.state.lock().await;
        state
            .queues
            .get(destination)
            .map_or(0, |q| q.pending.len())
    }

    fn authenticate(&self, options: &ConnectOptions) -> Result<(), BrokerError> {
        let Some(users) = &self.inner.users else {
            return Ok(());
        };
        let accepted = match (&options.login, &options.passcode) {
            (Some(login), passcode) => users
                .get(login)
                .is_some_and(|expected| Some(expected) == passcode.as_ref()),
            (None, _) => false,
        };
        if accepted {
            Ok(())
        } else {
            Err(BrokerError::Authentication(options.login.clone()))
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(
        &self,
        options: ConnectOptions,
    ) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        self.authenticate(&options)?;

        let connection_id = Uuid::new_v4().to_string();
        let client_id = options
            .client_id
            .clone()
            .unwrap_or_else(|| format!("ID:{connection_id}"));

        let mut state = self.inner.state.lock().await;
        if !state.client_ids.insert(client_id.clone()) {
            return Err(BrokerError::ClientIdInUse(client_id));
        }
        drop(state);

        info!("memory broker: connection {} opened for {}", connection_id, client_id);
        Ok(Box::new(MemoryConnection {
            inner: self.inner.clone(),
            connection_id,
            client_id,
            sequence: Arc::new(AtomicU64::new(0)),
            sessions: Mutex::new(Some(Vec::new())),
        }))
    }
}

struct MemoryConnection {
    inner: Arc<Inner>,
    connection_id: String,
    client_id: String,
    sequence: Arc<AtomicU64>,
    /// `None` once closed.
    sessions: Mutex<Option<Vec<u64>>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn create_session(
        &self,
        mode: SessionMode,
    ) -> Result<Box<dyn BrokerSession>, BrokerError> {
        let mut sessions = self.sessions.lock().await;
        let sessions = sessions.as_mut().ok_or(BrokerError::Closed)?;

        let mut state = self.inner.state.lock().await;
        let session_id = state.next_id();
        state.sessions.insert(
            session_id,
            SessionState {
                mode,
                outstanding: Vec::new(),
                sends: Vec::new(),
                consumers: Vec::new(),
            },
        );
        sessions.push(session_id);

        Ok(Box::new(MemorySession {
            inner: self.inner.clone(),
            session_id,
            mode,
            connection_id: self.connection_id.clone(),
            client_id: self.client_id.clone(),
            sequence: self.sequence.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let Some(session_ids) = self.sessions.lock().await.take() else {
            return Ok(());
        };
        let weak = Arc::downgrade(&self.inner);
        let mut state = self.inner.state.lock().await;
        for session_id in session_ids {
            state.close_session(&weak, session_id);
        }
        let temporaries = state
            .temporaries
            .remove(&self.connection_id)
            .unwrap_or_default();
        for destination in temporaries {
            state.queues.remove(&destination);
            state.topics.remove(&destination);
        }
        state.client_ids.remove(&self.client_id);
        info!("memory broker: connection {} closed", self.connection_id);
        Ok(())
    }
}

struct MemorySession {
    inner: Arc<Inner>,
    session_id: u64,
    mode: SessionMode,
    connection_id: String,
    client_id: String,
    sequence: Arc<AtomicU64>,
}

#[async_trait]
impl BrokerSession for MemorySession {
    fn mode(&self) -> SessionMode {
        self.mode
    }

    async fn create_producer(&self) -> Result<Box<dyn BrokerProducer>, BrokerError> {
        let state = self.inner.state.lock().await;
        if !state.sessions.contains_key(&self.session_id) {
            return Err(BrokerError::Closed);
        }
        Ok(Box::new(MemoryProducer {
            inner: self.inner.clone(),
            session_id: self.session_id,
            connection_id: self.connection_id.clone(),
            sequence: self.sequence.clone(),
        }))
    }

    async fn create_consumer(
        &self,
        spec: ConsumerSpec,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        let selector = spec
            .selector
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Selector::parse)
            .transpose()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let weak = Arc::downgrade(&self.inner);

        let mut guard = self.inner.state.lock().await;
        if !guard.sessions.contains_key(&self.session_id) {
            return Err(BrokerError::Closed);
        }
        let id = guard.next_id();
        let slot = ConsumerSlot {
            id,
            session_id: self.session_id,
            connection_id: self.connection_id.clone(),
            selector: selector.clone(),
            no_local: spec.no_local,
            tx,
        };

        let State {
            queues,
            topics,
            durables,
            sessions,
            next_id,
            ..
        } = &mut *guard;
        let mut dispatch = Dispatch {
            inner: &weak,
            sessions,
            next_id,
            now: now_millis(),
        };
        let destination = spec.destination;
        let target = match spec.durable_name {
            Some(name) if destination.kind.is_topic() => {
                let key = (self.client_id.clone(), name);
                let durable = durables.entry(key.clone()).or_insert_with(|| DurableState {
                    topic: destination.clone(),
                    selector: selector.clone(),
                    pending: VecDeque::new(),
                    consumer: None,
                });
                if durable.consumer.as_ref().is_some_and(ConsumerSlot::is_open) {
                    return Err(BrokerError::Backend(format!(
                        "durable subscription {} already has an active consumer",
                        key.1
                    )));
                }
                if durable.topic != destination || durable.selector != selector {
                    // A changed subscription starts over.
                    durable.topic = destination.clone();
                    durable.selector = selector.clone();
                    durable.pending.clear();
                }
                durable.consumer = Some(slot);
                dispatch.drain_durable(&key, durable);
                Target::Durable(key)
            }
            _ if destination.kind.is_topic() => {
                topics.entry(destination.clone()).or_default().push(slot);
                Target::Topic(destination)
            }
            _ => {
                let queue = queues.entry(destination.clone()).or_default();
                queue.consumers.push(slot);
                dispatch.drain_queue(&destination, queue);
                Target::Queue(destination)
            }
        };
        if let Some(session) = guard.sessions.get_mut(&self.session_id) {
            session.consumers.push(id);
        }

        Ok(Box::new(MemoryConsumer {
            inner: self.inner.clone(),
            id,
            session_id: self.session_id,
            target,
            rx,
            closed: false,
        }))
    }

    async fn create_temporary(&self, kind: DestinationKind) -> Result<Destination, BrokerError> {
        if !kind.is_temporary() {
            return Err(BrokerError::InvalidDestination(format!(
                "{} is not a temporary destination kind",
                kind.prefix()
            )));
        }
        let mut state = self.inner.state.lock().await;
        if !state.sessions.contains_key(&self.session_id) {
            return Err(BrokerError::Closed);
        }
        let id = state.next_id();
        let prefix: String = self.connection_id.chars().take(8).collect();
        let destination = Destination::new(kind, format!("{prefix}-{id}"));
        if !kind.is_topic() {
            state.queues.entry(destination.clone()).or_default();
        }
        state
            .temporaries
            .entry(self.connection_id.clone())
            .or_default()
            .push(destination.clone());
        Ok(destination)
    }

    async fn commit(&self) -> Result<(), BrokerError> {
        let weak = Arc::downgrade(&self.inner);
        let mut state = self.inner.state.lock().await;
        let session = state
            .sessions
            .get_mut(&self.session_id)
            .ok_or(BrokerError::Closed)?;
        if session.mode != SessionMode::Transacted {
            return Err(BrokerError::Backend("session is not transacted".to_string()));
        }
        let sends = std::mem::take(&mut session.sends);
        session.outstanding.clear();
        debug!("session {} committing {} sends", self.session_id, sends.len());
        for (destination, envelope) in sends {
            state.publish(&weak, destination, envelope);
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), BrokerError> {
        let weak = Arc::downgrade(&self.inner);
        let mut state = self.inner.state.lock().await;
        let session = state
            .sessions
            .get_mut(&self.session_id)
            .ok_or(BrokerError::Closed)?;
        if session.mode != SessionMode::Transacted {
            return Err(BrokerError::Backend("session is not transacted".to_string()));
        }
        let discarded = std::mem::take(&mut session.sends).len();
        let unsettled = std::mem::take(&mut session.outstanding)
            .into_iter()
            .map(|o| (o.envelope, o.origin))
            .collect();
        debug!("session {} rolled back {} sends", self.session_id, discarded);
        state.restore(&weak, unsettled, true);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let weak = Arc::downgrade(&self.inner);
        let mut state = self.inner.state.lock().await;
        state.close_session(&weak, self.session_id);
        Ok(())
    }
}

struct MemoryProducer {
    inner: Arc<Inner>,
    session_id: u64,
    connection_id: String,
    sequence: Arc<AtomicU64>,
}

#[async_trait]
impl BrokerProducer for MemoryProducer {
    async fn send(
        &self,
        destination: &Destination,
        mut message: Message,
        options: SendOptions,
    ) -> Result<(), BrokerError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let now = now_millis();
        message.message_id = Some(format!("ID:{}:{}", self.connection_id, sequence));
        message.destination = Some(destination.clone());
        message.delivery_mode = options.delivery_mode;
        message.priority = options.priority;
        message.timestamp = now;
        message.expiration = options
            .time_to_live
            .map_or(0, |ttl| now.saturating_add(ttl.as_millis() as u64));
        message.redelivered = false;

        let envelope = Envelope {
            message,
            publisher: self.connection_id.clone(),
        };
        let weak = Arc::downgrade(&self.inner);
        let mut state = self.inner.state.lock().await;
        let session = state
            .sessions
            .get_mut(&self.session_id)
            .ok_or(BrokerError::Closed)?;
        if session.mode == SessionMode::Transacted {
            session.sends.push((destination.clone(), envelope));
        } else {
            state.publish(&weak, destination.clone(), envelope);
        }
        Ok(())
    }
}

struct MemoryConsumer {
    inner: Arc<Inner>,
    id: u64,
    session_id: u64,
    target: Target,
    rx: mpsc::UnboundedReceiver<Handoff>,
    closed: bool,
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await.map(|handoff| handoff.delivery)
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let weak = Arc::downgrade(&self.inner);
        let mut state = self.inner.state.lock().await;
        match &self.target {
            Target::Queue(destination) => {
                if let Some(queue) = state.queues.get_mut(destination) {
                    queue.consumers.retain(|c| c.id != self.id);
                }
            }
            Target::Topic(destination) => {
                if let Some(consumers) = state.topics.get_mut(destination) {
                    consumers.retain(|c| c.id != self.id);
                }
            }
            Target::Durable(key) => {
                if let Some(durable) = state.durables.get_mut(key) {
                    durable.consumer = None;
                }
            }
        }

        // Anything still sitting in the channel was never seen by the client.
        self.rx.close();
        let mut unseen = Vec::new();
        while let Ok(handoff) = self.rx.try_recv() {
            unseen.push(handoff);
        }
        if let Some(session) = state.sessions.get_mut(&self.session_id) {
            session.consumers.retain(|id| *id != self.id);
            session
                .outstanding
                .retain(|o| !unseen.iter().any(|h| h.token == Some(o.token)));
        }
        let unseen = unseen
            .into_iter()
            .map(|h| (h.envelope, h.origin))
            .collect();
        state.restore(&weak, unseen, false);
        Ok(())
    }
}

struct AutoAck;

#[async_trait]
impl Acknowledge for AutoAck {
    async fn acknowledge(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

struct MemoryAck {
    inner: Weak<Inner>,
    session_id: u64,
    token: u64,
}

#[async_trait]
impl Acknowledge for MemoryAck {
    async fn acknowledge(&self) -> Result<(), BrokerError> {
        let inner = self.inner.upgrade().ok_or(BrokerError::Closed)?;
        let mut state = inner.state.lock().await;
        let session = state
            .sessions
            .get_mut(&self.session_id)
            .ok_or(BrokerError::Closed)?;
        // Transacted deliveries settle on commit instead.
        if session.mode == SessionMode::Client {
            session.outstanding.retain(|o| o.token != self.token);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MessageBody;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn connect(broker: &MemoryBroker) -> Box<dyn BrokerConnection> {
        broker.connect(ConnectOptions::default()).await.unwrap()
    }

    async fn next_text(consumer: &mut Box<dyn BrokerConsumer>) -> (String, Delivery) {
        let delivery = timeout(Duration::from_secs(1), consumer.recv())
            .await
            .expect("delivery within a second")
            .expect("consumer open");
        let text = match &delivery.message.body {
            MessageBody::Text(text) => text.clone(),
            MessageBody::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        };
        (text, delivery)
    }

    async fn assert_quiet(consumer: &mut Box<dyn BrokerConsumer>) {
        assert!(timeout(Duration::from_millis(100), consumer.recv())
            .await
            .is_err());
    }

    async fn send(session: &dyn BrokerSession, destination: &Destination, text: &str) {
        let producer = session.create_producer().await.unwrap();
        producer
            .send(destination, Message::text(text), SendOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn queue_buffers_until_consumer_arrives() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;
        let session = conn.create_session(SessionMode::Auto).await.unwrap();
        let queue = Destination::queue("orders");

        send(session.as_ref(), &queue, "first").await;
        send(session.as_ref(), &queue, "second").await;
        assert_eq!(broker.queue_depth(&queue).await, 2);

        let mut consumer = session
            .create_consumer(ConsumerSpec::new(queue.clone()))
            .await
            .unwrap();
        assert_eq!(next_text(&mut consumer).await.0, "first");
        let (text, delivery) = next_text(&mut consumer).await;
        assert_eq!(text, "second");
        assert!(delivery
            .message
            .message_id
            .as_deref()
            .unwrap()
            .starts_with("ID:"));
        assert_eq!(broker.queue_depth(&queue).await, 0);
    }

    #[tokio::test]
    async fn queue_round_robins_between_consumers() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;
        let session = conn.create_session(SessionMode::Auto).await.unwrap();
        let queue = Destination::queue("work");
        let mut a = session
            .create_consumer(ConsumerSpec::new(queue.clone()))
            .await
            .unwrap();
        let mut b = session
            .create_consumer(ConsumerSpec::new(queue.clone()))
            .await
            .unwrap();

        for i in 0..4 {
            send(session.as_ref(), &queue, &format!("m{i}")).await;
        }
        assert_eq!(next_text(&mut a).await.0, "m0");
        assert_eq!(next_text(&mut b).await.0, "m1");
        assert_eq!(next_text(&mut a).await.0, "m2");
        assert_eq!(next_text(&mut b).await.0, "m3");
    }

    #[tokio::test]
    async fn topic_fans_out_and_honours_no_local() {
        let broker = MemoryBroker::new();
        let publisher = connect(&broker).await;
        let other = connect(&broker).await;
        let pub_session = publisher.create_session(SessionMode::Auto).await.unwrap();
        let other_session = other.create_session(SessionMode::Auto).await.unwrap();
        let topic = Destination::topic("news");

        let mut local = pub_session
            .create_consumer(ConsumerSpec {
                no_local: true,
                ..ConsumerSpec::new(topic.clone())
            })
            .await
            .unwrap();
        let mut remote_a = other_session
            .create_consumer(ConsumerSpec::new(topic.clone()))
            .await
            .unwrap();
        let mut remote_b = other_session
            .create_consumer(ConsumerSpec::new(topic.clone()))
            .await
            .unwrap();

        send(pub_session.as_ref(), &topic, "headline").await;
        assert_eq!(next_text(&mut remote_a).await.0, "headline");
        assert_eq!(next_text(&mut remote_b).await.0, "headline");
        assert_quiet(&mut local).await;
    }

    #[tokio::test]
    async fn selector_filters_queue_messages() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;
        let session = conn.create_session(SessionMode::Auto).await.unwrap();
        let queue = Destination::queue("filtered");
        let mut consumer = session
            .create_consumer(ConsumerSpec {
                selector: Some("foo = 'zzz'".into()),
                ..ConsumerSpec::new(queue.clone())
            })
            .await
            .unwrap();

        let producer = session.create_producer().await.unwrap();
        producer
            .send(
                &queue,
                Message::text("ignored").with_property("foo", "1234"),
                SendOptions::default(),
            )
            .await
            .unwrap();
        producer
            .send(
                &queue,
                Message::text("real").with_property("foo", "zzz"),
                SendOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(next_text(&mut consumer).await.0, "real");
        assert_eq!(broker.queue_depth(&queue).await, 1);
    }

    #[tokio::test]
    async fn invalid_selector_is_rejected() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;
        let session = conn.create_session(SessionMode::Auto).await.unwrap();
        let result = session
            .create_consumer(ConsumerSpec {
                selector: Some("foo = ".into()),
                ..ConsumerSpec::new(Destination::queue("q"))
            })
            .await;
        assert!(matches!(result, Err(BrokerError::InvalidSelector { .. })));
    }

    #[tokio::test]
    async fn transacted_sends_publish_on_commit_only() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;
        let auto = conn.create_session(SessionMode::Auto).await.unwrap();
        let tx = conn.create_session(SessionMode::Transacted).await.unwrap();
        let queue = Destination::queue("tx");
        let mut consumer = auto
            .create_consumer(ConsumerSpec::new(queue.clone()))
            .await
            .unwrap();

        send(tx.as_ref(), &queue, "A").await;
        assert_quiet(&mut consumer).await;
        tx.rollback().await.unwrap();

        send(tx.as_ref(), &queue, "B").await;
        tx.commit().await.unwrap();
        assert_eq!(next_text(&mut consumer).await.0, "B");
        assert_quiet(&mut consumer).await;
    }

    #[tokio::test]
    async fn unacknowledged_client_deliveries_are_redelivered() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;
        let producer_session = conn.create_session(SessionMode::Auto).await.unwrap();
        let client = conn.create_session(SessionMode::Client).await.unwrap();
        let queue = Destination::queue("acks");

        let mut consumer = client
            .create_consumer(ConsumerSpec::new(queue.clone()))
            .await
            .unwrap();
        send(producer_session.as_ref(), &queue, "keep").await;
        send(producer_session.as_ref(), &queue, "lose").await;

        let (_, kept) = next_text(&mut consumer).await;
        let (_, lost) = next_text(&mut consumer).await;
        kept.acknowledge().await.unwrap();
        assert!(!lost.message.redelivered);

        consumer.close().await.unwrap();
        client.close().await.unwrap();

        let mut second = producer_session
            .create_consumer(ConsumerSpec::new(queue.clone()))
            .await
            .unwrap();
        let (text, redelivery) = next_text(&mut second).await;
        assert_eq!(text, "lose");
        assert!(redelivery.message.redelivered);
        assert_quiet(&mut second).await;
    }

    #[tokio::test]
    async fn durable_subscription_buffers_while_inactive() {
        let broker = MemoryBroker::new();
        let options = ConnectOptions {
            client_id: Some("durable-client".into()),
            ..ConnectOptions::default()
        };
        let topic = Destination::topic("events");
        let spec = ConsumerSpec {
            durable_name: Some("audit".into()),
            ..ConsumerSpec::new(topic.clone())
        };

        let conn = broker.connect(options.clone()).await.unwrap();
        let session = conn.create_session(SessionMode::Auto).await.unwrap();
        let mut consumer = session.create_consumer(spec.clone()).await.unwrap();
        consumer.close().await.unwrap();
        conn.close().await.unwrap();

        let publisher = connect(&broker).await;
        let pub_session = publisher.create_session(SessionMode::Auto).await.unwrap();
        send(pub_session.as_ref(), &topic, "while away").await;

        let conn = broker.connect(options).await.unwrap();
        let session = conn.create_session(SessionMode::Auto).await.unwrap();
        let mut consumer = session.create_consumer(spec).await.unwrap();
        assert_eq!(next_text(&mut consumer).await.0, "while away");
    }

    #[tokio::test]
    async fn client_id_must_be_unique_while_connected() {
        let broker = MemoryBroker::new();
        let options = ConnectOptions {
            client_id: Some("dup".into()),
            ..ConnectOptions::default()
        };
        let first = broker.connect(options.clone()).await.unwrap();
        assert_eq!(first.client_id(), "dup");
        assert!(matches!(
            broker.connect(options.clone()).await,
            Err(BrokerError::ClientIdInUse(_))
        ));
        first.close().await.unwrap();
        assert!(broker.connect(options).await.is_ok());
    }

    #[tokio::test]
    async fn credentials_are_checked_when_users_are_configured() {
        let broker = MemoryBroker::with_users([("brianm", "wombats")]);
        let bad = ConnectOptions {
            login: Some("brianm".into()),
            passcode: Some("nope".into()),
            client_id: None,
        };
        assert!(matches!(
            broker.connect(bad).await,
            Err(BrokerError::Authentication(Some(_)))
        ));
        let good = ConnectOptions {
            login: Some("brianm".into()),
            passcode: Some("wombats".into()),
            client_id: None,
        };
        assert!(broker.connect(good).await.is_ok());
    }

    #[tokio::test]
    async fn expired_messages_are_dropped() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;
        let session = conn.create_session(SessionMode::Auto).await.unwrap();
        let queue = Destination::queue("ttl");
        let producer = session.create_producer().await.unwrap();
        producer
            .send(
                &queue,
                Message::text("short lived"),
                SendOptions {
                    time_to_live: Some(Duration::from_millis(1)),
                    ..SendOptions::default()
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut consumer = session
            .create_consumer(ConsumerSpec::new(queue))
            .await
            .unwrap();
        assert_quiet(&mut consumer).await;
    }

    #[tokio::test]
    async fn temporary_destinations_get_unique_names() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;
        let session = conn.create_session(SessionMode::Auto).await.unwrap();
        let a = session
            .create_temporary(DestinationKind::TempQueue)
            .await
            .unwrap();
        let b = session
            .create_temporary(DestinationKind::TempQueue)
            .await
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(a.kind, DestinationKind::TempQueue);
        assert!(session
            .create_temporary(DestinationKind::Queue)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn closed_connection_refuses_new_sessions() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await;
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(matches!(
            conn.create_session(SessionMode::Auto).await,
            Err(BrokerError::Closed)
        ));
    }
}

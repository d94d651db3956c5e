//! One backend session as seen by a STOMP connection.
//!
//! Translates destination names and converts between frames and backend
//! messages in both directions.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::broker::{
    BrokerProducer, BrokerSession, DeliveryMode, Destination, DestinationKind, Message,
    MessageBody, SendOptions, SessionMode,
};
use crate::error::ProtocolError;
use crate::types::{header, Command, Frame};

pub struct Session {
    backend: Box<dyn BrokerSession>,
    producer: OnceCell<Box<dyn BrokerProducer>>,
    /// Client-chosen temp name -> backend temporary destination.
    temporaries: Mutex<HashMap<(DestinationKind, String), Destination>>,
}

impl Session {
    /// Wraps a backend session. The producer is created on first send.
    pub fn new(backend: Box<dyn BrokerSession>) -> Self {
        Self {
            backend,
            producer: OnceCell::new(),
            temporaries: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.backend.mode()
    }

    pub fn backend(&self) -> &dyn BrokerSession {
        self.backend.as_ref()
    }

    /// Maps a `/queue/`, `/topic/`, `/temp-queue/` or `/temp-topic/` name to
    /// a backend destination. Temporary names are created on first use and
    /// reused afterwards.
    pub async fn resolve_destination(&self, name: &str) -> Result<Destination, ProtocolError> {
        let (kind, rest) = split_destination(name)
            .ok_or_else(|| ProtocolError::InvalidDestination(name.to_string()))?;
        if !kind.is_temporary() {
            return Ok(Destination::new(kind, rest));
        }

        let mut temporaries = self.temporaries.lock().await;
        let key = (kind, rest.to_string());
        if let Some(existing) = temporaries.get(&key) {
            return Ok(existing.clone());
        }
        let created = self.backend.create_temporary(kind).await?;
        debug!("temporary destination {} is backed by {}", name, created);
        temporaries.insert(key, created.clone());
        Ok(created)
    }

    /// Publishes a SEND frame through this session's producer.
    pub async fn send(&self, frame: Frame) -> Result<(), ProtocolError> {
        let (destination, message, options) = self.frame_to_message(frame).await?;
        let producer = self
            .producer
            .get_or_try_init(|| self.backend.create_producer())
            .await?;
        producer.send(&destination, message, options).await?;
        Ok(())
    }

    /// Splits a SEND frame into its target, the backend message and the
    /// per-send options. Reserved headers are consumed; everything else
    /// becomes a message property.
    pub async fn frame_to_message(
        &self,
        frame: Frame,
    ) -> Result<(Destination, Message, SendOptions), ProtocolError> {
        let Frame {
            mut headers,
            body,
            binary,
            ..
        } = frame;

        let name = headers
            .remove(header::DESTINATION)
            .ok_or(ProtocolError::MissingHeader(header::DESTINATION))?;
        let destination = self.resolve_destination(&name).await?;
        headers.remove(header::TRANSACTION);
        headers.remove(header::RECEIPT);

        // A content-length the codec could not use still marks the body binary.
        let binary = headers.remove(header::CONTENT_LENGTH).is_some() || binary;
        let mut message = if binary {
            Message::bytes(body)
        } else {
            let text = String::from_utf8(body.to_vec()).map_err(ProtocolError::InvalidText)?;
            Message::text(text)
        };

        let mut options = SendOptions::default();
        if let Some(persistent) = headers.remove(header::PERSISTENT) {
            options.delivery_mode = if persistent == "true" {
                DeliveryMode::Persistent
            } else {
                DeliveryMode::NonPersistent
            };
        }
        if let Some(priority) = headers.remove(header::PRIORITY) {
            options.priority = priority
                .trim()
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= 9)
                .ok_or(ProtocolError::InvalidHeader {
                    name: header::PRIORITY,
                    value: priority,
                })?;
        }
        if let Some(ttl) = headers.remove(header::EXPIRATION_TIME) {
            let millis = ttl
                .trim()
                .parse::<u64>()
                .map_err(|_| ProtocolError::InvalidHeader {
                    name: header::EXPIRATION_TIME,
                    value: ttl.clone(),
                })?;
            options.time_to_live = (millis > 0).then(|| Duration::from_millis(millis));
        }

        message.correlation_id = headers.remove(header::CORRELATION_ID);
        message.message_type = headers.remove(header::TYPE);
        if let Some(reply_to) = headers.remove(header::REPLY_TO) {
            message.reply_to = Some(self.resolve_destination(&reply_to).await?);
        }
        for (key, value) in headers.iter() {
            message.properties.insert(key.to_string(), value.to_string());
        }

        Ok((destination, message, options))
    }
}

fn split_destination(name: &str) -> Option<(DestinationKind, &str)> {
    [
        DestinationKind::Queue,
        DestinationKind::Topic,
        DestinationKind::TempQueue,
        DestinationKind::TempTopic,
    ]
    .into_iter()
    .find_map(|kind| name.strip_prefix(kind.prefix()).map(|rest| (kind, rest)))
}

/// Builds the MESSAGE frame for a delivered backend message.
pub fn message_to_frame(message: &Message) -> Frame {
    let mut frame = Frame::new(Command::Message)
        .with_header(
            header::DESTINATION,
            message
                .destination
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
        )
        .with_header(
            header::MESSAGE_ID,
            message.message_id.clone().unwrap_or_default(),
        );
    if let Some(correlation_id) = &message.correlation_id {
        frame.headers.insert(header::CORRELATION_ID, correlation_id.as_str());
    }
    frame
        .headers
        .insert(header::EXPIRATION_TIME, message.expiration.to_string());
    if message.redelivered {
        frame.headers.insert(header::REDELIVERED, "true");
    }
    frame
        .headers
        .insert(header::PRIORITY, message.priority.to_string());
    if let Some(reply_to) = &message.reply_to {
        frame.headers.insert(header::REPLY_TO, reply_to.to_string());
    }
    frame
        .headers
        .insert(header::TIMESTAMP, message.timestamp.to_string());
    if let Some(message_type) = &message.message_type {
        frame.headers.insert(header::TYPE, message_type.as_str());
    }
    for (key, value) in &message.properties {
        frame.headers.insert(key.as_str(), value.as_str());
    }

    match &message.body {
        MessageBody::Text(text) => frame.with_body(text.clone()),
        MessageBody::Bytes(bytes) => frame.with_binary_body(bytes.clone()),
    }
}

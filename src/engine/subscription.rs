use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::{BrokerConsumer, Destination};
use crate::engine::session::message_to_frame;
use crate::engine::PendingAcks;
use crate::error::{BrokerError, StompError};
use crate::tcp::FrameSink;
use crate::types::header;

/// A backend consumer bound to a client subscription id.
///
/// Deliveries are pumped to the client by a dedicated task, so they race
/// with command responses on the same connection and are only serialized
/// by the [`FrameSink`].
pub struct Subscription {
    id: String,
    destination: Destination,
    cancel: CancellationToken,
    task: Option<JoinHandle<Box<dyn BrokerConsumer>>>,
}

impl Subscription {
    /// Starts delivering. With `pending` set, every delivery is recorded for
    /// a later ACK before it is written to the client.
    pub fn start(
        id: String,
        destination: Destination,
        consumer: Box<dyn BrokerConsumer>,
        sink: FrameSink,
        pending: Option<PendingAcks>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(deliver(
            id.clone(),
            consumer,
            sink,
            pending,
            cancel.clone(),
        ));
        Self {
            id,
            destination,
            cancel,
            task: Some(task),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Stops delivery and closes the backend consumer.
    pub async fn close(mut self) -> Result<(), BrokerError> {
        self.cancel.cancel();
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(mut consumer) => consumer.close().await,
            Err(e) => Err(BrokerError::Backend(format!(
                "delivery task for subscription {} failed: {}",
                self.id, e
            ))),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn deliver(
    id: String,
    mut consumer: Box<dyn BrokerConsumer>,
    sink: FrameSink,
    pending: Option<PendingAcks>,
    cancel: CancellationToken,
) -> Box<dyn BrokerConsumer> {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = consumer.recv() => match next {
                Some(delivery) => delivery,
                None => {
                    debug!("consumer for subscription {} closed", id);
                    break;
                }
            },
        };

        // Registered before the write so an immediate ACK always finds it.
        if let Some(pending) = &pending {
            pending.register(delivery.clone()).await;
        }
        let mut frame = message_to_frame(&delivery.message);
        frame.headers.insert(header::SUBSCRIPTION, id.as_str());
        match sink.send(frame).await {
            Ok(()) => {}
            Err(StompError::ConnectionClosed) => {
                debug!("connection closed, subscription {} stops delivering", id);
                break;
            }
            Err(e) => {
                warn!(
                    "failed to deliver {:?} to subscription {}: {}",
                    delivery.message.message_id, id, e
                );
                // The client never saw it, so no ACK can arrive.
                if let (Some(pending), Some(message_id)) =
                    (&pending, &delivery.message.message_id)
                {
                    pending.take(message_id).await;
                }
            }
        }
    }
    consumer
}

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::TransportConfig;
use crate::error::{Result, StompError};
use crate::frame::DecodedFrame;
use crate::tcp::connection::{Connection, FrameHandler};
use crate::types::Frame;

/// Client side of the transport: connects out and queues inbound frames.
pub struct StompTcpClient {
    connection: Connection,
    inbound: mpsc::UnboundedReceiver<Frame>,
}

struct Forwarder(mpsc::UnboundedSender<Frame>);

#[async_trait]
impl FrameHandler for Forwarder {
    async fn on_frame(&mut self, frame: DecodedFrame) {
        match frame {
            Ok(frame) => {
                let _ = self.0.send(frame);
            }
            Err(e) => warn!("dropping malformed frame from server: {}", e),
        }
    }

    async fn on_error(&mut self, error: StompError) {
        info!("client connection ended: {}", error);
    }
}

impl StompTcpClient {
    /// Opens a TCP connection and starts reading frames from it. No STOMP
    /// CONNECT is sent.
    pub async fn connect(addr: impl ToSocketAddrs, config: &TransportConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let peer = stream.peer_addr()?;
        let mut connection = Connection::from_tcp(stream, peer, config);
        let (tx, inbound) = mpsc::unbounded_channel();
        connection.start(Forwarder(tx))?;
        info!("connected to {}", peer);
        Ok(Self {
            connection,
            inbound,
        })
    }

    /// Writes one frame to the server.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.connection.sink().send(frame).await
    }

    /// Next frame from the server, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }

    /// Like [`recv`](Self::recv), giving up after `wait`.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<Frame> {
        tokio::time::timeout(wait, self.inbound.recv())
            .await
            .ok()
            .flatten()
    }

    /// Sends `frame` and waits for the next frame the server sends back.
    pub async fn request(&mut self, frame: Frame, wait: Duration) -> Result<Frame> {
        self.send(frame).await?;
        self.recv_timeout(wait)
            .await
            .ok_or(StompError::ConnectionClosed)
    }

    /// Stops the read loop and closes the socket.
    pub async fn close(mut self) {
        self.connection.stop().await;
    }
}

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::config::TransportConfig;
use crate::error::{Result, StompError};
use crate::tcp::connection::{Connection, FrameHandler, FrameSink};

type LiveConnections = Arc<Mutex<HashMap<u64, Connection>>>;

/// TCP acceptor for STOMP clients.
///
/// Every accepted socket gets its own [`Connection`] and a fresh handler
/// built by the factory passed to [`StompTcpServer::start`].
pub struct StompTcpServer {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    config: TransportConfig,
    connections: LiveConnections,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl StompTcpServer {
    /// Binds the listener. Nothing is accepted until [`start`](Self::start).
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs, config: TransportConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("STOMP server bound to {}", local_addr);

        Ok(Self {
            listener: Some(listener),
            local_addr,
            config,
            connections: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            task: None,
        })
    }

    /// The bound address, useful after binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connections whose read loop is still running.
    pub async fn connection_count(&self) -> usize {
        let mut connections = self.connections.lock().await;
        connections.retain(|_, c| c.is_running());
        connections.len()
    }

    /// Starts accepting. `factory` builds one handler per accepted connection
    /// from that connection's write side.
    pub fn start<F, H>(&mut self, factory: F) -> Result<()>
    where
        F: Fn(FrameSink) -> H + Send + Sync + 'static,
        H: FrameHandler,
    {
        let listener = self.listener.take().ok_or(StompError::AlreadyStarted)?;
        info!("STOMP server accepting on {}", self.local_addr);
        self.task = Some(tokio::spawn(accept_loop(
            listener,
            factory,
            self.config.clone(),
            self.connections.clone(),
            self.cancel.clone(),
        )));
        Ok(())
    }

    /// Waits until the accept loop ends, either through [`stop`](Self::stop)
    /// or a fatal accept error.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await;
    }

    /// Stops accepting, then stops every live connection.
    pub async fn stop(&mut self) {
        // The accept loop drops the listener as soon as it sees the cancellation.
        self.cancel.cancel();
        self.listener = None;
        if let Some(task) = self.task.take() {
            if self.config.join_on_stop {
                if let Err(e) = task.await {
                    error!("accept loop for {} ended abnormally: {}", self.local_addr, e);
                }
            }
        }

        let connections: Vec<Connection> = {
            let mut live = self.connections.lock().await;
            live.drain().map(|(_, c)| c).collect()
        };
        info!(
            "STOMP server on {} stopping {} connections",
            self.local_addr,
            connections.len()
        );
        for mut connection in connections {
            connection.stop().await;
        }
    }
}

async fn accept_loop<F, H>(
    listener: TcpListener,
    factory: F,
    config: TransportConfig,
    connections: LiveConnections,
    cancel: CancellationToken,
) where
    F: Fn(FrameSink) -> H + Send + Sync + 'static,
    H: FrameHandler,
{
    let mut next_id: u64 = 0;
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = timeout(config.poll_interval(), listener.accept()) => accepted,
        };

        match accepted {
            Err(_) => trace!("accept poll timed out"),
            Ok(Ok((socket, addr))) => {
                info!("New connection from {}", addr);
                next_id += 1;
                let mut connection = Connection::from_tcp(socket, addr, &config);
                let handler = factory(connection.sink());
                if let Err(e) = connection.start(handler) {
                    error!("could not start connection {}: {}", addr, e);
                    continue;
                }
                if !admit(&connections, &cancel, next_id, connection).await {
                    break;
                }
            }
            Ok(Err(e)) => {
                error!("Failed to accept connection: {}", e);
                cancel.cancel();
                break;
            }
        }
    }
    drop(listener);
    info!("accept loop finished");
}

/// Adds a started connection to the live set. If the server is already
/// stopping, the connection is stopped instead and `false` is returned.
///
/// `stop` cancels before draining the set, so checking under the lock
/// leaves no connection behind.
async fn admit(
    connections: &LiveConnections,
    cancel: &CancellationToken,
    id: u64,
    mut connection: Connection,
) -> bool {
    let mut live = connections.lock().await;
    if cancel.is_cancelled() {
        drop(live);
        debug!("server stopping, closing {} right away", connection.peer());
        connection.stop().await;
        return false;
    }
    live.retain(|_, c| c.is_running());
    live.insert(id, connection);
    debug!("{} live connections", live.len());
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DecodedFrame;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    struct Lifecycle(mpsc::UnboundedSender<&'static str>);

    #[async_trait]
    impl FrameHandler for Lifecycle {
        async fn on_frame(&mut self, _frame: DecodedFrame) {}

        async fn on_error(&mut self, _error: StompError) {
            let _ = self.0.send("error");
        }

        async fn on_stop(&mut self) {
            let _ = self.0.send("stop");
        }
    }

    type Started = (
        Connection,
        mpsc::UnboundedReceiver<&'static str>,
        tokio::io::DuplexStream,
    );

    fn started(config: &TransportConfig) -> Started {
        let (stream, peer) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(stream);
        let mut connection = Connection::new(Box::new(reader), Box::new(writer), "duplex", config);
        let (tx, rx) = mpsc::unbounded_channel();
        connection.start(Lifecycle(tx)).unwrap();
        (connection, rx, peer)
    }

    #[tokio::test]
    async fn admitted_while_running() {
        let connections = LiveConnections::default();
        let cancel = CancellationToken::new();
        let (connection, _rx, _peer) = started(&TransportConfig::default());

        assert!(admit(&connections, &cancel, 1, connection).await);
        assert!(connections.lock().await.contains_key(&1));
    }

    #[tokio::test]
    async fn connection_accepted_during_shutdown_is_stopped() {
        let connections = LiveConnections::default();
        let cancel = CancellationToken::new();
        let (connection, mut rx, _peer) = started(&TransportConfig::default());

        cancel.cancel();
        assert!(!admit(&connections, &cancel, 1, connection).await);
        assert_eq!(rx.recv().await, Some("stop"));
        assert!(connections.lock().await.is_empty());
    }

    #[tokio::test]
    async fn stop_without_joining_still_closes_clients() {
        let config = TransportConfig {
            poll_interval_ms: 20,
            join_on_stop: false,
            ..TransportConfig::default()
        };
        let mut server = StompTcpServer::bind("127.0.0.1:0", config).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        server.start(move |_sink| Lifecycle(tx.clone())).unwrap();

        let mut client = tokio::net::TcpStream::connect(server.local_addr()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while server.connection_count().await == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        server.stop().await;
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }
}

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::codec::StompFrameCodec;
use crate::config::TransportConfig;
use crate::error::{Result, StompError};
use crate::frame::DecodedFrame;
use crate::types::Frame;

pub type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Receives everything a connection's read loop produces.
///
/// Callbacks run on the read-loop task, one at a time and in arrival order.
/// After the loop ends, exactly one of `on_error` or `on_stop` has been
/// called.
#[async_trait]
pub trait FrameHandler: Send + 'static {
    /// A decoded frame, or a malformed one the codec skipped over.
    async fn on_frame(&mut self, frame: DecodedFrame);

    /// The transport failed or the peer went away. No more frames follow.
    async fn on_error(&mut self, error: StompError);

    /// The connection was stopped locally.
    async fn on_stop(&mut self) {}
}

/// Cloneable, concurrency-safe write side of a connection.
///
/// Each frame is encoded and flushed while holding the lock, so frames
/// written from different tasks never interleave. Once the connection is
/// stopped, pending and future sends fail with
/// [`StompError::ConnectionClosed`] instead of waiting on the peer.
#[derive(Clone)]
pub struct FrameSink {
    writer: Arc<Mutex<FramedWrite<BoxedWriter, StompFrameCodec>>>,
    peer: Arc<str>,
    closed: CancellationToken,
}

impl FrameSink {
    fn new(
        writer: BoxedWriter,
        codec: StompFrameCodec,
        peer: Arc<str>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            writer: Arc::new(Mutex::new(FramedWrite::new(writer, codec))),
            peer,
            closed,
        }
    }

    pub async fn send(&self, frame: Frame) -> Result<()> {
        debug!("<<<< {} headers: {}", frame.command, frame.headers);
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(StompError::ConnectionClosed),
            result = async {
                let mut writer = self.writer.lock().await;
                writer.send(frame).await
            } => result,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Closes the write side. Callers cancel `closed` first so no send
    /// holds the lock.
    async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.get_mut().shutdown().await {
            debug!("shutdown of {} failed: {}", self.peer, e);
        }
    }
}

impl fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSink").field("peer", &self.peer).finish()
    }
}

/// One transport connection: a read loop feeding a [`FrameHandler`] and a
/// shared [`FrameSink`] for writes.
pub struct Connection {
    sink: FrameSink,
    reader: Option<FramedRead<BoxedReader, StompFrameCodec>>,
    poll_interval: Duration,
    join_on_stop: bool,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Connection {
    /// Wraps an arbitrary byte stream pair.
    pub fn new(
        reader: BoxedReader,
        writer: BoxedWriter,
        peer: impl Into<String>,
        config: &TransportConfig,
    ) -> Self {
        let codec = StompFrameCodec::new(config.max_frame_size);
        let peer: Arc<str> = Arc::from(peer.into());
        let cancel = CancellationToken::new();
        Self {
            sink: FrameSink::new(writer, codec.clone(), peer, cancel.clone()),
            reader: Some(FramedRead::new(reader, codec)),
            poll_interval: config.poll_interval(),
            join_on_stop: config.join_on_stop,
            cancel,
            task: None,
        }
    }

    /// Wraps a connected TCP stream, applying the configured socket options.
    pub fn from_tcp(stream: TcpStream, peer: SocketAddr, config: &TransportConfig) -> Self {
        configure_socket(&stream, peer, config);
        let (reader, writer) = stream.into_split();
        Self::new(Box::new(reader), Box::new(writer), peer.to_string(), config)
    }

    pub fn sink(&self) -> FrameSink {
        self.sink.clone()
    }

    pub fn peer(&self) -> &str {
        self.sink.peer()
    }

    /// Spawns the read loop, handing every frame to `handler`.
    pub fn start<H: FrameHandler>(&mut self, handler: H) -> Result<()> {
        let reader = self.reader.take().ok_or(StompError::AlreadyStarted)?;
        let sink = self.sink.clone();
        let cancel = self.cancel.clone();
        let poll_interval = self.poll_interval;
        self.task = Some(tokio::spawn(read_loop(
            reader,
            handler,
            sink,
            cancel,
            poll_interval,
        )));
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Closes the socket and ends the read loop.
    ///
    /// With `join_on_stop`, returns only after the loop has exited, so no
    /// handler callback can run afterwards.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        self.sink.shutdown().await;
        let Some(task) = self.task.take() else {
            return;
        };
        if self.join_on_stop {
            if let Err(e) = task.await {
                warn!("read loop for {} ended abnormally: {}", self.peer(), e);
            }
        }
    }
}

fn configure_socket(stream: &TcpStream, peer: SocketAddr, config: &TransportConfig) {
    if let Some(nodelay) = config.tcp_nodelay {
        if let Err(e) = stream.set_nodelay(nodelay) {
            warn!("could not set TCP_NODELAY on {}: {}", peer, e);
        }
    }
    let socket = socket2::SockRef::from(stream);
    if let Some(keep_alive) = config.keep_alive {
        if let Err(e) = socket.set_keepalive(keep_alive) {
            warn!("could not set SO_KEEPALIVE on {}: {}", peer, e);
        }
    }
    if let Some(size) = config.socket_buffer_size {
        if let Err(e) = socket.set_recv_buffer_size(size) {
            warn!("could not set receive buffer size on {}: {}", peer, e);
        }
        if let Err(e) = socket.set_send_buffer_size(size) {
            warn!("could not set send buffer size on {}: {}", peer, e);
        }
    }
}

async fn read_loop<H: FrameHandler>(
    mut reader: FramedRead<BoxedReader, StompFrameCodec>,
    mut handler: H,
    sink: FrameSink,
    cancel: CancellationToken,
    poll_interval: Duration,
) {
    let peer = sink.peer().to_string();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("read loop for {} stopped", peer);
                handler.on_stop().await;
                return;
            }
            next = timeout(poll_interval, reader.next()) => next,
        };

        match next {
            Err(_) => {
                trace!("read poll on {} timed out", peer);
            }
            Ok(Some(Ok(decoded))) => {
                match &decoded {
                    Ok(frame) => debug!(">>>> {} headers: {}", frame.command, frame.headers),
                    Err(e) => debug!(">>>> unreadable frame from {}: {}", peer, e),
                }
                handler.on_frame(decoded).await;
            }
            Ok(Some(Err(e))) => {
                error!("connection {} failed: {}", peer, e);
                cancel.cancel();
                sink.shutdown().await;
                handler.on_error(e).await;
                return;
            }
            Ok(None) => {
                info!("connection {} closed by peer", peer);
                cancel.cancel();
                sink.shutdown().await;
                handler.on_error(StompError::ConnectionClosed).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FrameError;
    use crate::types::Command;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    enum Event {
        Frame(std::result::Result<Frame, FrameError>),
        Error(String),
        Stop,
    }

    struct Recorder(mpsc::UnboundedSender<Event>);

    #[async_trait]
    impl FrameHandler for Recorder {
        async fn on_frame(&mut self, frame: DecodedFrame) {
            let _ = self.0.send(Event::Frame(frame));
        }

        async fn on_error(&mut self, error: StompError) {
            let _ = self.0.send(Event::Error(error.to_string()));
        }

        async fn on_stop(&mut self) {
            let _ = self.0.send(Event::Stop);
        }
    }

    fn config() -> TransportConfig {
        TransportConfig {
            poll_interval_ms: 10,
            ..TransportConfig::default()
        }
    }

    #[tokio::test]
    async fn frames_then_exactly_one_error_on_eof() {
        let reader = tokio_test::io::Builder::new()
            .read(b"CONNECT\nlogin:a\n\n\0\n")
            .wait(Duration::from_millis(50))
            .read(b"BOGUS\nnocolon\n\n\0\n")
            .read(b"DISCONNECT\n\n\0\n")
            .build();
        let writer = tokio_test::io::Builder::new().build();
        let mut connection = Connection::new(Box::new(reader), Box::new(writer), "mock", &config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.start(Recorder(tx)).unwrap();

        match rx.recv().await.unwrap() {
            Event::Frame(Ok(frame)) => assert_eq!(frame.command, Command::Connect),
            other => panic!("unexpected {other:?}"),
        }
        // The poll timeout fired during the wait; it must not show up here.
        assert!(matches!(rx.recv().await.unwrap(), Event::Frame(Err(_))));
        match rx.recv().await.unwrap() {
            Event::Frame(Ok(frame)) => assert_eq!(frame.command, Command::Disconnect),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(rx.recv().await.unwrap(), Event::Error(_)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let reader = tokio_test::io::Builder::new().build();
        let writer = tokio_test::io::Builder::new().build();
        let mut connection = Connection::new(Box::new(reader), Box::new(writer), "mock", &config());
        let (tx, _rx) = mpsc::unbounded_channel();
        connection.start(Recorder(tx.clone())).unwrap();
        assert!(matches!(
            connection.start(Recorder(tx)),
            Err(StompError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn stop_reports_on_stop_and_joins() {
        let (client, server) = tokio::io::duplex(1024);
        let (read_half, write_half) = tokio::io::split(server);
        let mut connection = Connection::new(
            Box::new(read_half),
            Box::new(write_half),
            "duplex",
            &config(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.start(Recorder(tx)).unwrap();
        assert!(connection.is_running());

        connection.stop().await;
        assert!(!connection.is_running());
        assert!(matches!(rx.recv().await.unwrap(), Event::Stop));
        assert!(rx.recv().await.is_none());
        drop(client);
    }

    #[tokio::test]
    async fn stop_unblocks_a_stalled_writer() {
        // Nobody reads from `_peer`, so the 64-byte pipe fills up.
        let (_peer, server) = tokio::io::duplex(64);
        let (_read_half, write_half) = tokio::io::split(server);
        let (reader, _quiet) = tokio::io::duplex(64);
        let mut connection =
            Connection::new(Box::new(reader), Box::new(write_half), "stalled", &config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.start(Recorder(tx)).unwrap();

        let sink = connection.sink();
        let blocked = tokio::spawn(async move {
            sink.send(Frame::new(Command::Message).with_body("x".repeat(10 * 1024)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        timeout(Duration::from_secs(3), connection.stop())
            .await
            .expect("stop must not wait for the stalled write");
        assert!(matches!(
            blocked.await.unwrap(),
            Err(StompError::ConnectionClosed)
        ));
        assert!(matches!(
            connection.sink().send(Frame::new(Command::Receipt)).await,
            Err(StompError::ConnectionClosed)
        ));
        assert!(matches!(rx.recv().await.unwrap(), Event::Stop));
    }

    #[tokio::test]
    async fn concurrent_sends_do_not_interleave() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (_read_half, write_half) = tokio::io::split(server);
        let (empty, _) = tokio::io::duplex(8);
        let connection = Connection::new(
            Box::new(empty),
            Box::new(write_half),
            "duplex",
            &config(),
        );

        let mut tasks = Vec::new();
        for i in 0..8 {
            let sink = connection.sink();
            tasks.push(tokio::spawn(async move {
                let body = format!("{i}").repeat(500);
                sink.send(Frame::new(Command::Message).with_body(body))
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut frames = FramedRead::new(client, StompFrameCodec::default());
        for _ in 0..8 {
            let frame = frames.next().await.unwrap().unwrap().unwrap();
            let body = frame.body_text();
            let first = body.chars().next().unwrap();
            assert!(body.chars().all(|c| c == first));
            assert_eq!(body.len(), 500);
        }
    }
}

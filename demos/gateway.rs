use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use stomp_gateway::{
    Broker, Command, Frame, MemoryBroker, ProtocolEngine, StompTcpClient, StompTcpServer,
    TransportConfig,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    info!("Starting STOMP gateway example...");

    // Gateway in front of the in-memory broker
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let mut server = StompTcpServer::bind("127.0.0.1:61613", TransportConfig::default()).await?;
    server.start(move |sink| ProtocolEngine::new(broker.clone(), sink))?;

    // Connect a client and open a STOMP session
    let wait = Duration::from_secs(1);
    let mut client = StompTcpClient::connect(server.local_addr(), &TransportConfig::default()).await?;
    let connected = client.request(Frame::new(Command::Connect), wait).await?;
    info!("Server replied {} (session {:?})", connected.command, connected.header("session"));

    // Subscribe, then publish to the same queue
    let receipt = client
        .request(
            Frame::new(Command::Subscribe)
                .with_header("destination", "/queue/demo")
                .with_header("receipt", "sub-1"),
            wait,
        )
        .await?;
    info!("Subscription confirmed: {:?}", receipt.header("receipt-id"));

    for i in 0..3 {
        client
            .send(
                Frame::new(Command::Send)
                    .with_header("destination", "/queue/demo")
                    .with_body(format!("Hello #{i} from STOMP!")),
            )
            .await?;
    }

    // Read the deliveries back
    while let Some(frame) = client.recv_timeout(wait).await {
        info!(
            "Received {} on {:?}: {}",
            frame.command,
            frame.header("destination"),
            frame.body_text()
        );
    }

    client.send(Frame::new(Command::Disconnect)).await?;
    client.close().await;
    server.stop().await;
    info!("Example finished");
    Ok(())
}

use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stomp_gateway::config::{GatewayConfig, DEFAULT_BACKEND};
use stomp_gateway::error::ConfigError;
use stomp_gateway::{Broker, MemoryBroker, ProtocolEngine, StompTcpServer};

/// Bridges STOMP clients to a messaging backend.
#[derive(Debug, Parser)]
#[command(name = "stomp-gateway", version, about)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "STOMP_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 127.0.0.1:61613
    listen: Option<SocketAddr>,

    /// Backend to bridge to
    backend: Option<String>,
}

fn resolve_backend(name: &str) -> Result<Arc<dyn Broker>, ConfigError> {
    match name {
        DEFAULT_BACKEND => Ok(Arc::new(MemoryBroker::new())),
        other => Err(ConfigError::UnknownBackend(other.to_string())),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    config.validate()?;

    let broker = resolve_backend(&config.backend)?;
    info!("Starting STOMP gateway for backend {:?}", config.backend);

    let mut server = StompTcpServer::bind(config.listen, config.transport.clone()).await?;
    server.start(move |sink| ProtocolEngine::new(broker.clone(), sink))?;

    let listener_failed = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down...");
            false
        }
        _ = server.stopped() => {
            error!("Accept loop stopped unexpectedly");
            true
        }
    };

    server.stop().await;
    if listener_failed {
        return Err("listener failed".into());
    }
    info!("Gateway stopped");
    Ok(())
}

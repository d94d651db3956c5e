//! # stomp-gateway
//!
//! A STOMP gateway that terminates text-framed client connections over TCP
//! and bridges them to a pluggable messaging backend.
//!
//! * **Codec**: frame marshalling over `bytes`, wrapped as a `tokio_util` codec
//! * **Transport**: one read-loop task per socket, serialized concurrent writes
//! * **Engine**: the per-connection command state machine
//!
//! ## Quick Start
//!
//! ```rust
//! use stomp_gateway::{Command, Frame};
//!
//! // Create a SEND frame
//! let frame = Frame::new(Command::Send)
//!     .with_header("destination", "/queue/orders")
//!     .with_body("Hello, STOMP!");
//!
//! // Encode to bytes
//! let encoded = stomp_gateway::frame::encode_frame(&frame)?;
//!
//! // Decode from bytes
//! let mut buf = bytes::BytesMut::from(&encoded[..]);
//! let decoded = stomp_gateway::frame::try_decode_frame(&mut buf, 1024)?.unwrap()?;
//!
//! assert_eq!(frame, decoded);
//! # Ok::<(), stomp_gateway::StompError>(())
//! ```
//!
//! Running a gateway in front of the in-memory backend:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stomp_gateway::{Broker, MemoryBroker, ProtocolEngine, StompTcpServer, TransportConfig};
//!
//! # async fn run() -> stomp_gateway::Result<()> {
//! let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
//! let mut server = StompTcpServer::bind("127.0.0.1:61613", TransportConfig::default()).await?;
//! server.start(move |sink| ProtocolEngine::new(broker.clone(), sink))?;
//! server.stopped().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Wire Format
//!
//! ```text
//! ACTION\n
//! key:value\n        (zero or more)
//! \n
//! body\0\n
//! ```
//!
//! A `content-length` header makes the body length-delimited and binary
//! safe; without one the body runs to the first NUL and is treated as text.
//!
//! ## Commands
//!
//! | Command     | Needs              | Effect                                   |
//! |-------------|--------------------|------------------------------------------|
//! | CONNECT     |                    | open a backend connection, reply CONNECTED |
//! | SEND        | destination        | publish, optionally inside a transaction |
//! | SUBSCRIBE   | destination        | start delivering MESSAGE frames          |
//! | UNSUBSCRIBE | id or destination  | stop a subscription                      |
//! | BEGIN       | transaction        | open a transacted session                |
//! | COMMIT      | transaction        | commit and end it                        |
//! | ABORT       | transaction        | roll back and end it                     |
//! | ACK         | message-id         | acknowledge a client-ack delivery        |
//! | DISCONNECT  |                    | release everything, back to unconnected  |

pub mod broker;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod tcp;
pub mod types;

// Re-export main types for convenience
pub use broker::{Broker, MemoryBroker};
pub use codec::StompFrameCodec;
pub use config::{GatewayConfig, TransportConfig};
pub use engine::ProtocolEngine;
pub use error::{BrokerError, FrameError, ProtocolError, Result, StompError};
pub use frame::{encode_frame, try_decode_frame};
pub use tcp::{Connection, FrameHandler, FrameSink, StompTcpClient, StompTcpServer};
pub use types::{AckMode, Command, ConnectionState, Frame, Headers};

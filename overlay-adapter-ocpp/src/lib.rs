//! # Overlay OCPP Adapter
//!
//! WebSocket side of an OCPP 2.1 networking node: accepts charging stations
//! and downstream networking nodes, keeps persistent connections towards the
//! CSMS or upstream nodes, and relays messages between them.
//!
//! ## Networking Modes
//!
//! | Mode | Request frame | Response frame |
//! |------|---------------|----------------|
//! | Standard | `[2, id, action, payload]` | `[3, id, payload]` |
//! | Overlay | `[2, dest, path, id, action, payload]` | `[3, dest, path, id, payload]` |
//!
//! ## Usage
//!
//! ```no_run
//! use overlay_adapter_ocpp::{AdapterConfig, OcppAdapter, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AdapterConfig::new("NN1");
//!     let adapter = OcppAdapter::new(config.clone());
//!
//!     adapter.listen(ServerConfig::new("0.0.0.0:9000".parse()?)).await?;
//!     adapter.connect(config.client("ws://csms.example:8180/ocpp", "CSMS"))?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     adapter.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod ocpp;
pub mod relay;
pub mod adapter;

pub use config::{AdapterConfig, BasicAuthConfig, ClientConfig, ServerConfig, OCPP_SUBPROTOCOL};
pub use error::{AdapterError, AdmissionError};
pub use events::{AdapterEvent, EventKind, Facet};
pub use handlers::{binary_handler_fn, handler_fn, BinaryReply, BinaryRequestHandler, Reply, RequestHandler};
pub use ocpp::{Link, OcppTransport, TransportKind, WebSocketClient, WebSocketServer};
pub use adapter::{Forwarding, Incoming, OcppAdapter, Outgoing, Route};

//! OCPP WebSocket transports

pub mod transport;
pub mod client;
pub mod server;

pub use transport::{Inbound, InboundReceiver, InboundSender, Link, OcppTransport, TransportKind};
pub use client::WebSocketClient;
pub use server::WebSocketServer;

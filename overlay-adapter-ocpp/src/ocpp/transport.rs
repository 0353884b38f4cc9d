//! Transport abstraction shared by the WebSocket client and server
//!
//! Outbound, every transport offers the same five send operations. Inbound,
//! transports push decoded frames and connection changes into one channel
//! owned by the adapter.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use overlay_core::{
    BinaryRequest, BinaryResponse, JsonError, JsonRequest, JsonResponse, NodeId, OcppFrame, SendResult,
};
use tokio::sync::mpsc;

/// Which side of a connection a transport sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Client,
    Server,
}

#[async_trait]
pub trait OcppTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn send_json_request(&self, request: &JsonRequest) -> SendResult;

    async fn send_json_response(&self, response: &JsonResponse) -> SendResult;

    async fn send_json_error(&self, error: &JsonError) -> SendResult;

    async fn send_binary_request(&self, request: &BinaryRequest) -> SendResult;

    async fn send_binary_response(&self, response: &BinaryResponse) -> SendResult;

    /// Whether a frame addressed to `destination` has somewhere to go
    fn can_reach(&self, _destination: &NodeId) -> bool {
        false
    }

    /// Record that `destination` sits behind `hub`
    fn add_networking_hub(&self, _destination: NodeId, _hub: NodeId) {}

    fn remove_networking_hub(&self, _destination: &NodeId) {}
}

/// A transport together with the peer a frame came from
#[derive(Clone)]
pub struct Link {
    pub transport: Arc<dyn OcppTransport>,
    pub peer: NodeId,
}

impl Link {
    pub fn new(transport: Arc<dyn OcppTransport>, peer: NodeId) -> Self {
        Self { transport, peer }
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("peer", &self.peer)
            .field("kind", &self.kind())
            .finish()
    }
}

/// What transports report to the adapter
#[derive(Debug)]
pub enum Inbound {
    Frame { frame: OcppFrame, link: Link },
    Connected(Link),
    Disconnected(Link),
}

pub type InboundSender = mpsc::Sender<Inbound>;
pub type InboundReceiver = mpsc::Receiver<Inbound>;

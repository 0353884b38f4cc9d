//! Adapter events
//!
//! Everything the adapter does with a message is published on a broadcast
//! channel. Subscribers that fall behind miss events; the adapter never waits
//! for them.

use chrono::{DateTime, Utc};
use overlay_core::{ErrorCode, ForwardingResult, NodeId, RequestId, ResultCode, VerificationStatus};
use tokio::sync::broadcast;
use tracing::trace;

use crate::ocpp::TransportKind;

/// Which facet of the adapter produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facet {
    Incoming,
    Outgoing,
    Forwarding,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Connected {
        peer: NodeId,
        transport: TransportKind,
    },
    Disconnected {
        peer: NodeId,
        transport: TransportKind,
    },
    RequestSent {
        request_id: RequestId,
        destination: NodeId,
        action: String,
    },
    RequestCompleted {
        request_id: RequestId,
        result: ResultCode,
    },
    ResponseSent {
        request_id: RequestId,
        destination: NodeId,
    },
    ErrorSent {
        request_id: RequestId,
        destination: NodeId,
        code: ErrorCode,
    },
    RequestReceived {
        request_id: RequestId,
        action: String,
        source: NodeId,
    },
    ResponseReceived {
        request_id: RequestId,
    },
    ErrorReceived {
        request_id: RequestId,
        code: ErrorCode,
    },
    Forwarded {
        request_id: RequestId,
        action: String,
        result: ForwardingResult,
    },
    Unmatched {
        request_id: RequestId,
    },
    SignaturesVerified {
        request_id: RequestId,
        action: String,
        statuses: Vec<VerificationStatus>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdapterEvent {
    pub facet: Facet,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
}

/// Broadcast hub for adapter events
pub struct EventBus {
    tx: broadcast::Sender<AdapterEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, facet: Facet, kind: EventKind) {
        trace!("{:?} event: {:?}", facet, kind);
        // No subscribers is fine
        let _ = self.tx.send(AdapterEvent {
            facet,
            at: Utc::now(),
            kind,
        });
    }
}

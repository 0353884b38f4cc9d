//! Forwarded-request table
//!
//! When a request is relayed, the link it came in on is remembered under its
//! request id so the answer can travel back the same way and carry the path
//! of the exchange.
//!
//! Entries are keyed by request id alone. Two sources relaying the same id
//! through this node at once cannot both be tracked: the second is refused
//! with a `GenericError` until the first is answered or swept.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use overlay_core::{
    BinaryRequest, BinaryResponse, CorrelationEngine, JsonError, JsonRequest, JsonResponse, NetworkPath,
    NetworkingMode, NodeId, RequestId, Routable, SendResult,
};
use tracing::debug;

use crate::ocpp::{Link, OcppTransport};

/// A request envelope the relay can forward
#[async_trait]
pub(crate) trait Relayed: Routable + Clone + Send + Sync + 'static {
    type Response: Send + Sync + 'static;

    fn set_path(&mut self, request_id: RequestId, path: NetworkPath);

    async fn send_via(&self, transport: &dyn OcppTransport) -> SendResult;

    async fn send_response_via(response: &Self::Response, transport: &dyn OcppTransport) -> SendResult;
}

#[async_trait]
impl Relayed for JsonRequest {
    type Response = JsonResponse;

    fn set_path(&mut self, request_id: RequestId, path: NetworkPath) {
        self.request_id = request_id;
        self.network_path = path;
    }

    async fn send_via(&self, transport: &dyn OcppTransport) -> SendResult {
        transport.send_json_request(self).await
    }

    async fn send_response_via(response: &JsonResponse, transport: &dyn OcppTransport) -> SendResult {
        transport.send_json_response(response).await
    }
}

#[async_trait]
impl Relayed for BinaryRequest {
    type Response = BinaryResponse;

    fn set_path(&mut self, request_id: RequestId, path: NetworkPath) {
        self.request_id = request_id;
        self.network_path = path;
    }

    async fn send_via(&self, transport: &dyn OcppTransport) -> SendResult {
        transport.send_binary_request(self).await
    }

    async fn send_response_via(response: &BinaryResponse, transport: &dyn OcppTransport) -> SendResult {
        transport.send_binary_response(response).await
    }
}

/// A response or error travelling back towards a requester
#[async_trait]
pub(crate) trait Answer: Clone + Send + Sync + 'static {
    fn request_id(&self) -> &RequestId;

    fn destination(&self) -> &NodeId;

    fn networking_mode(&self) -> NetworkingMode;

    fn readdress(&mut self, destination: NodeId, path: NetworkPath);

    /// Hand to the correlation engine; false when nothing waits for it
    fn deliver(self, correlation: &CorrelationEngine) -> bool;

    async fn send_via(&self, transport: &dyn OcppTransport) -> SendResult;
}

macro_rules! answer {
    ($ty:ty, $deliver:ident, $send:ident) => {
        #[async_trait]
        impl Answer for $ty {
            fn request_id(&self) -> &RequestId {
                &self.request_id
            }

            fn destination(&self) -> &NodeId {
                &self.destination
            }

            fn networking_mode(&self) -> NetworkingMode {
                self.networking_mode
            }

            fn readdress(&mut self, destination: NodeId, path: NetworkPath) {
                self.destination = destination;
                self.network_path = path;
            }

            fn deliver(self, correlation: &CorrelationEngine) -> bool {
                correlation.$deliver(self)
            }

            async fn send_via(&self, transport: &dyn OcppTransport) -> SendResult {
                transport.$send(self).await
            }
        }
    };
}

answer!(JsonResponse, receive_json_response, send_json_response);
answer!(JsonError, receive_json_error, send_json_error);
answer!(BinaryResponse, receive_binary_response, send_binary_response);

/// A relayed request awaiting its answer
#[derive(Debug, Clone)]
pub struct ForwardedRequest {
    /// Link the request arrived on
    pub link: Link,
    /// Original requester
    pub source: NodeId,
    /// Path as sent to the next hop
    pub network_path: NetworkPath,
    pub action: String,
    pub forwarded_at: DateTime<Utc>,
}

/// Concurrent table of relayed requests
pub struct ForwardedRequests {
    records: DashMap<RequestId, ForwardedRequest>,
    retention: Duration,
}

impl ForwardedRequests {
    pub fn new(retention: Duration) -> Self {
        Self {
            records: DashMap::new(),
            retention,
        }
    }

    /// Remember a relayed request.
    ///
    /// A retransmission from the same source replaces its record; an id
    /// already in flight for a different source is refused and the existing
    /// record is kept.
    pub fn record(&self, request_id: RequestId, record: ForwardedRequest) -> Result<(), NodeId> {
        match self.records.entry(request_id) {
            Entry::Occupied(mut existing) => {
                if existing.get().source != record.source {
                    return Err(existing.get().source.clone());
                }
                existing.insert(record);
                Ok(())
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    /// Remove and return the record answered by `request_id`
    pub fn take(&self, request_id: &RequestId) -> Option<ForwardedRequest> {
        self.records.remove(request_id).map(|(_, record)| record)
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.records.contains_key(request_id)
    }

    /// Drop records older than the retention; returns how many were removed
    pub fn sweep(&self) -> usize {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now() - retention;
        let before = self.records.len();
        self.records.retain(|id, record| {
            let keep = record.forwarded_at > cutoff;
            if !keep {
                debug!("Forgetting unanswered {} {} from {}", record.action, id, record.source);
            }
            keep
        });
        before.saturating_sub(self.records.len())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

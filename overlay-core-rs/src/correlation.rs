//! Request/response correlation
//!
//! Every request this node originates is registered by request id before it
//! is handed to a transport. The receive path completes the entry exactly once
//! with the first matching response or error; the waiting caller completes it
//! itself on deadline or cancellation. Whoever removes the entry from the map
//! owns the terminal outcome, so late or duplicate arrivals are unmatched.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::messages::*;
use crate::types::{NodeId, RequestId, ResultCode, SendResult};

/// Request ids issued by a node start here, above ids peers typically pick
pub const REQUEST_ID_OFFSET: u64 = 100_000;

/// Default time to wait for a response
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A request handed to a transport
#[derive(Debug, Clone)]
pub enum SentRequest {
    Json(JsonRequest),
    Binary(BinaryRequest),
}

impl SentRequest {
    fn routable(&self) -> &dyn Routable {
        match self {
            SentRequest::Json(r) => r,
            SentRequest::Binary(r) => r,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        self.routable().request_id()
    }

    pub fn destination(&self) -> &NodeId {
        self.routable().destination()
    }

    pub fn action(&self) -> &str {
        self.routable().action()
    }

    pub fn timeout(&self) -> Option<Duration> {
        match self {
            SentRequest::Json(r) => r.timeout,
            SentRequest::Binary(r) => r.timeout,
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        match self {
            SentRequest::Json(r) => &r.cancellation,
            SentRequest::Binary(r) => &r.cancellation,
        }
    }
}

/// How a request ended
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    JsonResponse(JsonResponse),
    BinaryResponse(BinaryResponse),
    JsonError(JsonError),
    /// Ended locally without an answer from the remote
    Failed { code: ResultCode, description: String },
}

/// Terminal state of a node-originated request
#[derive(Debug, Clone)]
pub struct SendRequestState {
    pub request_id: RequestId,
    pub destination: NodeId,
    pub sent_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub request: SentRequest,
    pub outcome: RequestOutcome,
}

impl SendRequestState {
    /// Terminal state for a request that never reached a transport
    pub fn failed(request: SentRequest, code: ResultCode, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            request_id: request.request_id().clone(),
            destination: request.destination().clone(),
            sent_at: now,
            deadline: now,
            request,
            outcome: RequestOutcome::Failed {
                code,
                description: description.into(),
            },
        }
    }

    pub fn result_code(&self) -> ResultCode {
        match &self.outcome {
            RequestOutcome::JsonResponse(_) | RequestOutcome::BinaryResponse(_) => ResultCode::Ok,
            RequestOutcome::JsonError(error) if error.relay_result() == Some(RESULT_FILTERED) => {
                ResultCode::Filtered
            }
            RequestOutcome::JsonError(_) => ResultCode::RemoteError,
            RequestOutcome::Failed { code, .. } => *code,
        }
    }

    pub fn json_response(&self) -> Option<&JsonResponse> {
        match &self.outcome {
            RequestOutcome::JsonResponse(response) => Some(response),
            _ => None,
        }
    }

    pub fn binary_response(&self) -> Option<&BinaryResponse> {
        match &self.outcome {
            RequestOutcome::BinaryResponse(response) => Some(response),
            _ => None,
        }
    }

    pub fn json_error(&self) -> Option<&JsonError> {
        match &self.outcome {
            RequestOutcome::JsonError(error) => Some(error),
            _ => None,
        }
    }
}

/// Bookkeeping for one in-flight request
struct PendingEntry {
    destination: NodeId,
    action: String,
    sent_at: DateTime<Utc>,
    completion: oneshot::Sender<RequestOutcome>,
}

/// Snapshot of an in-flight request
#[derive(Debug, Clone)]
pub struct PendingInfo {
    pub request_id: RequestId,
    pub destination: NodeId,
    pub action: String,
    pub sent_at: DateTime<Utc>,
}

/// Removes the entry if the waiting future is dropped early
struct PendingGuard<'a> {
    pending: &'a DashMap<RequestId, PendingEntry>,
    request_id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

enum Wake {
    Completed(Result<RequestOutcome, oneshot::error::RecvError>),
    Deadline,
    Cancelled,
}

/// Tracks outstanding requests and matches answers to them
pub struct CorrelationEngine {
    next_id: AtomicU64,
    pending: DashMap<RequestId, PendingEntry>,
    default_timeout: Duration,
}

impl CorrelationEngine {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(REQUEST_ID_OFFSET),
            pending: DashMap::new(),
            default_timeout,
        }
    }

    /// Next id for a request originated by this node
    pub fn next_request_id(&self) -> RequestId {
        RequestId::from(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Transmit `request` with `transmit` and wait for its terminal outcome
    pub async fn send_and_wait<F, Fut>(&self, request: SentRequest, transmit: F) -> SendRequestState
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SendResult>,
    {
        let request_id = request.request_id().clone();
        let timeout = request.timeout().unwrap_or(self.default_timeout);
        let sent_at = Utc::now();
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| sent_at.checked_add_signed(t))
            .unwrap_or(sent_at);
        let wake_at = Instant::now() + timeout;

        let (completion, mut rx) = oneshot::channel();
        match self.pending.entry(request_id.clone()) {
            Entry::Occupied(_) => {
                warn!("Request id {} is already in flight", request_id);
                return SendRequestState::failed(request, ResultCode::InternalError, "request id already in flight");
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry {
                    destination: request.destination().clone(),
                    action: request.action().to_string(),
                    sent_at,
                    completion,
                });
            }
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id: request_id.clone(),
        };

        let result = transmit().await;
        if !result.is_success() {
            self.pending.remove(&request_id);
            debug!("Request {} to {} not sent: {:?}", request_id, request.destination(), result);
            return SendRequestState {
                request_id,
                destination: request.destination().clone(),
                sent_at,
                deadline,
                request,
                outcome: RequestOutcome::Failed {
                    code: result.into(),
                    description: format!("transmission result {:?}", result),
                },
            };
        }

        let cancellation = request.cancellation().clone();
        let wake = tokio::select! {
            outcome = &mut rx => Wake::Completed(outcome),
            _ = tokio::time::sleep_until(wake_at) => Wake::Deadline,
            _ = cancellation.cancelled() => Wake::Cancelled,
        };

        let outcome = match wake {
            Wake::Completed(Ok(outcome)) => outcome,
            Wake::Completed(Err(_)) => RequestOutcome::Failed {
                code: ResultCode::InternalError,
                description: "completion dropped".to_string(),
            },
            Wake::Deadline => self.complete_locally(&request_id, rx, ResultCode::Timeout).await,
            Wake::Cancelled => self.complete_locally(&request_id, rx, ResultCode::Cancelled).await,
        };

        SendRequestState {
            request_id,
            destination: request.destination().clone(),
            sent_at,
            deadline,
            request,
            outcome,
        }
    }

    /// Finish a request on deadline or cancellation, unless an answer got there first
    async fn complete_locally(
        &self,
        request_id: &RequestId,
        rx: oneshot::Receiver<RequestOutcome>,
        code: ResultCode,
    ) -> RequestOutcome {
        if self.pending.remove(request_id).is_some() {
            debug!("Request {} ended with {:?}", request_id, code);
            return RequestOutcome::Failed {
                code,
                description: format!("{:?}", code),
            };
        }

        // The receive path removed the entry and is about to deliver
        rx.await.unwrap_or(RequestOutcome::Failed {
            code,
            description: format!("{:?}", code),
        })
    }

    fn complete(&self, request_id: &RequestId, outcome: RequestOutcome) -> bool {
        match self.pending.remove(request_id) {
            Some((_, entry)) => {
                debug!(
                    "Matched answer for {} ({} to {}, sent {})",
                    request_id, entry.action, entry.destination, entry.sent_at
                );
                if entry.completion.send(outcome).is_err() {
                    debug!("Waiter for {} is gone", request_id);
                }
                true
            }
            None => {
                debug!("Unmatched answer for request {}", request_id);
                false
            }
        }
    }

    /// Deliver a JSON response; false when nothing is waiting for it
    pub fn receive_json_response(&self, response: JsonResponse) -> bool {
        let request_id = response.request_id.clone();
        self.complete(&request_id, RequestOutcome::JsonResponse(response))
    }

    /// Deliver a binary response; false when nothing is waiting for it
    pub fn receive_binary_response(&self, response: BinaryResponse) -> bool {
        let request_id = response.request_id.clone();
        self.complete(&request_id, RequestOutcome::BinaryResponse(response))
    }

    /// Deliver a JSON error; false when nothing is waiting for it
    pub fn receive_json_error(&self, error: JsonError) -> bool {
        let request_id = error.request_id.clone();
        self.complete(&request_id, RequestOutcome::JsonError(error))
    }

    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.pending.contains_key(request_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_requests(&self) -> Vec<PendingInfo> {
        self.pending
            .iter()
            .map(|entry| PendingInfo {
                request_id: entry.key().clone(),
                destination: entry.destination.clone(),
                action: entry.action.clone(),
                sent_at: entry.sent_at,
            })
            .collect()
    }
}

impl Default for CorrelationEngine {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn request(engine: &CorrelationEngine, timeout: Duration) -> JsonRequest {
        JsonRequest::new(engine.next_request_id(), NodeId::csms(), "Heartbeat", json!({}))
            .with_timeout(timeout)
    }

    /// Wait until `id` is registered so the test can answer it
    async fn until_pending(engine: &CorrelationEngine, id: &RequestId) {
        while !engine.is_pending(id) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[test]
    fn test_request_ids_start_at_offset() {
        let engine = CorrelationEngine::default();
        assert_eq!(engine.next_request_id(), RequestId::from(REQUEST_ID_OFFSET));
        assert_eq!(engine.next_request_id(), RequestId::from(REQUEST_ID_OFFSET + 1));
    }

    #[test]
    fn test_request_ids_unique_across_threads() {
        let engine = Arc::new(CorrelationEngine::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                std::thread::spawn(move || (0..500).map(|_| engine.next_request_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[tokio::test]
    async fn test_response_completes_request() {
        let engine = Arc::new(CorrelationEngine::default());
        let req = request(&engine, Duration::from_secs(5));
        let id = req.request_id.clone();

        let responder = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move {
                until_pending(&engine, &id).await;
                engine.receive_json_response(JsonResponse::new(id, NodeId::zero(), json!({"currentTime": "now"})))
            })
        };

        let state = engine
            .send_and_wait(SentRequest::Json(req), || async { SendResult::Success })
            .await;

        assert!(responder.await.unwrap());
        assert_eq!(state.result_code(), ResultCode::Ok);
        assert_eq!(state.json_response().unwrap().payload["currentTime"], "now");
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_first_answer_wins() {
        let engine = Arc::new(CorrelationEngine::default());
        let req = request(&engine, Duration::from_secs(5));
        let id = req.request_id.clone();

        let responder = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move {
                until_pending(&engine, &id).await;
                let first = engine.receive_json_response(JsonResponse::new(id.clone(), NodeId::zero(), json!({"n": 1})));
                let duplicate = engine.receive_json_response(JsonResponse::new(id.clone(), NodeId::zero(), json!({"n": 2})));
                let late_error = engine.receive_json_error(JsonError::new(
                    id,
                    NodeId::zero(),
                    ErrorCode::InternalError,
                    "late",
                ));
                (first, duplicate, late_error)
            })
        };

        let state = engine
            .send_and_wait(SentRequest::Json(req), || async { SendResult::Success })
            .await;

        assert_eq!(responder.await.unwrap(), (true, false, false));
        assert_eq!(state.json_response().unwrap().payload["n"], 1);
    }

    #[tokio::test]
    async fn test_timeout_is_bounded() {
        let engine = CorrelationEngine::default();
        let req = request(&engine, Duration::from_millis(100));

        let started = std::time::Instant::now();
        let state = engine
            .send_and_wait(SentRequest::Json(req), || async { SendResult::Success })
            .await;
        let elapsed = started.elapsed();

        assert_eq!(state.result_code(), ResultCode::Timeout);
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(100 + 25 + 100));
        assert_eq!(engine.pending_count(), 0);
        assert!(!engine.receive_json_response(JsonResponse::new(state.request_id, NodeId::zero(), json!({}))));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_wait() {
        let engine = CorrelationEngine::default();
        let token = CancellationToken::new();
        let req = request(&engine, Duration::from_secs(30)).with_cancellation(token.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let started = std::time::Instant::now();
        let state = engine
            .send_and_wait(SentRequest::Json(req), || async { SendResult::Success })
            .await;

        assert_eq!(state.result_code(), ResultCode::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_transmission_is_not_pending() {
        let engine = CorrelationEngine::default();

        let state = engine
            .send_and_wait(SentRequest::Json(request(&engine, Duration::from_secs(5))), || async {
                SendResult::UnknownClient
            })
            .await;
        assert_eq!(state.result_code(), ResultCode::UnknownClient);

        let state = engine
            .send_and_wait(SentRequest::Json(request(&engine, Duration::from_secs(5))), || async {
                SendResult::TransmissionFailed
            })
            .await;
        assert_eq!(state.result_code(), ResultCode::TransmissionFailed);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_filtered_error_maps_to_filtered() {
        let engine = Arc::new(CorrelationEngine::default());
        let req = request(&engine, Duration::from_secs(5));
        let id = req.request_id.clone();

        {
            let engine = engine.clone();
            tokio::spawn(async move {
                until_pending(&engine, &id).await;
                engine.receive_json_error(
                    JsonError::new(id, NodeId::zero(), ErrorCode::SecurityError, "Filtered")
                        .with_details(json!({ RESULT_DETAIL: RESULT_FILTERED })),
                );
            });
        }

        let state = engine
            .send_and_wait(SentRequest::Json(req), || async { SendResult::Success })
            .await;
        assert_eq!(state.result_code(), ResultCode::Filtered);
    }

    #[test]
    fn test_unexpected_answer_is_unmatched() {
        let engine = CorrelationEngine::default();
        let response = BinaryResponse::new(RequestId::from("ghost"), NodeId::zero(), bytes::Bytes::new());
        assert!(!engine.receive_binary_response(response));
    }
}

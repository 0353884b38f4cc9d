//! Forwarding decisions for relayed requests
//!
//! A networking node consults the pipeline for every request that is addressed
//! to some other node. Filters are registered per action; actions without a
//! filter get the pipeline's default result.
//!
//! ```text
//!   request ──► filter(action)? ──► Forward ──► append own id, resolve, send
//!                                 ├► Replace ──► send the replacement instead
//!                                 ├► Reject  ──► reply to the sender
//!                                 └► Drop    ──► discard
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tracing::debug;

use crate::messages::*;

/// What to do with a relayed request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardingResult {
    #[default]
    Forward,
    Reject,
    Drop,
    Replace,
}

/// Reply a filter synthesizes for a rejected request
#[derive(Debug, Clone)]
pub enum ForwardingReply<Resp> {
    Response(Resp),
    Error(JsonError),
}

/// Outcome of running a request through the pipeline
#[derive(Debug, Clone)]
pub struct ForwardingDecision<Req, Resp> {
    pub request: Req,
    pub result: ForwardingResult,
    pub replacement: Option<Req>,
    pub reply: Option<ForwardingReply<Resp>>,
}

impl<Req, Resp> ForwardingDecision<Req, Resp> {
    pub fn forward(request: Req) -> Self {
        Self::with_result(request, ForwardingResult::Forward)
    }

    /// Reject with the default `SecurityError` reply
    pub fn reject(request: Req) -> Self {
        Self::with_result(request, ForwardingResult::Reject)
    }

    /// Reject with a reply of the filter's choosing
    pub fn reject_with(request: Req, reply: ForwardingReply<Resp>) -> Self {
        Self {
            reply: Some(reply),
            ..Self::with_result(request, ForwardingResult::Reject)
        }
    }

    pub fn drop(request: Req) -> Self {
        Self::with_result(request, ForwardingResult::Drop)
    }

    pub fn replace(request: Req, replacement: Req) -> Self {
        Self {
            replacement: Some(replacement),
            ..Self::with_result(request, ForwardingResult::Replace)
        }
    }

    fn with_result(request: Req, result: ForwardingResult) -> Self {
        Self {
            request,
            result,
            replacement: None,
            reply: None,
        }
    }

    /// The request that goes to the next hop, if any
    pub fn outbound(&self) -> Option<&Req> {
        match self.result {
            ForwardingResult::Forward => Some(&self.request),
            ForwardingResult::Replace => self.replacement.as_ref().or(Some(&self.request)),
            ForwardingResult::Reject | ForwardingResult::Drop => None,
        }
    }
}

/// Error sent back for a rejected request when the filter supplied no reply
pub fn filtered_error(request: &impl Routable) -> JsonError {
    JsonError::for_request(request, ErrorCode::SecurityError, "Request filtered by networking node")
        .with_details(json!({ RESULT_DETAIL: RESULT_FILTERED }))
}

/// Decides the fate of one relayed request
pub trait ForwardingFilter<Req, Resp>: Send + Sync {
    fn decide(&self, request: Req) -> ForwardingDecision<Req, Resp>;
}

impl<Req, Resp, F> ForwardingFilter<Req, Resp> for F
where
    F: Fn(Req) -> ForwardingDecision<Req, Resp> + Send + Sync,
{
    fn decide(&self, request: Req) -> ForwardingDecision<Req, Resp> {
        self(request)
    }
}

/// Per-action filter registry
pub struct ForwardingPipeline<Req, Resp> {
    filters: DashMap<String, Arc<dyn ForwardingFilter<Req, Resp>>>,
    default_result: ForwardingResult,
}

impl<Req: Routable, Resp> ForwardingPipeline<Req, Resp> {
    /// `default_result` applies to actions without a filter; `Replace` has
    /// nothing to replace with and behaves like `Forward`
    pub fn new(default_result: ForwardingResult) -> Self {
        Self {
            filters: DashMap::new(),
            default_result,
        }
    }

    pub fn register(&self, action: impl Into<String>, filter: Arc<dyn ForwardingFilter<Req, Resp>>) {
        self.filters.insert(action.into(), filter);
    }

    pub fn unregister(&self, action: &str) -> bool {
        self.filters.remove(action).is_some()
    }

    pub fn default_result(&self) -> ForwardingResult {
        self.default_result
    }

    pub fn decide(&self, request: Req) -> ForwardingDecision<Req, Resp> {
        // Clone the Arc out so no shard lock is held while the filter runs
        let filter = self.filters.get(request.action()).map(|f| f.value().clone());

        let decision = match filter {
            Some(filter) => filter.decide(request),
            None => match self.default_result {
                ForwardingResult::Forward | ForwardingResult::Replace => ForwardingDecision::forward(request),
                ForwardingResult::Reject => ForwardingDecision::reject(request),
                ForwardingResult::Drop => ForwardingDecision::drop(request),
            },
        };

        debug!(
            "Forwarding decision for {} ({}): {:?}",
            decision.request.request_id(),
            decision.request.action(),
            decision.result
        );
        decision
    }
}

impl<Req: Routable, Resp> Default for ForwardingPipeline<Req, Resp> {
    fn default() -> Self {
        Self::new(ForwardingResult::Forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NetworkPath, NodeId, RequestId};
    use serde_json::json;

    type Pipeline = ForwardingPipeline<JsonRequest, JsonResponse>;
    type Decision = ForwardingDecision<JsonRequest, JsonResponse>;

    fn reset_request() -> JsonRequest {
        JsonRequest::new(RequestId::from("42"), NodeId::from("CS1"), "Reset", json!({"type": "Immediate"}))
            .with_path(NetworkPath::from_source(NodeId::csms()))
    }

    #[test]
    fn test_default_forwards() {
        let pipeline = Pipeline::default();
        let decision = pipeline.decide(reset_request());
        assert_eq!(decision.result, ForwardingResult::Forward);
        assert_eq!(decision.outbound().unwrap().action, "Reset");
    }

    #[test]
    fn test_default_reject_has_no_outbound() {
        let pipeline = Pipeline::new(ForwardingResult::Reject);
        let decision = pipeline.decide(reset_request());
        assert_eq!(decision.result, ForwardingResult::Reject);
        assert!(decision.outbound().is_none());
        assert!(decision.reply.is_none());
    }

    #[test]
    fn test_filter_per_action() {
        let pipeline = Pipeline::default();
        pipeline.register("Reset", Arc::new(|req: JsonRequest| -> Decision { Decision::reject(req) }));

        assert_eq!(pipeline.decide(reset_request()).result, ForwardingResult::Reject);

        let heartbeat = JsonRequest::new(RequestId::from("1"), NodeId::csms(), "Heartbeat", json!({}));
        assert_eq!(pipeline.decide(heartbeat).result, ForwardingResult::Forward);

        assert!(pipeline.unregister("Reset"));
        assert_eq!(pipeline.decide(reset_request()).result, ForwardingResult::Forward);
    }

    #[test]
    fn test_replace_sends_replacement() {
        let pipeline = Pipeline::default();
        pipeline.register(
            "Reset",
            Arc::new(|req: JsonRequest| -> Decision {
                let mut softened = req.clone();
                softened.payload = json!({"type": "OnIdle"});
                Decision::replace(req, softened)
            }),
        );

        let decision = pipeline.decide(reset_request());
        assert_eq!(decision.result, ForwardingResult::Replace);
        assert_eq!(decision.outbound().unwrap().payload["type"], "OnIdle");
        assert_eq!(decision.request.payload["type"], "Immediate");
    }

    #[test]
    fn test_filtered_error_targets_sender() {
        let error = filtered_error(&reset_request());
        assert_eq!(error.error_code, ErrorCode::SecurityError);
        assert_eq!(error.destination, NodeId::csms());
        assert_eq!(error.relay_result(), Some(RESULT_FILTERED));
    }
}

//! OCPP request, response and error envelopes
//!
//! Envelopes carry the routing metadata the core needs (id, destination,
//! network path, mode) around an opaque payload. JSON envelopes hold a
//! `serde_json::Value`, binary envelopes hold raw bytes.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::types::{EventTrackingId, NetworkPath, NetworkingMode, NodeId, RequestId};

/// OCPP-J message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }
}

/// OCPP RPC framework error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl ErrorCode {
    /// Parse a wire error code; unknown codes degrade to `GenericError`
    pub fn parse(code: &str) -> Self {
        serde_json::from_value(Value::String(code.to_string())).unwrap_or(ErrorCode::GenericError)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Key in `error_details` naming the relay-side result of a refused request
pub const RESULT_DETAIL: &str = "result";

/// `RESULT_DETAIL` value of a request vetoed by a forwarding filter
pub const RESULT_FILTERED: &str = "Filtered";

/// `RESULT_DETAIL` value of a request a relay had no route for
pub const RESULT_UNKNOWN_CLIENT: &str = "UnknownClient";

/// Access to the routing header shared by every request envelope
pub trait Routable {
    fn request_id(&self) -> &RequestId;
    fn action(&self) -> &str;
    fn destination(&self) -> &NodeId;
    fn network_path(&self) -> &NetworkPath;
}

/// JSON CALL
#[derive(Debug, Clone)]
pub struct JsonRequest {
    pub request_id: RequestId,
    pub destination: NodeId,
    pub network_path: NetworkPath,
    pub networking_mode: NetworkingMode,
    pub action: String,
    pub payload: Value,
    pub timeout: Option<Duration>,
    pub cancellation: CancellationToken,
    pub event_tracking_id: EventTrackingId,
}

impl JsonRequest {
    pub fn new(
        request_id: RequestId,
        destination: NodeId,
        action: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            request_id,
            destination,
            network_path: NetworkPath::empty(),
            networking_mode: NetworkingMode::Standard,
            action: action.into(),
            payload,
            timeout: None,
            cancellation: CancellationToken::new(),
            event_tracking_id: EventTrackingId::new(),
        }
    }

    pub fn with_path(mut self, path: NetworkPath) -> Self {
        self.network_path = path;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

impl Routable for JsonRequest {
    fn request_id(&self) -> &RequestId {
        &self.request_id
    }
    fn action(&self) -> &str {
        &self.action
    }
    fn destination(&self) -> &NodeId {
        &self.destination
    }
    fn network_path(&self) -> &NetworkPath {
        &self.network_path
    }
}

/// JSON CALLRESULT
#[derive(Debug, Clone)]
pub struct JsonResponse {
    pub request_id: RequestId,
    pub destination: NodeId,
    pub network_path: NetworkPath,
    pub networking_mode: NetworkingMode,
    pub payload: Value,
    pub event_tracking_id: EventTrackingId,
}

impl JsonResponse {
    pub fn new(request_id: RequestId, destination: NodeId, payload: Value) -> Self {
        Self {
            request_id,
            destination,
            network_path: NetworkPath::empty(),
            networking_mode: NetworkingMode::Standard,
            payload,
            event_tracking_id: EventTrackingId::new(),
        }
    }

    /// Response answering `request`, addressed to its source and carrying its path
    pub fn for_request(request: &impl Routable, payload: Value) -> Self {
        let destination = request.network_path().source().cloned().unwrap_or_default();
        Self::new(request.request_id().clone(), destination, payload)
            .with_path(request.network_path().clone())
    }

    pub fn with_path(mut self, path: NetworkPath) -> Self {
        self.network_path = path;
        self
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// JSON CALLERROR
#[derive(Debug, Clone)]
pub struct JsonError {
    pub request_id: RequestId,
    pub destination: NodeId,
    pub network_path: NetworkPath,
    pub networking_mode: NetworkingMode,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
    pub event_tracking_id: EventTrackingId,
}

impl JsonError {
    pub fn new(
        request_id: RequestId,
        destination: NodeId,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            destination,
            network_path: NetworkPath::empty(),
            networking_mode: NetworkingMode::Standard,
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
            event_tracking_id: EventTrackingId::new(),
        }
    }

    /// Error answering `request`, addressed to its source and carrying its path
    pub fn for_request(
        request: &impl Routable,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        let destination = request.network_path().source().cloned().unwrap_or_default();
        Self::new(request.request_id().clone(), destination, error_code, error_description)
            .with_path(request.network_path().clone())
    }

    pub fn with_path(mut self, path: NetworkPath) -> Self {
        self.network_path = path;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }

    /// Relay-side result recorded in the details, e.g. `"Filtered"`
    pub fn relay_result(&self) -> Option<&str> {
        self.error_details.get(RESULT_DETAIL).and_then(Value::as_str)
    }
}

/// Binary CALL
#[derive(Debug, Clone)]
pub struct BinaryRequest {
    pub request_id: RequestId,
    pub destination: NodeId,
    pub network_path: NetworkPath,
    pub networking_mode: NetworkingMode,
    pub action: String,
    pub payload: Bytes,
    pub timeout: Option<Duration>,
    pub cancellation: CancellationToken,
    pub event_tracking_id: EventTrackingId,
}

impl BinaryRequest {
    pub fn new(
        request_id: RequestId,
        destination: NodeId,
        action: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self {
            request_id,
            destination,
            network_path: NetworkPath::empty(),
            networking_mode: NetworkingMode::Standard,
            action: action.into(),
            payload,
            timeout: None,
            cancellation: CancellationToken::new(),
            event_tracking_id: EventTrackingId::new(),
        }
    }

    pub fn with_path(mut self, path: NetworkPath) -> Self {
        self.network_path = path;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Routable for BinaryRequest {
    fn request_id(&self) -> &RequestId {
        &self.request_id
    }
    fn action(&self) -> &str {
        &self.action
    }
    fn destination(&self) -> &NodeId {
        &self.destination
    }
    fn network_path(&self) -> &NetworkPath {
        &self.network_path
    }
}

/// Binary CALLRESULT
#[derive(Debug, Clone)]
pub struct BinaryResponse {
    pub request_id: RequestId,
    pub destination: NodeId,
    pub network_path: NetworkPath,
    pub networking_mode: NetworkingMode,
    pub payload: Bytes,
    pub event_tracking_id: EventTrackingId,
}

impl BinaryResponse {
    pub fn new(request_id: RequestId, destination: NodeId, payload: Bytes) -> Self {
        Self {
            request_id,
            destination,
            network_path: NetworkPath::empty(),
            networking_mode: NetworkingMode::Standard,
            payload,
            event_tracking_id: EventTrackingId::new(),
        }
    }

    /// Response answering `request`, addressed to its source and carrying its path
    pub fn for_request(request: &impl Routable, payload: Bytes) -> Self {
        let destination = request.network_path().source().cloned().unwrap_or_default();
        Self::new(request.request_id().clone(), destination, payload)
            .with_path(request.network_path().clone())
    }

    pub fn with_path(mut self, path: NetworkPath) -> Self {
        self.network_path = path;
        self
    }
}

/// Any decoded frame
#[derive(Debug, Clone)]
pub enum OcppFrame {
    JsonRequest(JsonRequest),
    JsonResponse(JsonResponse),
    JsonError(JsonError),
    BinaryRequest(BinaryRequest),
    BinaryResponse(BinaryResponse),
}

impl OcppFrame {
    pub fn request_id(&self) -> &RequestId {
        match self {
            OcppFrame::JsonRequest(r) => &r.request_id,
            OcppFrame::JsonResponse(r) => &r.request_id,
            OcppFrame::JsonError(e) => &e.request_id,
            OcppFrame::BinaryRequest(r) => &r.request_id,
            OcppFrame::BinaryResponse(r) => &r.request_id,
        }
    }

    pub fn network_path(&self) -> &NetworkPath {
        match self {
            OcppFrame::JsonRequest(r) => &r.network_path,
            OcppFrame::JsonResponse(r) => &r.network_path,
            OcppFrame::JsonError(e) => &e.network_path,
            OcppFrame::BinaryRequest(r) => &r.network_path,
            OcppFrame::BinaryResponse(r) => &r.network_path,
        }
    }

    pub fn networking_mode(&self) -> NetworkingMode {
        match self {
            OcppFrame::JsonRequest(r) => r.networking_mode,
            OcppFrame::JsonResponse(r) => r.networking_mode,
            OcppFrame::JsonError(e) => e.networking_mode,
            OcppFrame::BinaryRequest(r) => r.networking_mode,
            OcppFrame::BinaryResponse(r) => r.networking_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_code_parse() {
        assert_eq!(ErrorCode::parse("NotImplemented"), ErrorCode::NotImplemented);
        assert_eq!(ErrorCode::parse("SomethingElse"), ErrorCode::GenericError);
    }

    #[test]
    fn test_response_for_request_targets_source() {
        let path = NetworkPath::from_source(NodeId::from("CS001")).append(NodeId::from("NN1"));
        let request = JsonRequest::new(RequestId::from(7), NodeId::csms(), "Reset", json!({}))
            .with_path(path.clone());

        let response = JsonResponse::for_request(&request, json!({"status": "Accepted"}));
        assert_eq!(response.destination, NodeId::from("CS001"));
        assert_eq!(response.network_path, path);
        assert_eq!(response.request_id, RequestId::from(7));

        let error = JsonError::for_request(&request, ErrorCode::SecurityError, "Filtered")
            .with_details(json!({ RESULT_DETAIL: RESULT_FILTERED }));
        assert_eq!(error.relay_result(), Some(RESULT_FILTERED));
    }
}

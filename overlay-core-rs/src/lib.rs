//! Overlay Core Library
//!
//! Routing, correlation and forwarding core of an OCPP 2.1 networking node.
//! Transport-agnostic: routes are generic over the transport handle, payloads
//! are opaque JSON values or bytes.

pub mod types;
pub mod messages;
pub mod frame;
pub mod binary;
pub mod reachability;
pub mod correlation;
pub mod forwarding;
pub mod signature;

pub use types::*;
pub use messages::{
    BinaryRequest, BinaryResponse, ErrorCode, JsonError, JsonRequest, JsonResponse, MessageType,
    OcppFrame, Routable,
};
pub use frame::FrameError;
pub use reachability::{Reachability, ReachabilityTable, Resolution, RouteTarget};
pub use correlation::{CorrelationEngine, RequestOutcome, SendRequestState, SentRequest};
pub use forwarding::{ForwardingDecision, ForwardingFilter, ForwardingPipeline, ForwardingReply, ForwardingResult};
pub use signature::{Signature, SignatureError, SignaturePolicies, SignaturePolicy, VerificationStatus};

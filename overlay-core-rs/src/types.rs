//! Core types for OCPP networking nodes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a charging station, networking node or the CSMS
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Reserved id of the central system
    pub const CSMS: &'static str = "CSMS";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The sentinel id addressing the CSMS
    pub fn csms() -> Self {
        Self(Self::CSMS.to_string())
    }

    /// The null id, never routable
    pub fn zero() -> Self {
        Self(String::new())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Ordered record of the nodes an envelope has traversed.
///
/// The first element is the source of the exchange. An empty path means the
/// envelope travelled in standard mode and no hop was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkPath(Vec<NodeId>);

impl NetworkPath {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Path starting at `source`
    pub fn from_source(source: NodeId) -> Self {
        Self(vec![source])
    }

    /// New path with `hop` appended; the path itself is never mutated in place
    pub fn append(&self, hop: NodeId) -> Self {
        let mut hops = self.0.clone();
        hops.push(hop);
        Self(hops)
    }

    pub fn source(&self) -> Option<&NodeId> {
        self.0.first()
    }

    pub fn last(&self) -> Option<&NodeId> {
        self.0.last()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.0.contains(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        self.0.iter()
    }
}

impl From<Vec<NodeId>> for NetworkPath {
    fn from(hops: Vec<NodeId>) -> Self {
        Self(hops)
    }
}

impl fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hops: Vec<&str> = self.0.iter().map(NodeId::as_str).collect();
        write!(f, "[{}]", hops.join(" -> "))
    }
}

/// Addressing mode of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NetworkingMode {
    /// Classic point-to-point OCPP, no path on the wire
    #[default]
    Standard,
    /// Multi-hop addressing with destination and path on the wire
    OverlayNetwork,
}

/// OCPP message id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlates log lines and events belonging to one logical operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventTrackingId(String);

impl EventTrackingId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventTrackingId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventTrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of handing one frame to a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Success,
    /// The socket rejected the frame or the send failed
    TransmissionFailed,
    /// No connection is registered for the destination
    UnknownClient,
}

impl SendResult {
    pub fn is_success(self) -> bool {
        self == SendResult::Success
    }
}

/// Terminal result of a node-originated request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    UnknownClient,
    TransmissionFailed,
    Timeout,
    InternalError,
    /// A networking node on the way vetoed the request
    Filtered,
    Cancelled,
    /// The remote answered with a CALLERROR
    RemoteError,
}

impl From<SendResult> for ResultCode {
    fn from(result: SendResult) -> Self {
        match result {
            SendResult::Success => ResultCode::Ok,
            SendResult::TransmissionFailed => ResultCode::TransmissionFailed,
            SendResult::UnknownClient => ResultCode::UnknownClient,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_path_append() {
        let path = NetworkPath::from_source(NodeId::from("CS001"));
        let relayed = path.append(NodeId::from("NN1"));

        assert_eq!(path.len(), 1);
        assert_eq!(relayed.len(), 2);
        assert_eq!(relayed.source(), Some(&NodeId::from("CS001")));
        assert_eq!(relayed.last(), Some(&NodeId::from("NN1")));
        assert_eq!(relayed.to_string(), "[CS001 -> NN1]");
    }

    #[test]
    fn test_node_id_sentinels() {
        assert!(NodeId::zero().is_zero());
        assert!(!NodeId::csms().is_zero());
        assert_eq!(NodeId::csms().as_str(), "CSMS");
    }
}

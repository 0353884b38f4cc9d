//! Configuration for the networking node adapter
//!
//! Node-wide settings live in [`AdapterConfig`]; each outbound connection and
//! each listener gets its own [`ClientConfig`] / [`ServerConfig`].

use std::net::SocketAddr;
use std::time::Duration;

use overlay_core::{ForwardingResult, NetworkingMode, NodeId};

/// OCPP 2.1 WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp2.1";

/// Complete adapter configuration
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Identity of this node
    pub node_id: NodeId,

    /// Destination assumed for standard-mode requests received from downstream
    pub upstream_id: NodeId,

    /// Default time to wait for a response
    pub request_timeout: Duration,

    /// WebSocket ping interval on outbound connections
    pub heartbeat_interval: Duration,

    /// How long a relayed request is remembered while its answer is awaited
    pub forwarded_retention: Duration,

    /// Period of the route expiry and relay table sweep
    pub housekeeping_interval: Duration,

    /// Decision for relayed actions without a filter
    pub default_forwarding: ForwardingResult,

    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

/// Outbound connection configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base WebSocket URL; the node id is appended as the last path segment
    pub url: String,

    /// Identity presented to the remote
    pub node_id: NodeId,

    /// Identity of the remote
    pub remote_id: NodeId,

    /// Addressing mode used on this link
    pub networking_mode: NetworkingMode,

    /// Credentials for HTTP Basic authentication (optional)
    pub basic_auth: Option<BasicAuthConfig>,

    /// Initial reconnect delay
    pub reconnect_delay: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    pub max_reconnect_delay: Duration,

    /// WebSocket ping interval
    pub heartbeat_interval: Duration,
}

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,

    /// When set, peers must authenticate with Basic auth and the username is their identity
    pub basic_auth: Option<BasicAuthConfig>,
}

/// Shared-secret Basic authentication
#[derive(Clone)]
pub struct BasicAuthConfig {
    pub secret: String,
}

impl std::fmt::Debug for BasicAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuthConfig").field("secret", &"***").finish()
    }
}

impl BasicAuthConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        let request_timeout = Duration::from_secs(30);
        Self {
            node_id: NodeId::from("NN001"),
            upstream_id: NodeId::csms(),
            request_timeout,
            heartbeat_interval: Duration::from_secs(60),
            forwarded_retention: request_timeout,
            housekeeping_interval: Duration::from_secs(5),
            default_forwarding: ForwardingResult::Forward,
            event_capacity: 256,
        }
    }
}

impl AdapterConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Set the upstream destination for standard-mode requests
    pub fn with_upstream_id(mut self, upstream_id: impl Into<NodeId>) -> Self {
        self.upstream_id = upstream_id.into();
        self
    }

    /// Set the default request timeout; relay retention follows it
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self.forwarded_retention = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }

    pub fn with_default_forwarding(mut self, result: ForwardingResult) -> Self {
        self.default_forwarding = result;
        self
    }

    /// Client settings for a connection from this node to `remote_id` at `url`
    pub fn client(&self, url: impl Into<String>, remote_id: impl Into<NodeId>) -> ClientConfig {
        ClientConfig {
            heartbeat_interval: self.heartbeat_interval,
            ..ClientConfig::new(url, self.node_id.clone(), remote_id)
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, node_id: impl Into<NodeId>, remote_id: impl Into<NodeId>) -> Self {
        Self {
            url: url.into(),
            node_id: node_id.into(),
            remote_id: remote_id.into(),
            networking_mode: NetworkingMode::Standard,
            basic_auth: None,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(60),
        }
    }

    /// Use overlay addressing on this link
    pub fn with_overlay(mut self) -> Self {
        self.networking_mode = NetworkingMode::OverlayNetwork;
        self
    }

    pub fn with_basic_auth(mut self, secret: impl Into<String>) -> Self {
        self.basic_auth = Some(BasicAuthConfig::new(secret));
        self
    }

    pub fn with_reconnect(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }

    /// Full URL including the node id segment
    pub fn endpoint(&self) -> String {
        build_ocpp_url(&self.url, self.node_id.as_str())
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            basic_auth: None,
        }
    }

    pub fn with_basic_auth(mut self, secret: impl Into<String>) -> Self {
        self.basic_auth = Some(BasicAuthConfig::new(secret));
        self
    }
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, node_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), node_id)
}

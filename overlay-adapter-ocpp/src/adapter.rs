//! Networking node adapter
//!
//! Composition root tying transports, routing, correlation and forwarding
//! together.
//!
//! ## Architecture
//!
//! ```text
//!            CSMS / upstream NN
//!                  ▲ WebSocket (client)
//!                  │
//! ┌────────────────┴──────────────────────────────┐
//! │                OcppAdapter                    │
//! │  ┌──────────┐  ┌──────────────┐  ┌──────────┐ │
//! │  │ incoming │  │  forwarding  │  │ outgoing │ │
//! │  │ handlers │  │  filters     │  │ requests │ │
//! │  └──────────┘  └──────────────┘  └──────────┘ │
//! │  reachability │ correlation │ forwarded table │
//! └────────────────┬──────────────────────────────┘
//!                  │ WebSocket (server)
//!                  ▼
//!        Charging stations / downstream NNs
//! ```
//!
//! ## Message Flow
//!
//! 1. A transport decodes a frame and hands it to the dispatch task, which
//!    gives every frame its own task
//! 2. Requests for this node go to the registered handler
//! 3. Requests for other nodes pass the forwarding filters and are relayed
//!    to the next hop with this node appended to their path
//! 4. Answers complete a pending request or travel back along the link the
//!    relayed request arrived on

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use overlay_core::forwarding::filtered_error;
use overlay_core::messages::{RESULT_DETAIL, RESULT_UNKNOWN_CLIENT};
use overlay_core::signature::SignatureError;
use overlay_core::{
    BinaryRequest, BinaryResponse, CorrelationEngine, ErrorCode, ForwardingFilter, ForwardingPipeline,
    ForwardingReply, ForwardingResult, JsonError, JsonRequest, JsonResponse, NetworkPath, NetworkingMode,
    NodeId, OcppFrame, Reachability, ReachabilityTable, RequestId, ResultCode, Routable, RouteTarget,
    SendRequestState, SendResult, SentRequest, SignaturePolicies, VerificationStatus,
};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AdapterConfig, ClientConfig, ServerConfig};
use crate::error::AdapterError;
use crate::events::{AdapterEvent, EventBus, EventKind, Facet};
use crate::handlers::{BinaryReply, BinaryRequestHandler, Reply, RequestHandler};
use crate::ocpp::{
    Inbound, InboundReceiver, InboundSender, Link, OcppTransport, TransportKind, WebSocketClient,
    WebSocketServer,
};
use crate::relay::{Answer, ForwardedRequest, ForwardedRequests, Relayed};

/// Capacity of the channel between transports and the dispatch task
const INBOUND_CAPACITY: usize = 1024;

/// Route to a transport handle
pub type Route = RouteTarget<Arc<dyn OcppTransport>>;

/// The networking node adapter
#[derive(Clone)]
pub struct OcppAdapter {
    inner: Arc<AdapterInner>,
}

struct AdapterInner {
    config: AdapterConfig,
    reachability: ReachabilityTable<Arc<dyn OcppTransport>>,
    correlation: CorrelationEngine,
    forwarded: ForwardedRequests,
    json_filters: ForwardingPipeline<JsonRequest, JsonResponse>,
    binary_filters: ForwardingPipeline<BinaryRequest, BinaryResponse>,
    handlers: DashMap<String, Arc<dyn RequestHandler>>,
    binary_handlers: DashMap<String, Arc<dyn BinaryRequestHandler>>,
    signatures: SignaturePolicies,
    servers: RwLock<Vec<Arc<WebSocketServer>>>,
    clients: DashMap<NodeId, Arc<WebSocketClient>>,
    events: EventBus,
    inbound: InboundSender,
    shutdown: CancellationToken,
}

impl OcppAdapter {
    /// Create the adapter and start its dispatch and housekeeping tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: AdapterConfig) -> Self {
        let (inbound, rx) = mpsc::channel(INBOUND_CAPACITY);
        info!("Starting networking node {}", config.node_id);

        let inner = Arc::new(AdapterInner {
            reachability: ReachabilityTable::new(),
            correlation: CorrelationEngine::new(config.request_timeout),
            forwarded: ForwardedRequests::new(config.forwarded_retention),
            json_filters: ForwardingPipeline::new(config.default_forwarding),
            binary_filters: ForwardingPipeline::new(config.default_forwarding),
            handlers: DashMap::new(),
            binary_handlers: DashMap::new(),
            signatures: SignaturePolicies::new(),
            servers: RwLock::new(Vec::new()),
            clients: DashMap::new(),
            events: EventBus::new(config.event_capacity),
            inbound,
            shutdown: CancellationToken::new(),
            config,
        });

        tokio::spawn(inner.clone().dispatch_loop(rx));
        tokio::spawn(inner.clone().housekeeping());

        Self { inner }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.config.node_id
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.inner.config
    }

    /// Handlers for requests addressed to this node
    pub fn incoming(&self) -> Incoming<'_> {
        Incoming { inner: &self.inner }
    }

    /// Requests, responses and errors originated by this node
    pub fn outgoing(&self) -> Outgoing<'_> {
        Outgoing { inner: &self.inner }
    }

    /// Filters for requests relayed through this node
    pub fn forwarding(&self) -> Forwarding<'_> {
        Forwarding { inner: &self.inner }
    }

    pub fn signatures(&self) -> &SignaturePolicies {
        &self.inner.signatures
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AdapterEvent> {
        self.inner.events.subscribe()
    }

    /// Accept connections on `config.listen_addr`
    pub async fn listen(&self, config: ServerConfig) -> Result<Arc<WebSocketServer>, AdapterError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(AdapterError::ShuttingDown);
        }

        let server = WebSocketServer::bind(
            self.inner.config.node_id.clone(),
            config,
            self.inner.inbound.clone(),
            self.inner.shutdown.child_token(),
        )
        .await?;

        self.inner.servers.write().push(server.clone());
        for destination in self.inner.reachability.destinations() {
            self.inner.sync_hub(&destination);
        }
        Ok(server)
    }

    /// Open a persistent connection and route its remote id over it
    pub fn connect(&self, config: ClientConfig) -> Result<Arc<WebSocketClient>, AdapterError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(AdapterError::ShuttingDown);
        }

        let remote = config.remote_id.clone();
        let client = WebSocketClient::connect(config, self.inner.inbound.clone(), self.inner.shutdown.child_token());
        if let Some(previous) = self.inner.clients.insert(remote.clone(), client.clone()) {
            info!("Replacing client connection to {}", remote);
            previous.close();
        }
        self.add_static_route(remote, RouteTarget::Client(client.clone()), 0, None);
        Ok(client)
    }

    pub fn client(&self, remote_id: &NodeId) -> Option<Arc<WebSocketClient>> {
        self.inner.clients.get(remote_id).map(|c| c.value().clone())
    }

    pub fn add_static_route(
        &self,
        destination: NodeId,
        target: Route,
        priority: u8,
        expires: Option<DateTime<Utc>>,
    ) {
        info!("Route to {} at priority {}", destination, priority);
        self.inner
            .reachability
            .add_static_route(destination.clone(), target, priority, expires);
        self.inner.sync_hub(&destination);
    }

    /// Reach `destination` through the node `hub`
    pub fn add_hub_route(&self, destination: NodeId, hub: NodeId, priority: u8) {
        self.add_static_route(destination, RouteTarget::Hub(hub), priority, None);
    }

    pub fn remove_static_route(&self, destination: &NodeId, hub: Option<&NodeId>, priority: Option<u8>) {
        self.inner.reachability.remove_static_route(destination, hub, priority);
        self.inner.sync_hub(destination);
    }

    pub fn routes(&self, destination: &NodeId) -> Vec<Reachability<Arc<dyn OcppTransport>>> {
        self.inner.reachability.routes(destination)
    }

    /// Transport the next frame for `destination` would go out on
    pub fn resolve(&self, destination: &NodeId) -> Option<Arc<dyn OcppTransport>> {
        self.inner.resolve_transport(destination)
    }

    pub fn pending_request_count(&self) -> usize {
        self.inner.correlation.pending_count()
    }

    /// Stop all transports and background tasks
    pub fn shutdown(&self) {
        info!("Shutting down networking node {}", self.inner.config.node_id);
        self.inner.shutdown.cancel();
    }
}

/// Registration of handlers for requests addressed to this node
pub struct Incoming<'a> {
    inner: &'a AdapterInner,
}

impl Incoming<'_> {
    pub fn register_handler(&self, action: impl Into<String>, handler: impl RequestHandler + 'static) {
        self.inner.handlers.insert(action.into(), Arc::new(handler));
    }

    pub fn register_binary_handler(&self, action: impl Into<String>, handler: impl BinaryRequestHandler + 'static) {
        self.inner.binary_handlers.insert(action.into(), Arc::new(handler));
    }

    pub fn unregister_handler(&self, action: &str) -> bool {
        let json = self.inner.handlers.remove(action).is_some();
        let binary = self.inner.binary_handlers.remove(action).is_some();
        json || binary
    }

    pub fn has_handler(&self, action: &str) -> bool {
        self.inner.handlers.contains_key(action) || self.inner.binary_handlers.contains_key(action)
    }
}

/// Messages originated by this node
pub struct Outgoing<'a> {
    inner: &'a AdapterInner,
}

impl Outgoing<'_> {
    /// Fresh request id, never one a relayed request is using
    pub fn next_request_id(&self) -> RequestId {
        loop {
            let id = self.inner.correlation.next_request_id();
            if !self.inner.forwarded.contains(&id) {
                return id;
            }
        }
    }

    /// Request from this node to `destination`
    pub fn request(&self, destination: impl Into<NodeId>, action: impl Into<String>, payload: Value) -> JsonRequest {
        JsonRequest::new(self.next_request_id(), destination.into(), action, payload)
            .with_path(NetworkPath::from_source(self.inner.config.node_id.clone()))
    }

    /// Build, send and await a JSON request
    pub async fn send_request(
        &self,
        destination: impl Into<NodeId>,
        action: impl Into<String>,
        payload: Value,
    ) -> SendRequestState {
        let request = self.request(destination, action, payload);
        self.send_json_request(request).await
    }

    pub async fn send_json_request(&self, mut request: JsonRequest) -> SendRequestState {
        let inner = self.inner;
        if request.network_path.is_empty() {
            request.network_path = NetworkPath::from_source(inner.config.node_id.clone());
        }
        if let Err(e) = inner.signatures.sign_payload(&request.action, &mut request.payload) {
            error!("Failed to sign {} {}: {}", request.action, request.request_id, e);
            return inner.finish(SendRequestState::failed(
                SentRequest::Json(request),
                ResultCode::InternalError,
                e.to_string(),
            ));
        }

        let Some(transport) = inner.resolve_transport(&request.destination) else {
            warn!("No route to {} for {}", request.destination, request.action);
            let description = format!("no route to {}", request.destination);
            return inner.finish(SendRequestState::failed(
                SentRequest::Json(request),
                ResultCode::UnknownClient,
                description,
            ));
        };

        inner.events.publish(
            Facet::Outgoing,
            EventKind::RequestSent {
                request_id: request.request_id.clone(),
                destination: request.destination.clone(),
                action: request.action.clone(),
            },
        );

        let wire = request.clone();
        let state = inner
            .correlation
            .send_and_wait(SentRequest::Json(request), || async move {
                transport.send_json_request(&wire).await
            })
            .await;
        inner.finish(state)
    }

    pub async fn send_binary_request(&self, mut request: BinaryRequest) -> SendRequestState {
        let inner = self.inner;
        if request.network_path.is_empty() {
            request.network_path = NetworkPath::from_source(inner.config.node_id.clone());
        }

        let Some(transport) = inner.resolve_transport(&request.destination) else {
            let description = format!("no route to {}", request.destination);
            return inner.finish(SendRequestState::failed(
                SentRequest::Binary(request),
                ResultCode::UnknownClient,
                description,
            ));
        };

        inner.events.publish(
            Facet::Outgoing,
            EventKind::RequestSent {
                request_id: request.request_id.clone(),
                destination: request.destination.clone(),
                action: request.action.clone(),
            },
        );

        let wire = request.clone();
        let state = inner
            .correlation
            .send_and_wait(SentRequest::Binary(request), || async move {
                transport.send_binary_request(&wire).await
            })
            .await;
        inner.finish(state)
    }

    /// Send a response routed by its destination
    pub async fn send_json_response(&self, mut response: JsonResponse) -> SendResult {
        if let Err(e) = self.inner.signatures.sign_payload("", &mut response.payload) {
            error!("Failed to sign response {}: {}", response.request_id, e);
            return SendResult::TransmissionFailed;
        }
        self.inner.send_routed(response).await
    }

    pub async fn send_json_error(&self, error: JsonError) -> SendResult {
        self.inner.send_routed(error).await
    }

    pub async fn send_binary_response(&self, response: BinaryResponse) -> SendResult {
        self.inner.send_routed(response).await
    }
}

/// Filters applied to requests relayed through this node
pub struct Forwarding<'a> {
    inner: &'a AdapterInner,
}

impl Forwarding<'_> {
    pub fn register_filter(
        &self,
        action: impl Into<String>,
        filter: Arc<dyn ForwardingFilter<JsonRequest, JsonResponse>>,
    ) {
        self.inner.json_filters.register(action, filter);
    }

    pub fn register_binary_filter(
        &self,
        action: impl Into<String>,
        filter: Arc<dyn ForwardingFilter<BinaryRequest, BinaryResponse>>,
    ) {
        self.inner.binary_filters.register(action, filter);
    }

    pub fn unregister_filter(&self, action: &str) -> bool {
        let json = self.inner.json_filters.unregister(action);
        let binary = self.inner.binary_filters.unregister(action);
        json || binary
    }

    pub fn default_result(&self) -> ForwardingResult {
        self.inner.json_filters.default_result()
    }

    /// Relayed requests still awaiting their answer
    pub fn in_flight(&self) -> usize {
        self.inner.forwarded.len()
    }
}

impl AdapterInner {
    fn is_local(&self, destination: &NodeId) -> bool {
        destination == &self.config.node_id
    }

    fn finish(&self, state: SendRequestState) -> SendRequestState {
        self.events.publish(
            Facet::Outgoing,
            EventKind::RequestCompleted {
                request_id: state.request_id.clone(),
                result: state.result_code(),
            },
        );
        state
    }

    /// Transport for the next hop towards `destination`
    fn resolve_transport(&self, destination: &NodeId) -> Option<Arc<dyn OcppTransport>> {
        if destination.is_zero() {
            return None;
        }

        let resolution = self.reachability.resolve_chain(destination);
        if let Some(route) = resolution.route {
            return route.target.transport().cloned();
        }
        if resolution.looped {
            return None;
        }

        // Directly connected peers need no static route
        self.servers
            .read()
            .iter()
            .find(|server| server.can_reach(destination) || server.can_reach(&resolution.terminal))
            .map(|server| server.clone() as Arc<dyn OcppTransport>)
    }

    /// Mirror the preferred hub for `destination` into every server
    fn sync_hub(&self, destination: &NodeId) {
        let now = Utc::now();
        let hub = self
            .reachability
            .routes(destination)
            .into_iter()
            .find(|route| !route.is_expired(now))
            .and_then(|route| route.target.hub().cloned());

        for server in self.servers.read().iter() {
            match &hub {
                Some(hub) => server.add_networking_hub(destination.clone(), hub.clone()),
                None => server.remove_networking_hub(destination),
            }
        }
    }

    /// Fill in what a standard-mode frame leaves out
    fn address_inbound(&self, mode: NetworkingMode, destination: &mut NodeId, path: &mut NetworkPath, link: &Link) {
        if mode == NetworkingMode::Standard || destination.is_zero() {
            *destination = match link.kind() {
                TransportKind::Server => self.config.upstream_id.clone(),
                TransportKind::Client => self.config.node_id.clone(),
            };
        }
        if path.is_empty() {
            *path = NetworkPath::from_source(link.peer.clone());
        }
    }

    /// Verify signatures on a payload; `None` when there is nothing to verify
    fn verify(&self, request_id: &RequestId, action: &str, payload: &Value) -> Option<Vec<VerificationStatus>> {
        let statuses = match self.signatures.verify_payload(action, payload) {
            Ok(statuses) => statuses?,
            Err(SignatureError::Malformed(reason)) => {
                warn!("Malformed signatures on {} {}: {}", action, request_id, reason);
                vec![VerificationStatus::Invalid]
            }
            Err(e) => {
                error!("Signature verification failed for {} {}: {}", action, request_id, e);
                vec![VerificationStatus::Invalid]
            }
        };

        self.events.publish(
            Facet::Incoming,
            EventKind::SignaturesVerified {
                request_id: request_id.clone(),
                action: action.to_string(),
                statuses: statuses.clone(),
            },
        );
        Some(statuses)
    }

    async fn dispatch_loop(self: Arc<Self>, mut rx: InboundReceiver) {
        loop {
            let inbound = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                inbound = rx.recv() => match inbound {
                    Some(inbound) => inbound,
                    None => break,
                },
            };

            match inbound {
                Inbound::Connected(link) => self.events.publish(
                    Facet::Incoming,
                    EventKind::Connected {
                        peer: link.peer.clone(),
                        transport: link.kind(),
                    },
                ),
                Inbound::Disconnected(link) => self.events.publish(
                    Facet::Incoming,
                    EventKind::Disconnected {
                        peer: link.peer.clone(),
                        transport: link.kind(),
                    },
                ),
                Inbound::Frame { frame, link } => self.clone().on_frame(frame, link),
            }
        }
        debug!("Dispatch loop of {} stopped", self.config.node_id);
    }

    /// Hand a frame to its own task so no peer can stall dispatch
    fn on_frame(self: Arc<Self>, frame: OcppFrame, link: Link) {
        match frame {
            OcppFrame::JsonRequest(request) => {
                tokio::spawn(async move { self.on_json_request(request, link).await });
            }
            OcppFrame::BinaryRequest(request) => {
                tokio::spawn(async move { self.on_binary_request(request, link).await });
            }
            OcppFrame::JsonResponse(response) => {
                self.events.publish(
                    Facet::Incoming,
                    EventKind::ResponseReceived {
                        request_id: response.request_id.clone(),
                    },
                );
                if self.correlation.is_pending(&response.request_id) {
                    self.verify(&response.request_id, "", &response.payload);
                }
                tokio::spawn(async move { self.on_answer(response).await });
            }
            OcppFrame::BinaryResponse(response) => {
                self.events.publish(
                    Facet::Incoming,
                    EventKind::ResponseReceived {
                        request_id: response.request_id.clone(),
                    },
                );
                tokio::spawn(async move { self.on_answer(response).await });
            }
            OcppFrame::JsonError(error) => {
                self.events.publish(
                    Facet::Incoming,
                    EventKind::ErrorReceived {
                        request_id: error.request_id.clone(),
                        code: error.error_code,
                    },
                );
                tokio::spawn(async move { self.on_answer(error).await });
            }
        }
    }

    async fn on_json_request(&self, mut request: JsonRequest, link: Link) {
        self.address_inbound(
            request.networking_mode,
            &mut request.destination,
            &mut request.network_path,
            &link,
        );
        self.publish_received(&request);

        if self.is_local(&request.destination) {
            self.handle_json(request, link).await;
        } else {
            self.relay(request, link, &self.json_filters).await;
        }
    }

    async fn on_binary_request(&self, mut request: BinaryRequest, link: Link) {
        self.address_inbound(
            request.networking_mode,
            &mut request.destination,
            &mut request.network_path,
            &link,
        );
        self.publish_received(&request);

        if self.is_local(&request.destination) {
            self.handle_binary(request, link).await;
        } else {
            self.relay(request, link, &self.binary_filters).await;
        }
    }

    fn publish_received(&self, request: &impl Routable) {
        self.events.publish(
            Facet::Incoming,
            EventKind::RequestReceived {
                request_id: request.request_id().clone(),
                action: request.action().to_string(),
                source: request.network_path().source().cloned().unwrap_or_default(),
            },
        );
    }

    /// Run the application handler for a JSON request addressed to this node
    async fn handle_json(&self, request: JsonRequest, link: Link) {
        if let Some(statuses) = self.verify(&request.request_id, &request.action, &request.payload) {
            if statuses.contains(&VerificationStatus::Invalid) {
                let error = JsonError::for_request(&request, ErrorCode::SecurityError, "Invalid message signature");
                self.reply_error(&link, error).await;
                return;
            }
        }

        let handler = self.handlers.get(&request.action).map(|h| h.value().clone());
        let reply = match handler {
            Some(handler) => handler.handle(request.clone()).await,
            None => {
                debug!("No handler for {}", request.action);
                Reply::error(ErrorCode::NotImplemented, format!("{} is not implemented", request.action))
            }
        };

        match reply {
            Reply::Response(mut payload) => {
                if let Err(e) = self.signatures.sign_payload(&request.action, &mut payload) {
                    error!("Failed to sign response to {}: {}", request.request_id, e);
                    let error = JsonError::for_request(&request, ErrorCode::InternalError, "Signing failed");
                    self.reply_error(&link, error).await;
                    return;
                }
                let response = JsonResponse::for_request(&request, payload);
                self.reply_response(&link, response).await;
            }
            Reply::Error {
                code,
                description,
                details,
            } => {
                let error = JsonError::for_request(&request, code, description).with_details(details);
                self.reply_error(&link, error).await;
            }
        }
    }

    /// Run the application handler for a binary request addressed to this node
    async fn handle_binary(&self, request: BinaryRequest, link: Link) {
        let handler = self.binary_handlers.get(&request.action).map(|h| h.value().clone());
        let reply = match handler {
            Some(handler) => handler.handle(request.clone()).await,
            None => BinaryReply::Error {
                code: ErrorCode::NotImplemented,
                description: format!("{} is not implemented", request.action),
            },
        };

        match reply {
            BinaryReply::Response(payload) => {
                let response = BinaryResponse::for_request(&request, payload);
                let result = link.transport.send_binary_response(&response).await;
                self.publish_sent(&response.request_id, &response.destination, result);
            }
            BinaryReply::Error { code, description } => {
                let error = JsonError::for_request(&request, code, description);
                self.reply_error(&link, error).await;
            }
        }
    }

    async fn reply_response(&self, link: &Link, response: JsonResponse) {
        let result = link.transport.send_json_response(&response).await;
        self.publish_sent(&response.request_id, &response.destination, result);
    }

    async fn reply_error(&self, link: &Link, error: JsonError) {
        let result = link.transport.send_json_error(&error).await;
        if result.is_success() {
            self.events.publish(
                Facet::Incoming,
                EventKind::ErrorSent {
                    request_id: error.request_id.clone(),
                    destination: error.destination.clone(),
                    code: error.error_code,
                },
            );
        } else {
            warn!("Failed to send error for {} to {}: {:?}", error.request_id, link.peer, result);
        }
    }

    fn publish_sent(&self, request_id: &RequestId, destination: &NodeId, result: SendResult) {
        if result.is_success() {
            self.events.publish(
                Facet::Incoming,
                EventKind::ResponseSent {
                    request_id: request_id.clone(),
                    destination: destination.clone(),
                },
            );
        } else {
            warn!("Failed to send response {} to {}: {:?}", request_id, destination, result);
        }
    }

    /// Relay a request addressed to another node
    async fn relay<R: Relayed>(&self, request: R, link: Link, pipeline: &ForwardingPipeline<R, R::Response>) {
        let own = &self.config.node_id;
        if request.network_path().contains(own) {
            warn!(
                "Routing loop: {} {} already passed {} ({})",
                request.action(),
                request.request_id(),
                own,
                request.network_path()
            );
            let error = JsonError::for_request(&request, ErrorCode::RpcFrameworkError, "Routing loop detected");
            self.reply_error(&link, error).await;
            return;
        }

        let decision = pipeline.decide(request);
        self.events.publish(
            Facet::Forwarding,
            EventKind::Forwarded {
                request_id: decision.request.request_id().clone(),
                action: decision.request.action().to_string(),
                result: decision.result,
            },
        );

        let outbound = match decision.outbound() {
            Some(outbound) => outbound.clone(),
            None => {
                match (decision.result, decision.reply) {
                    (ForwardingResult::Drop, _) => {
                        debug!("Dropped {} {}", decision.request.action(), decision.request.request_id());
                    }
                    (_, Some(ForwardingReply::Response(response))) => {
                        let result = R::send_response_via(&response, link.transport.as_ref()).await;
                        debug!("Rejected {} with a response: {:?}", decision.request.request_id(), result);
                    }
                    (_, Some(ForwardingReply::Error(error))) => self.reply_error(&link, error).await,
                    (_, None) => self.reply_error(&link, filtered_error(&decision.request)).await,
                }
                return;
            }
        };

        let request = decision.request;
        let mut outbound = outbound;
        outbound.set_path(request.request_id().clone(), request.network_path().append(own.clone()));

        let Some(transport) = self.resolve_transport(outbound.destination()) else {
            warn!("No route to {} for relayed {}", outbound.destination(), outbound.action());
            self.reply_unreachable(&link, &request, SendResult::UnknownClient).await;
            return;
        };

        if self.correlation.is_pending(outbound.request_id()) {
            warn!("Relayed id {} collides with a request of this node", outbound.request_id());
            let error = JsonError::for_request(&request, ErrorCode::GenericError, "Message id already in flight");
            self.reply_error(&link, error).await;
            return;
        }

        let record = ForwardedRequest {
            link: link.clone(),
            source: request.network_path().source().cloned().unwrap_or_else(|| link.peer.clone()),
            network_path: outbound.network_path().clone(),
            action: outbound.action().to_string(),
            forwarded_at: Utc::now(),
        };
        if let Err(holder) = self.forwarded.record(outbound.request_id().clone(), record) {
            warn!("Relayed id {} is already in flight for {}", outbound.request_id(), holder);
            let error = JsonError::for_request(&request, ErrorCode::GenericError, "Message id already in flight");
            self.reply_error(&link, error).await;
            return;
        }

        let result = outbound.send_via(transport.as_ref()).await;
        if result.is_success() {
            debug!(
                "Relayed {} {} to {} via {}",
                outbound.action(),
                outbound.request_id(),
                outbound.destination(),
                outbound.network_path()
            );
        } else {
            self.forwarded.take(outbound.request_id());
            self.reply_unreachable(&link, &request, result).await;
        }
    }

    async fn reply_unreachable(&self, link: &Link, request: &impl Routable, result: SendResult) {
        let code = match result {
            SendResult::UnknownClient => RESULT_UNKNOWN_CLIENT,
            _ => "TransmissionFailed",
        };
        let error = JsonError::for_request(
            request,
            ErrorCode::GenericError,
            format!("{} is unreachable", request.destination()),
        )
        .with_details(json!({ RESULT_DETAIL: code }));
        self.reply_error(link, error).await;
    }

    /// Route a response or error to its waiter or back towards its requester
    async fn on_answer<A: Answer>(&self, answer: A) {
        let destination = answer.destination();
        let addressed_elsewhere = answer.networking_mode() == NetworkingMode::OverlayNetwork
            && !destination.is_zero()
            && !self.is_local(destination);

        if !addressed_elsewhere && answer.clone().deliver(&self.correlation) {
            return;
        }
        self.relay_answer(answer).await;
    }

    async fn relay_answer<A: Answer>(&self, mut answer: A) {
        if let Some(record) = self.forwarded.take(answer.request_id()) {
            answer.readdress(record.source.clone(), record.network_path.clone());
            let result = answer.send_via(record.link.transport.as_ref()).await;
            if result.is_success() {
                debug!("Relayed answer {} back to {}", answer.request_id(), record.source);
            } else {
                warn!(
                    "Failed to relay answer {} to {} via {}: {:?}",
                    answer.request_id(),
                    record.source,
                    record.link.peer,
                    result
                );
            }
            return;
        }

        let destination = answer.destination().clone();
        if !destination.is_zero() && !self.is_local(&destination) {
            if let Some(transport) = self.resolve_transport(&destination) {
                let result = answer.send_via(transport.as_ref()).await;
                debug!("Routed answer {} to {}: {:?}", answer.request_id(), destination, result);
                return;
            }
        }

        debug!("Unmatched answer {}", answer.request_id());
        self.events.publish(
            Facet::Incoming,
            EventKind::Unmatched {
                request_id: answer.request_id().clone(),
            },
        );
    }

    /// Send an answer originated by the application, routed by destination
    async fn send_routed<A: Answer>(&self, answer: A) -> SendResult {
        let Some(transport) = self.resolve_transport(answer.destination()) else {
            return SendResult::UnknownClient;
        };
        answer.send_via(transport.as_ref()).await
    }

    async fn housekeeping(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.housekeeping_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let routes = self.reachability.remove_expired();
                    let relayed = self.forwarded.sweep();
                    if routes > 0 || relayed > 0 {
                        debug!("Housekeeping removed {} expired routes, {} stale relays", routes, relayed);
                    }
                }
            }
        }
    }
}

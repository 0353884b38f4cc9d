//! OCPP WebSocket server
//!
//! Accepts charging stations and downstream networking nodes. Each admitted
//! connection is registered under the identity it authenticated with; frames
//! for a destination are sent to that connection, or to the connection of the
//! hub the destination sits behind.
//!
//! ```text
//!   connections: NodeId ──► ServerConnection (socket, first seen, overlay?)
//!   hubs:        NodeId ──► NodeId (configured: destination behind hub)
//!   learned:     NodeId ──► NodeId (seen in traffic, dropped with the hub
//!                                   or when the destination connects)
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use overlay_core::{
    binary, frame, BinaryRequest, BinaryResponse, FrameError, JsonError, JsonRequest, JsonResponse,
    NetworkingMode, NodeId, OcppFrame, SendResult,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderValue, StatusCode},
        Message,
    },
    WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::transport::{Inbound, InboundSender, Link, OcppTransport, TransportKind};
use crate::config::{BasicAuthConfig, ServerConfig, OCPP_SUBPROTOCOL};
use crate::error::{AdapterError, AdmissionError};

type ServerSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// One admitted peer
struct ServerConnection {
    identity: NodeId,
    sink: Mutex<ServerSink>,
    /// Set once the peer has sent an overlay-mode frame
    overlay: AtomicBool,
    connected_at: DateTime<Utc>,
    shutdown: CancellationToken,
}

impl ServerConnection {
    fn mode(&self) -> NetworkingMode {
        if self.overlay.load(Ordering::Relaxed) {
            NetworkingMode::OverlayNetwork
        } else {
            NetworkingMode::Standard
        }
    }

    async fn send(&self, message: Message) -> bool {
        match self.sink.lock().await.send(message).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send to {}: {}", self.identity, e);
                false
            }
        }
    }
}

/// OCPP WebSocket server
pub struct WebSocketServer {
    node_id: NodeId,
    config: ServerConfig,
    local_addr: SocketAddr,
    connections: DashMap<NodeId, Arc<ServerConnection>>,
    hubs: DashMap<NodeId, NodeId>,
    learned: DashMap<NodeId, NodeId>,
    inbound: InboundSender,
    shutdown: CancellationToken,
}

impl WebSocketServer {
    /// Bind the listener and start accepting connections
    pub async fn bind(
        node_id: NodeId,
        config: ServerConfig,
        inbound: InboundSender,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, AdapterError> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("{} listening on ws://{}", node_id, local_addr);

        let server = Arc::new(Self {
            node_id,
            config,
            local_addr,
            connections: DashMap::new(),
            hubs: DashMap::new(),
            learned: DashMap::new(),
            inbound,
            shutdown,
        });

        tokio::spawn(server.clone().accept_loop(listener));
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_connected(&self, identity: &NodeId) -> bool {
        self.connections.contains_key(identity)
    }

    pub fn connected_ids(&self) -> Vec<NodeId> {
        self.connections.iter().map(|c| c.key().clone()).collect()
    }

    /// Hub registered for `destination`, if any; configured hubs win over learned ones
    pub fn networking_hub(&self, destination: &NodeId) -> Option<NodeId> {
        self.hubs
            .get(destination)
            .or_else(|| self.learned.get(destination))
            .map(|hub| hub.value().clone())
    }

    /// Stop accepting and close every connection
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Connections a frame for `destination` can be sent on, with the mode to use
    fn lookup_networking_node(&self, destination: &NodeId) -> Vec<(Arc<ServerConnection>, NetworkingMode)> {
        if destination.is_zero() {
            return Vec::new();
        }

        let mut current = destination.clone();
        let mut visited = HashSet::new();
        while let Some(hub) = self.networking_hub(&current) {
            if !visited.insert(current.clone()) {
                warn!("Hub indirection loop at {} while looking up {}", current, destination);
                return Vec::new();
            }
            current = hub;
        }

        if &current != destination {
            return self
                .connections
                .get(&current)
                .map(|c| vec![(c.value().clone(), NetworkingMode::OverlayNetwork)])
                .unwrap_or_default();
        }

        self.connections
            .get(destination)
            .map(|c| {
                let connection = c.value().clone();
                let mode = connection.mode();
                vec![(connection, mode)]
            })
            .unwrap_or_default()
    }

    /// Close `connection` and drop it from the map unless it was already replaced
    fn evict(&self, connection: &Arc<ServerConnection>) {
        connection.shutdown.cancel();
        let removed = self
            .connections
            .remove_if(&connection.identity, |_, current| Arc::ptr_eq(current, connection));
        if removed.is_some() {
            debug!("Evicted connection of {}", connection.identity);
            self.learned.retain(|destination, hub| {
                let keep = hub != &connection.identity;
                if !keep {
                    debug!("Forgetting {} behind {}", destination, hub);
                }
                keep
            });
        }
    }

    async fn send_frame<F>(&self, destination: &NodeId, encode: F) -> SendResult
    where
        F: Fn(NetworkingMode) -> Result<Message, FrameError> + Send,
    {
        let targets = self.lookup_networking_node(destination);
        if targets.is_empty() {
            debug!("No connection for {}", destination);
            return SendResult::UnknownClient;
        }

        for (connection, mode) in targets {
            let message = match encode(mode) {
                Ok(message) => message,
                Err(e) => {
                    error!("Failed to encode frame for {}: {}", destination, e);
                    return SendResult::TransmissionFailed;
                }
            };
            if let Message::Text(text) = &message {
                debug!("Sending to {}: {}", connection.identity, text);
            }
            if connection.send(message).await {
                return SendResult::Success;
            }
            self.evict(&connection);
        }

        SendResult::TransmissionFailed
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            tokio::spawn(self.clone().handle_connection(stream, addr));
                        }
                        Err(e) => warn!("Accept failed: {}", e),
                    }
                }
            }
        }

        for connection in self.connections.iter() {
            connection.shutdown.cancel();
        }
        info!("{} stopped listening on {}", self.node_id, self.local_addr);
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let mut admitted = None;
        let auth = self.config.basic_auth.clone();
        let callback = |request: &Request, mut response: Response| match admit(request, auth.as_ref()) {
            Ok(identity) => {
                if offers_subprotocol(request) {
                    response
                        .headers_mut()
                        .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(OCPP_SUBPROTOCOL));
                } else {
                    warn!("{} did not offer the {} subprotocol", identity, OCPP_SUBPROTOCOL);
                }
                admitted = Some(identity);
                Ok(response)
            }
            Err(e) => {
                warn!("Refusing connection from {}: {}", addr, e);
                Err(refusal(&e))
            }
        };

        let ws = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("Handshake with {} failed: {}", addr, e);
                return;
            }
        };
        let Some(identity) = admitted else {
            return;
        };

        let (sink, mut stream) = ws.split();
        let connection = Arc::new(ServerConnection {
            identity: identity.clone(),
            sink: Mutex::new(sink),
            overlay: AtomicBool::new(false),
            connected_at: Utc::now(),
            shutdown: self.shutdown.child_token(),
        });

        if let Some((_, hub)) = self.learned.remove(&identity) {
            debug!("{} now connected directly, no longer via {}", identity, hub);
        }
        if let Some(previous) = self.connections.insert(identity.clone(), connection.clone()) {
            info!(
                "Evicting previous connection of {} (connected since {})",
                identity, previous.connected_at
            );
            previous.shutdown.cancel();
        }
        info!("{} connected from {}", identity, addr);

        let link = Link::new(self.clone(), identity.clone());
        self.report(Inbound::Connected(link.clone())).await;

        loop {
            tokio::select! {
                _ = connection.shutdown.cancelled() => {
                    let _ = connection.sink.lock().await.close().await;
                    break;
                }

                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            debug!("Received from {}: {}", identity, text);
                            match frame::decode_text(&text) {
                                Ok(frame) => self.on_frame(&connection, frame, &link).await,
                                Err(e) => warn!("Failed to decode frame from {}: {}", identity, e),
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            match binary::decode_binary(&data) {
                                Ok(frame) => self.on_frame(&connection, frame, &link).await,
                                Err(e) => warn!("Failed to decode binary frame from {}: {}", identity, e),
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("{} closed the connection", identity);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("WebSocket error from {}: {}", identity, e);
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        self.evict(&connection);
        info!("{} disconnected", identity);
        self.report(Inbound::Disconnected(link)).await;
    }

    /// Learn from an inbound frame, then pass it on
    async fn on_frame(&self, connection: &ServerConnection, frame: OcppFrame, link: &Link) {
        if frame.networking_mode() == NetworkingMode::OverlayNetwork {
            if !connection.overlay.swap(true, Ordering::Relaxed) {
                debug!("{} uses overlay addressing", connection.identity);
            }

            let is_request = matches!(frame, OcppFrame::JsonRequest(_) | OcppFrame::BinaryRequest(_));
            if let Some(source) = frame.network_path().source().filter(|_| is_request) {
                if source != &connection.identity
                    && source != &self.node_id
                    && !self.connections.contains_key(source)
                    && !self.hubs.contains_key(source)
                    && !self.learned.get(source).is_some_and(|hub| *hub == connection.identity)
                {
                    info!("Learned {} via hub {}", source, connection.identity);
                    self.learned.insert(source.clone(), connection.identity.clone());
                }
            }
        }

        self.report(Inbound::Frame {
            frame,
            link: link.clone(),
        })
        .await;
    }

    async fn report(&self, inbound: Inbound) {
        if self.inbound.send(inbound).await.is_err() {
            debug!("Adapter gone, dropping inbound event");
        }
    }
}

#[async_trait]
impl OcppTransport for WebSocketServer {
    fn kind(&self) -> TransportKind {
        TransportKind::Server
    }

    async fn send_json_request(&self, request: &JsonRequest) -> SendResult {
        self.send_frame(&request.destination, |mode| {
            frame::encode_request(request, mode).map(Message::Text)
        })
        .await
    }

    async fn send_json_response(&self, response: &JsonResponse) -> SendResult {
        self.send_frame(&response.destination, |mode| {
            frame::encode_response(response, mode).map(Message::Text)
        })
        .await
    }

    async fn send_json_error(&self, error: &JsonError) -> SendResult {
        self.send_frame(&error.destination, |mode| {
            frame::encode_error(error, mode).map(Message::Text)
        })
        .await
    }

    async fn send_binary_request(&self, request: &BinaryRequest) -> SendResult {
        self.send_frame(&request.destination, |mode| {
            binary::encode_request(request, mode).map(|bytes| Message::Binary(bytes.to_vec()))
        })
        .await
    }

    async fn send_binary_response(&self, response: &BinaryResponse) -> SendResult {
        self.send_frame(&response.destination, |mode| {
            binary::encode_response(response, mode).map(|bytes| Message::Binary(bytes.to_vec()))
        })
        .await
    }

    fn can_reach(&self, destination: &NodeId) -> bool {
        !self.lookup_networking_node(destination).is_empty()
    }

    fn add_networking_hub(&self, destination: NodeId, hub: NodeId) {
        debug!("{} is behind hub {}", destination, hub);
        self.hubs.insert(destination, hub);
    }

    fn remove_networking_hub(&self, destination: &NodeId) {
        self.hubs.remove(destination);
    }
}

/// Identity of a connecting peer.
///
/// With Basic auth configured the username is the identity and the password
/// must match the shared secret; otherwise the last URL path segment is used.
pub fn admit(request: &Request, auth: Option<&BasicAuthConfig>) -> Result<NodeId, AdmissionError> {
    let Some(auth) = auth else {
        return path_identity(request.uri().path()).ok_or(AdmissionError::MissingIdentity);
    };

    let value = request
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or(AdmissionError::MissingCredentials)?;
    let encoded = value
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Basic "))
        .ok_or(AdmissionError::MalformedAuthorization)?;
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| AdmissionError::MalformedAuthorization)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AdmissionError::MalformedAuthorization)?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or(AdmissionError::MalformedAuthorization)?;

    if username.is_empty() {
        return Err(AdmissionError::MissingIdentity);
    }
    if password != auth.secret {
        return Err(AdmissionError::InvalidCredentials(username.to_string()));
    }
    Ok(NodeId::from(username))
}

fn path_identity(path: &str) -> Option<NodeId> {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map(NodeId::from)
}

fn offers_subprotocol(request: &Request) -> bool {
    request
        .headers()
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|protocol| protocol.trim() == OCPP_SUBPROTOCOL)
}

fn refusal(error: &AdmissionError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(error.to_string()));
    match error {
        AdmissionError::MissingIdentity => {
            *response.status_mut() = StatusCode::BAD_REQUEST;
        }
        _ => {
            *response.status_mut() = StatusCode::UNAUTHORIZED;
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Basic realm=\"OCPP\""));
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlay_core::RequestId;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_tungstenite::connect_async;

    fn request(path: &str, authorization: Option<&str>) -> Request {
        let mut builder = Request::builder()
            .uri(format!("ws://localhost:9000{}", path))
            .header(header::SEC_WEBSOCKET_PROTOCOL, "ocpp2.0.1, ocpp2.1");
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(()).unwrap()
    }

    fn basic(credentials: &str) -> String {
        format!("Basic {}", STANDARD.encode(credentials))
    }

    #[test]
    fn test_identity_from_path() {
        assert_eq!(admit(&request("/ocpp/CS001", None), None), Ok(NodeId::from("CS001")));
        assert_eq!(admit(&request("/ocpp/CS001/", None), None), Ok(NodeId::from("CS001")));
        assert_eq!(admit(&request("/", None), None), Err(AdmissionError::MissingIdentity));
    }

    #[test]
    fn test_identity_from_basic_auth() {
        let auth = BasicAuthConfig::new("s3cret");

        let ok = request("/ocpp/ignored", Some(&basic("CS042:s3cret")));
        assert_eq!(admit(&ok, Some(&auth)), Ok(NodeId::from("CS042")));

        let wrong = request("/ocpp/CS042", Some(&basic("CS042:guess")));
        assert_eq!(
            admit(&wrong, Some(&auth)),
            Err(AdmissionError::InvalidCredentials("CS042".to_string()))
        );

        assert_eq!(
            admit(&request("/ocpp/CS042", None), Some(&auth)),
            Err(AdmissionError::MissingCredentials)
        );
        assert_eq!(
            admit(&request("/ocpp/CS042", Some("Bearer abc")), Some(&auth)),
            Err(AdmissionError::MalformedAuthorization)
        );
    }

    async fn listening() -> (Arc<WebSocketServer>, mpsc::Receiver<Inbound>) {
        let (tx, rx) = mpsc::channel(64);
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        let server = WebSocketServer::bind(NodeId::from("NN1"), config, tx, CancellationToken::new())
            .await
            .unwrap();
        (server, rx)
    }

    async fn eventually(condition: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    fn overlay_heartbeat(source: &str, hub: &str) -> Message {
        Message::Text(format!(r#"[2,"CSMS",["{}","{}"],"1","Heartbeat",{{}}]"#, source, hub))
    }

    #[tokio::test]
    async fn test_learned_hub_dropped_when_destination_connects() {
        let (server, _rx) = listening().await;
        let base = format!("ws://{}", server.local_addr());
        let (cs7, nn2) = (NodeId::from("CS7"), NodeId::from("NN2"));

        let (mut hub, _) = connect_async(format!("{}/NN2", base)).await.unwrap();
        hub.send(overlay_heartbeat("CS7", "NN2")).await.unwrap();
        assert!(eventually(|| server.networking_hub(&cs7) == Some(nn2.clone())).await);

        let (_station, _) = connect_async(format!("{}/CS7", base)).await.unwrap();
        assert!(eventually(|| server.is_connected(&cs7)).await);
        assert_eq!(server.networking_hub(&cs7), None);

        let reset = JsonRequest::new(RequestId::from(5), cs7.clone(), "Reset", json!({"type": "Immediate"}));
        assert_eq!(server.send_json_request(&reset).await, SendResult::Success);
    }

    #[tokio::test]
    async fn test_learned_hub_dropped_with_hub_connection() {
        let (server, _rx) = listening().await;
        let (cs8, nn2) = (NodeId::from("CS8"), NodeId::from("NN2"));

        let (mut hub, _) = connect_async(format!("ws://{}/NN2", server.local_addr())).await.unwrap();
        hub.send(overlay_heartbeat("CS8", "NN2")).await.unwrap();
        assert!(eventually(|| server.networking_hub(&cs8) == Some(nn2.clone())).await);

        hub.close(None).await.unwrap();
        assert!(eventually(|| !server.is_connected(&nn2)).await);
        assert_eq!(server.networking_hub(&cs8), None);

        let reset = JsonRequest::new(RequestId::from(6), cs8, "Reset", json!({"type": "Immediate"}));
        assert_eq!(server.send_json_request(&reset).await, SendResult::UnknownClient);
    }

    #[tokio::test]
    async fn test_configured_hub_survives_hub_disconnect() {
        let (server, _rx) = listening().await;
        server.add_networking_hub(NodeId::from("CS9"), NodeId::from("NN2"));

        let (mut hub, _) = connect_async(format!("ws://{}/NN2", server.local_addr())).await.unwrap();
        assert!(eventually(|| server.is_connected(&NodeId::from("NN2"))).await);
        hub.close(None).await.unwrap();
        assert!(eventually(|| server.connection_count() == 0).await);

        assert_eq!(server.networking_hub(&NodeId::from("CS9")), Some(NodeId::from("NN2")));
    }

    #[tokio::test]
    async fn test_failed_send_evicts_connection() {
        let (server, _rx) = listening().await;
        let cs1 = NodeId::from("CS1");

        let (_station, _) = connect_async(format!("ws://{}/CS1", server.local_addr())).await.unwrap();
        assert!(eventually(|| server.is_connected(&cs1)).await);

        // A closed sink refuses further frames
        let connection = server.connections.get(&cs1).map(|c| c.value().clone()).unwrap();
        let _ = connection.sink.lock().await.close().await;

        let reset = JsonRequest::new(RequestId::from(7), cs1.clone(), "Reset", json!({"type": "Immediate"}));
        assert_eq!(server.send_json_request(&reset).await, SendResult::TransmissionFailed);
        assert!(!server.is_connected(&cs1));
        assert_eq!(server.send_json_request(&reset).await, SendResult::UnknownClient);
    }

    #[test]
    fn test_subprotocol_offer_and_refusal() {
        assert!(offers_subprotocol(&request("/ocpp/CS1", None)));

        let refused = refusal(&AdmissionError::MissingCredentials);
        assert_eq!(refused.status(), StatusCode::UNAUTHORIZED);
        assert!(refused.headers().contains_key(header::WWW_AUTHENTICATE));
        assert_eq!(refusal(&AdmissionError::MissingIdentity).status(), StatusCode::BAD_REQUEST);
    }
}

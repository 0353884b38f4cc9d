//! OCPP WebSocket client
//!
//! One persistent connection from this node to one remote (a CSMS or an
//! upstream networking node). Handles:
//! - WebSocket connection with OCPP subprotocol and optional Basic auth
//! - Automatic reconnection with exponential backoff
//! - Heartbeat (WebSocket ping)
//! - Decoding inbound frames and handing them to the adapter

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use overlay_core::{
    binary, frame, BinaryRequest, BinaryResponse, FrameError, JsonError, JsonRequest, JsonResponse,
    NetworkingMode, NodeId, SendResult,
};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::transport::{Inbound, InboundSender, Link, OcppTransport, TransportKind};
use crate::config::{ClientConfig, OCPP_SUBPROTOCOL};
use crate::error::AdapterError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// OCPP WebSocket client
pub struct WebSocketClient {
    config: ClientConfig,
    sink: Mutex<Option<WsSink>>,
    connected: watch::Sender<bool>,
    inbound: InboundSender,
    shutdown: CancellationToken,
}

impl WebSocketClient {
    /// Create the client and start its connection loop.
    ///
    /// The loop reconnects until `shutdown` is cancelled or [`close`](Self::close) is called.
    pub fn connect(config: ClientConfig, inbound: InboundSender, shutdown: CancellationToken) -> Arc<Self> {
        let (connected, _) = watch::channel(false);
        let client = Arc::new(Self {
            config,
            sink: Mutex::new(None),
            connected,
            inbound,
            shutdown,
        });

        tokio::spawn(client.clone().run());
        client
    }

    pub fn remote_id(&self) -> &NodeId {
        &self.config.remote_id
    }

    pub fn networking_mode(&self) -> NetworkingMode {
        self.config.networking_mode
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until the connection is up; false on timeout
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.connected.subscribe();
        let up = matches!(tokio::time::timeout(timeout, rx.wait_for(|up| *up)).await, Ok(Ok(_)));
        up
    }

    /// Stop the connection loop and close the socket
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Run the client connection loop
    async fn run(self: Arc<Self>) {
        let mut reconnect_delay = self.config.reconnect_delay;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            info!("Connecting to {} at {}", self.config.remote_id, self.config.endpoint());
            match self.open().await {
                Ok(stream) => {
                    reconnect_delay = self.config.reconnect_delay;
                    self.session(stream).await;
                }
                Err(e) => {
                    warn!("Connection to {} failed: {}", self.config.remote_id, e);
                }
            }

            if self.shutdown.is_cancelled() {
                break;
            }

            // Exponential backoff
            info!("Reconnecting in {:?}", reconnect_delay);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(reconnect_delay) => {}
            }
            reconnect_delay = std::cmp::min(reconnect_delay * 2, self.config.max_reconnect_delay);
        }

        info!("Client for {} stopped", self.config.remote_id);
    }

    /// Open the WebSocket with subprotocol and credentials
    async fn open(&self) -> Result<WsStream, AdapterError> {
        let mut request = self.config.endpoint().as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(OCPP_SUBPROTOCOL));

        if let Some(auth) = &self.config.basic_auth {
            let credentials = STANDARD.encode(format!("{}:{}", self.config.node_id, auth.secret));
            headers.insert(header::AUTHORIZATION, HeaderValue::from_str(&format!("Basic {}", credentials))?);
        }

        let (stream, response) = connect_async_with_config(request, None, false).await?;

        // Verify subprotocol
        let accepted_protocol = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if accepted_protocol != Some(OCPP_SUBPROTOCOL) {
            warn!(
                "{} did not accept the {} subprotocol, got: {:?}",
                self.config.remote_id, OCPP_SUBPROTOCOL, accepted_protocol
            );
        }

        Ok(stream)
    }

    /// Serve one connection until it drops or the client shuts down
    async fn session(self: &Arc<Self>, stream: WsStream) {
        let (sink, mut stream) = stream.split();
        *self.sink.lock().await = Some(sink);
        self.connected.send_replace(true);

        let remote = self.config.remote_id.clone();
        let link = Link::new(self.clone(), remote.clone());
        info!("WebSocket connected to {}", remote);
        self.report(Inbound::Connected(link.clone())).await;

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    if let Some(mut sink) = self.sink.lock().await.take() {
                        let _ = sink.close().await;
                    }
                    break;
                }

                _ = heartbeat.tick() => {
                    if !self.send_message(Message::Ping(Vec::new())).await.is_success() {
                        warn!("Heartbeat to {} failed", remote);
                        break;
                    }
                }

                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            debug!("Received from {}: {}", remote, text);
                            match frame::decode_text(&text) {
                                Ok(frame) => self.report(Inbound::Frame { frame, link: link.clone() }).await,
                                Err(e) => warn!("Failed to decode frame from {}: {}", remote, e),
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            debug!("Received {} binary bytes from {}", data.len(), remote);
                            match binary::decode_binary(&data) {
                                Ok(frame) => self.report(Inbound::Frame { frame, link: link.clone() }).await,
                                Err(e) => warn!("Failed to decode binary frame from {}: {}", remote, e),
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("WebSocket closed by {}", remote);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("WebSocket error from {}: {}", remote, e);
                            break;
                        }
                        None => {
                            info!("WebSocket stream from {} ended", remote);
                            break;
                        }
                    }
                }
            }
        }

        self.sink.lock().await.take();
        self.connected.send_replace(false);
        self.report(Inbound::Disconnected(link)).await;
    }

    async fn report(&self, inbound: Inbound) {
        if self.inbound.send(inbound).await.is_err() {
            debug!("Adapter gone, dropping inbound event from {}", self.config.remote_id);
        }
    }

    async fn send_message(&self, message: Message) -> SendResult {
        let mut sink = self.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            debug!("Not connected to {}", self.config.remote_id);
            return SendResult::TransmissionFailed;
        };

        match sink.send(message).await {
            Ok(()) => SendResult::Success,
            Err(e) => {
                warn!("Failed to send to {}: {}", self.config.remote_id, e);
                SendResult::TransmissionFailed
            }
        }
    }

    async fn send_text(&self, encoded: Result<String, FrameError>) -> SendResult {
        match encoded {
            Ok(text) => {
                debug!("Sending to {}: {}", self.config.remote_id, text);
                self.send_message(Message::Text(text)).await
            }
            Err(e) => {
                error!("Failed to encode frame: {}", e);
                SendResult::TransmissionFailed
            }
        }
    }

    async fn send_binary(&self, encoded: Result<Bytes, FrameError>) -> SendResult {
        match encoded {
            Ok(bytes) => self.send_message(Message::Binary(bytes.to_vec())).await,
            Err(e) => {
                error!("Failed to encode binary frame: {}", e);
                SendResult::TransmissionFailed
            }
        }
    }
}

#[async_trait]
impl OcppTransport for WebSocketClient {
    fn kind(&self) -> TransportKind {
        TransportKind::Client
    }

    async fn send_json_request(&self, request: &JsonRequest) -> SendResult {
        self.send_text(frame::encode_request(request, self.config.networking_mode)).await
    }

    async fn send_json_response(&self, response: &JsonResponse) -> SendResult {
        self.send_text(frame::encode_response(response, self.config.networking_mode)).await
    }

    async fn send_json_error(&self, error: &JsonError) -> SendResult {
        self.send_text(frame::encode_error(error, self.config.networking_mode)).await
    }

    async fn send_binary_request(&self, request: &BinaryRequest) -> SendResult {
        self.send_binary(binary::encode_request(request, self.config.networking_mode)).await
    }

    async fn send_binary_response(&self, response: &BinaryResponse) -> SendResult {
        self.send_binary(binary::encode_response(response, self.config.networking_mode)).await
    }

    fn can_reach(&self, destination: &NodeId) -> bool {
        destination == &self.config.remote_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overlay_core::RequestId;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let (tx, _rx) = mpsc::channel(8);
        // Port 9 (discard) is not expected to speak WebSocket
        let config = ClientConfig::new("ws://127.0.0.1:9/ocpp", "CS1", "NN1")
            .with_reconnect(Duration::from_millis(10), Duration::from_millis(20));
        let client = WebSocketClient::connect(config, tx, CancellationToken::new());

        let request = JsonRequest::new(RequestId::from(1), NodeId::csms(), "Heartbeat", json!({}));
        assert_eq!(client.send_json_request(&request).await, SendResult::TransmissionFailed);
        assert!(!client.is_connected());
        assert!(!client.wait_connected(Duration::from_millis(50)).await);
        assert_eq!(client.kind(), TransportKind::Client);
        assert!(client.can_reach(&NodeId::from("NN1")));

        client.close();
    }
}

//! Charging station -> networking node -> CSMS over real WebSockets

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use overlay_adapter_ocpp::{
    binary_handler_fn, handler_fn, AdapterConfig, BinaryReply, OcppAdapter, Reply, ServerConfig, WebSocketServer,
};
use overlay_core::{BinaryRequest, ForwardingDecision, JsonRequest, JsonResponse, NodeId, RequestId, ResultCode};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn local() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

struct Topology {
    csms: OcppAdapter,
    nn: OcppAdapter,
    cs: OcppAdapter,
    resets: Arc<AtomicUsize>,
    /// Id and payload of every Reset the CSMS handled
    seen: Arc<Mutex<Vec<(RequestId, Value)>>>,
}

impl Topology {
    fn shutdown(&self) {
        self.cs.shutdown();
        self.nn.shutdown();
        self.csms.shutdown();
    }
}

/// CSMS <- NN1 <- CS1, with the station speaking overlay or standard mode
async fn topology(overlay_station: bool) -> Topology {
    let timeout = Duration::from_secs(5);

    let csms = OcppAdapter::new(AdapterConfig::new("CSMS").with_request_timeout(timeout));
    let resets = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let counter = resets.clone();
    let log = seen.clone();
    csms.incoming().register_handler(
        "Reset",
        handler_fn(move |request: JsonRequest| {
            let counter = counter.clone();
            let log = log.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                log.lock().push((request.request_id, request.payload));
                Reply::Response(json!({"status": "Accepted"}))
            }
        }),
    );
    csms.incoming().register_binary_handler(
        "FirmwareChunk",
        binary_handler_fn(|request: BinaryRequest| async move {
            let mut echoed = request.payload.to_vec();
            echoed.reverse();
            BinaryReply::Response(Bytes::from(echoed))
        }),
    );
    let csms_server = csms.listen(ServerConfig::new(local())).await.unwrap();

    let nn_config = AdapterConfig::new("NN1").with_request_timeout(timeout);
    let nn = OcppAdapter::new(nn_config.clone());
    let nn_server = nn.listen(ServerConfig::new(local())).await.unwrap();
    let upstream = nn
        .connect(nn_config.client(format!("ws://{}", csms_server.local_addr()), "CSMS"))
        .unwrap();
    assert!(upstream.wait_connected(CONNECT_TIMEOUT).await);

    let cs_config = AdapterConfig::new("CS1").with_request_timeout(timeout);
    let cs = OcppAdapter::new(cs_config.clone());
    let mut client = cs_config.client(format!("ws://{}", nn_server.local_addr()), "NN1");
    if overlay_station {
        client = client.with_overlay();
    }
    let uplink = cs.connect(client).unwrap();
    assert!(uplink.wait_connected(CONNECT_TIMEOUT).await);
    cs.add_hub_route(NodeId::from("CSMS"), NodeId::from("NN1"), 1);

    wait_for_connection(&nn_server, "CS1").await;

    Topology {
        csms,
        nn,
        cs,
        resets,
        seen,
    }
}

async fn wait_for_connection(server: &WebSocketServer, identity: &str) {
    let identity = NodeId::from(identity);
    for _ in 0..50 {
        if server.is_connected(&identity) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} never connected", identity);
}

#[tokio::test]
async fn test_overlay_request_relayed_to_csms() {
    let net = topology(true).await;

    let state = net
        .cs
        .outgoing()
        .send_request("CSMS", "Reset", json!({"type": "Immediate"}))
        .await;

    assert_eq!(state.result_code(), ResultCode::Ok);
    let response = state.json_response().unwrap();
    assert_eq!(response.payload["status"], "Accepted");
    assert_eq!(response.network_path.len(), 2);
    assert_eq!(response.network_path.source(), Some(&NodeId::from("CS1")));
    assert_eq!(net.resets.load(Ordering::SeqCst), 1);
    assert_eq!(net.nn.forwarding().in_flight(), 0);
    net.shutdown();
}

#[tokio::test]
async fn test_standard_station_is_addressed_upstream() {
    let net = topology(false).await;

    let state = net
        .cs
        .outgoing()
        .send_request("NN1", "Reset", json!({"type": "OnIdle"}))
        .await;

    // The networking node has no Reset handler of its own; standard frames
    // from a station are addressed to the CSMS
    assert_eq!(state.result_code(), ResultCode::Ok);
    assert_eq!(net.resets.load(Ordering::SeqCst), 1);
    net.shutdown();
}

#[tokio::test]
async fn test_rejected_request_never_reaches_csms() {
    let net = topology(true).await;
    net.nn.forwarding().register_filter(
        "Reset",
        Arc::new(|request: JsonRequest| -> ForwardingDecision<JsonRequest, JsonResponse> {
            ForwardingDecision::reject(request)
        }),
    );

    let state = net
        .cs
        .outgoing()
        .send_request("CSMS", "Reset", json!({"type": "Immediate"}))
        .await;

    assert_eq!(state.result_code(), ResultCode::Filtered);
    assert_eq!(net.resets.load(Ordering::SeqCst), 0);
    net.shutdown();
}

#[tokio::test]
async fn test_replaced_request_keeps_original_id() {
    let net = topology(true).await;
    net.nn.forwarding().register_filter(
        "Reset",
        Arc::new(|request: JsonRequest| -> ForwardingDecision<JsonRequest, JsonResponse> {
            let mut replacement = request.clone();
            replacement.request_id = RequestId::from("rewritten");
            replacement.payload = json!({"type": "OnIdle"});
            ForwardingDecision::replace(request, replacement)
        }),
    );

    let state = net
        .cs
        .outgoing()
        .send_request("CSMS", "Reset", json!({"type": "Immediate"}))
        .await;

    assert_eq!(state.result_code(), ResultCode::Ok);
    let original = state.json_response().unwrap().request_id.clone();
    let seen = net.seen.lock().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, original);
    assert_eq!(seen[0].1["type"], "OnIdle");
    net.shutdown();
}

#[tokio::test]
async fn test_binary_request_relayed_to_csms() {
    let net = topology(true).await;

    let request = BinaryRequest::new(
        net.cs.outgoing().next_request_id(),
        NodeId::from("CSMS"),
        "FirmwareChunk",
        Bytes::from_static(&[1, 2, 3, 4]),
    );
    let state = net.cs.outgoing().send_binary_request(request).await;

    assert_eq!(state.result_code(), ResultCode::Ok);
    let response = state.binary_response().unwrap();
    assert_eq!(response.payload.as_ref(), &[4, 3, 2, 1]);
    assert_eq!(response.network_path.source(), Some(&NodeId::from("CS1")));
    assert_eq!(net.nn.forwarding().in_flight(), 0);
    net.shutdown();
}

#[tokio::test]
async fn test_unreachable_destination_reported_by_relay() {
    let net = topology(true).await;
    net.cs.add_hub_route(NodeId::from("CS404"), NodeId::from("NN1"), 1);

    let state = net
        .cs
        .outgoing()
        .send_request("CS404", "Reset", json!({"type": "Immediate"}))
        .await;

    assert_eq!(state.result_code(), ResultCode::RemoteError);
    assert_eq!(state.json_error().unwrap().relay_result(), Some("UnknownClient"));
    net.shutdown();
}

#[tokio::test]
async fn test_duplicate_identity_replaces_connection() {
    let adapter = OcppAdapter::new(AdapterConfig::new("NN1"));
    let server = adapter.listen(ServerConfig::new(local())).await.unwrap();
    let url = format!("ws://{}/CS1", server.local_addr());

    let (mut first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    wait_for_connection(&server, "CS1").await;
    let (_second, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let closed = tokio::time::timeout(CONNECT_TIMEOUT, async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "first connection stayed open");
    assert_eq!(server.connection_count(), 1);
    assert!(server.is_connected(&NodeId::from("CS1")));
    adapter.shutdown();
}

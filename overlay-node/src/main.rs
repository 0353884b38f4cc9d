//! Overlay Node - CLI for an OCPP 2.1 networking node
//!
//! Accepts charging stations and downstream networking nodes, holds a
//! connection to the CSMS and relays messages between them.
//!
//! # Usage
//!
//! ```bash
//! # Listen for stations and connect upstream
//! overlay-node --id NN1 --listen 0.0.0.0:9000 \
//!     --upstream ws://localhost:8180/ocpp
//!
//! # Reach CS42 through a downstream node, require Basic auth
//! overlay-node --id NN1 --listen 0.0.0.0:9000 \
//!     --route CS42=NN2@1 --auth-secret s3cret
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use overlay_adapter_ocpp::{AdapterConfig, EventKind, OcppAdapter, ServerConfig};
use overlay_core::NodeId;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// OCPP 2.1 networking node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node identity
    #[arg(short, long)]
    id: String,

    /// Address to accept stations and downstream nodes on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Upstream WebSocket URL (CSMS or upstream node)
    #[arg(short, long)]
    upstream: Option<String>,

    /// Identity of the upstream peer
    #[arg(long, default_value = NodeId::CSMS)]
    upstream_id: String,

    /// Speak overlay addressing to the upstream peer
    #[arg(long)]
    overlay_upstream: bool,

    /// Basic auth password presented to the upstream peer
    #[arg(long)]
    upstream_secret: Option<String>,

    /// Static route DEST=HUB[@PRIORITY] (can be repeated)
    #[arg(long, value_parser = parse_route)]
    route: Vec<StaticRoute>,

    /// Shared Basic auth secret required from connecting peers
    #[arg(long)]
    auth_secret: Option<String>,

    /// Default request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Clone, PartialEq)]
struct StaticRoute {
    destination: NodeId,
    hub: NodeId,
    priority: u8,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║            Overlay Node - OCPP 2.1 Networking Node           ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Node:     {:<50} ║", args.id);
    println!("║  Listen:   {:<50} ║", args.listen.map(|a| a.to_string()).unwrap_or_else(|| "-".into()));
    println!("║  Upstream: {:<50} ║", truncate(args.upstream.as_deref().unwrap_or("-"), 50));
    println!("║  Routes:   {:<50} ║", args.route.len());
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let config = AdapterConfig::new(args.id.as_str())
        .with_upstream_id(args.upstream_id.as_str())
        .with_request_timeout(Duration::from_secs(args.timeout_secs));
    let adapter = OcppAdapter::new(config.clone());

    let mut events = adapter.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event.kind {
                EventKind::Connected { peer, transport } => info!("{} connected ({:?})", peer, transport),
                EventKind::Disconnected { peer, transport } => info!("{} disconnected ({:?})", peer, transport),
                other => debug!("{:?}: {:?}", event.facet, other),
            }
        }
    });

    for route in &args.route {
        info!("Static route: {} via {} @{}", route.destination, route.hub, route.priority);
        adapter.add_hub_route(route.destination.clone(), route.hub.clone(), route.priority);
    }

    if let Some(addr) = args.listen {
        let mut server = ServerConfig::new(addr);
        if let Some(secret) = &args.auth_secret {
            server = server.with_basic_auth(secret.as_str());
        }
        let server = adapter.listen(server).await?;
        info!("Listening on {}", server.local_addr());
    }

    if let Some(url) = &args.upstream {
        let mut client = config.client(url.as_str(), args.upstream_id.as_str());
        if args.overlay_upstream {
            client = client.with_overlay();
        }
        if let Some(secret) = &args.upstream_secret {
            client = client.with_basic_auth(secret.as_str());
        }
        adapter.connect(client)?;
    }

    if args.listen.is_none() && args.upstream.is_none() {
        warn!("Neither --listen nor --upstream given; nothing to relay");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    adapter.shutdown();

    Ok(())
}

/// Parse `DEST=HUB[@PRIORITY]`
fn parse_route(s: &str) -> Result<StaticRoute, String> {
    let (destination, target) = s
        .split_once('=')
        .ok_or_else(|| format!("expected DEST=HUB[@PRIORITY], got '{}'", s))?;
    let (hub, priority) = match target.split_once('@') {
        Some((hub, priority)) => {
            let priority = priority
                .parse()
                .map_err(|_| format!("invalid priority '{}'", priority))?;
            (hub, priority)
        }
        None => (target, 0),
    };

    if destination.is_empty() || hub.is_empty() {
        return Err(format!("empty node id in route '{}'", s));
    }

    Ok(StaticRoute {
        destination: NodeId::from(destination),
        hub: NodeId::from(hub),
        priority,
    })
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route() {
        let route = parse_route("CS42=NN2@3").unwrap();
        assert_eq!(route.destination, NodeId::from("CS42"));
        assert_eq!(route.hub, NodeId::from("NN2"));
        assert_eq!(route.priority, 3);

        assert_eq!(parse_route("CS42=NN2").unwrap().priority, 0);
    }

    #[test]
    fn test_parse_route_rejects_garbage() {
        assert!(parse_route("CS42").is_err());
        assert!(parse_route("=NN2").is_err());
        assert!(parse_route("CS42=NN2@high").is_err());
        assert!(parse_route("CS42=NN2@300").is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("ws://short", 50), "ws://short");
        assert_eq!(truncate("abcdefghij", 8), "abcde...");
    }
}

//! Cluster module tests
//!
//! Nodes live on distinct loopback addresses sharing one registry port, the
//! way separate hosts share the default port.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use test_case::test_case;

use super::coordinator::Flow;
use super::*;
use crate::error::ClusterError;
use crate::net::SubnetSpec;
use crate::remote::{ClusterIdentity, PeerRef, ReloadHook, ReloadReport};
use crate::rpc::RpcRuntime;

const CLUSTER: &str = "teacluster";

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn addr(octet: u8) -> String {
    Ipv4Addr::new(127, 0, 0, octet).to_string()
}

struct Node {
    coordinator: Arc<ClusterCoordinator>,
    runtime: Arc<RpcRuntime>,
}

impl Node {
    /// Simulate the process exiting
    async fn kill(&self) {
        self.coordinator.destroy().await;
        self.runtime.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

struct FixedHook(Vec<&'static str>);

#[async_trait]
impl ReloadHook for FixedHook {
    async fn reload(&self, _all: bool) -> ReloadReport {
        ReloadReport {
            reloaded: self.0.iter().map(|s| s.to_string()).collect(),
            errors: vec![],
        }
    }
}

async fn node_with(
    octet: u8,
    port: u16,
    hub: &MemoryGossipHub,
    seeds: Option<String>,
    hook: Option<Arc<dyn ReloadHook>>,
) -> Node {
    let runtime = RpcRuntime::with_call_timeout(Duration::from_secs(2));
    let options = CoordinatorOptions {
        identity: ClusterIdentity::new(CLUSTER).with_server_name(addr(octet)),
        rpc_port: port,
        local_net: Some(SubnetSpec::new(Ipv4Addr::new(127, 0, 0, octet), 32).unwrap()),
        seeds,
        ..Default::default()
    };
    let coordinator =
        ClusterCoordinator::with_transport(runtime.clone(), options, hub.endpoint(), hook)
            .await
            .unwrap();
    Node {
        coordinator,
        runtime,
    }
}

async fn node(octet: u8, port: u16, hub: &MemoryGossipHub) -> Node {
    node_with(octet, port, hub, None, None).await
}

fn packet(command: GossipCommand, server: &str) -> Vec<u8> {
    GossipMessage::new(command, CLUSTER, server).encode()
}

/// Collect the decodable datagrams seen by `tap` until it stays quiet
async fn drain(tap: &MemoryGossip) -> Vec<GossipMessage> {
    let mut seen = Vec::new();
    while let Ok(Ok(payload)) = tokio::time::timeout(Duration::from_millis(100), tap.recv()).await
    {
        if let Ok(msg) = GossipMessage::decode(&payload) {
            seen.push(msg);
        }
    }
    seen
}

#[test_case("nodea,nodeb", &["nodea", "nodeb"] ; "comma")]
#[test_case("NodeA; nodeb ;", &["nodea", "nodeb"] ; "semicolon and case")]
#[test_case("nodea,,nodea;NODEA", &["nodea"] ; "duplicates")]
#[test_case(" ", &[] ; "blank")]
#[test_case("nodea nodeb\tnodec", &["nodea", "nodeb", "nodec"] ; "whitespace")]
#[test_case("nodea, nodeb ; nodec", &["nodea", "nodeb", "nodec"] ; "mixed separators")]
fn test_parse_seeds(list: &str, expected: &[&str]) {
    assert_eq!(parse_seeds(list), expected.to_vec());
}

#[test]
fn test_options_from_config() {
    let config = ClusterConfig {
        name: Some("tea".to_string()),
        servers: Some("nodea".to_string()),
        local_net: Some("10.1.0.0/16".to_string()),
        server_name: Some("NodeB".to_string()),
        ..Default::default()
    };
    let options = CoordinatorOptions::from_config(&config).unwrap();
    assert_eq!(options.identity, ClusterIdentity::new("tea").with_server_name("NodeB"));
    assert_eq!(options.local_net, Some("10.1.0.0/16".parse().unwrap()));
    assert_eq!(options.rpc_port, 1099);
    assert_eq!(options.multicast_port, 1099);
    assert_eq!(options.seeds.as_deref(), Some("nodea"));
}

#[tokio::test]
async fn test_from_config_disabled() {
    let runtime = RpcRuntime::new();
    let none = ClusterCoordinator::from_config(runtime.clone(), None, None)
        .await
        .unwrap();
    assert!(none.is_none());

    let no_discovery = ClusterConfig::default();
    let none = ClusterCoordinator::from_config(runtime, Some(&no_discovery), None)
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn test_seed_only_coordinator() {
    let port = free_port();
    let config = ClusterConfig {
        name: Some(CLUSTER.to_string()),
        servers: Some(addr(2)),
        server_name: Some(addr(1)),
        local_net: Some(format!("{}/32", addr(1))),
        rmi: crate::config::RmiConfig { port },
        ..Default::default()
    };
    let runtime = RpcRuntime::with_call_timeout(Duration::from_secs(2));
    let coordinator = ClusterCoordinator::from_config(runtime.clone(), Some(&config), None)
        .await
        .unwrap()
        .unwrap();

    assert!(!coordinator.has_gossip());
    assert!(!coordinator.launch_auto(true).await);
    assert!(matches!(
        coordinator.join_cluster().await,
        Err(ClusterError::NotRunning)
    ));
    assert_eq!(coordinator.seeds(), &[addr(2)]);
    assert_eq!(coordinator.advertised_host(), addr(1));
    runtime.shutdown();
}

#[tokio::test]
async fn test_malformed_and_foreign_packets_are_ignored() {
    let hub = MemoryGossipHub::new();
    let port = free_port();
    let a = node(1, port, &hub).await;
    let b = node(2, port, &hub).await;

    let c = &a.coordinator;
    assert_eq!(c.handle_packet(b"garbage", true).await, Flow::Continue);
    assert_eq!(c.handle_packet(b"join~teacluster", true).await, Flow::Continue);
    assert_eq!(
        c.handle_packet(b"join~othercluster~127.0.0.2", true).await,
        Flow::Continue
    );
    assert!(c.known_peers().is_empty());

    assert_eq!(
        c.handle_packet(&packet(GossipCommand::Ping, &addr(2)), true).await,
        Flow::Continue
    );
    assert_eq!(c.known_peers(), vec![b.coordinator.self_ref().clone()]);

    a.kill().await;
    b.kill().await;
}

#[tokio::test]
async fn test_quit_packet_stops_loop() {
    let hub = MemoryGossipHub::new();
    let a = node(1, free_port(), &hub).await;
    assert_eq!(a.coordinator.handle_packet(b"quit", true).await, Flow::Stop);
    assert_eq!(
        a.coordinator.handle_packet(b"join~quitters~nodeb", true).await,
        Flow::Stop
    );
    a.kill().await;
}

#[tokio::test]
async fn test_own_announcements_are_ignored() {
    let hub = MemoryGossipHub::new();
    let a = node(1, free_port(), &hub).await;
    let tap = hub.endpoint();

    a.coordinator
        .handle_packet(&packet(GossipCommand::Join, &addr(1)), true)
        .await;
    assert!(a.coordinator.known_peers().is_empty());
    assert!(drain(&tap).await.is_empty());
    a.kill().await;
}

#[tokio::test]
async fn test_active_join_is_accepted() {
    let hub = MemoryGossipHub::new();
    let port = free_port();
    let a = node(1, port, &hub).await;
    let b = node(2, port, &hub).await;
    let tap = hub.endpoint();

    b.coordinator
        .handle_packet(&packet(GossipCommand::Join, &addr(1)), true)
        .await;

    assert!(b.coordinator.contains_peer(a.coordinator.self_ref()));
    assert_eq!(
        drain(&tap).await,
        vec![GossipMessage::new(GossipCommand::Accept, CLUSTER, addr(2))]
    );

    a.kill().await;
    b.kill().await;
}

#[tokio::test]
async fn test_passive_join_is_not_accepted() {
    let hub = MemoryGossipHub::new();
    let port = free_port();
    let a = node(1, port, &hub).await;
    let b = node(2, port, &hub).await;
    let tap = hub.endpoint();

    b.coordinator
        .handle_packet(&packet(GossipCommand::Join, &addr(1)), false)
        .await;

    assert!(b.coordinator.contains_peer(a.coordinator.self_ref()));
    assert!(drain(&tap).await.is_empty());

    a.kill().await;
    b.kill().await;
}

#[tokio::test]
async fn test_ping_and_accept_never_reply() {
    let hub = MemoryGossipHub::new();
    let port = free_port();
    let a = node(1, port, &hub).await;
    let b = node(2, port, &hub).await;
    let tap = hub.endpoint();

    for command in [GossipCommand::Ping, GossipCommand::Accept] {
        b.coordinator
            .handle_packet(&packet(command, &addr(1)), true)
            .await;
    }
    assert_eq!(b.coordinator.known_peers().len(), 1);
    assert!(drain(&tap).await.is_empty());

    a.kill().await;
    b.kill().await;
}

#[tokio::test]
async fn test_duplicate_join_is_idempotent() {
    let hub = MemoryGossipHub::new();
    let port = free_port();
    let a = node(1, port, &hub).await;
    let b = node(2, port, &hub).await;

    let join = packet(GossipCommand::Join, &addr(1));
    b.coordinator.handle_packet(&join, false).await;
    b.coordinator.handle_packet(&join, false).await;

    assert_eq!(b.coordinator.known_peers().len(), 1);
    assert_eq!(b.coordinator.resolve_server_names().await, vec![addr(1)]);

    a.kill().await;
    b.kill().await;
}

#[tokio::test]
async fn test_leave_removes_peer() {
    let hub = MemoryGossipHub::new();
    let port = free_port();
    let a = node(1, port, &hub).await;
    let b = node(2, port, &hub).await;

    b.coordinator
        .handle_packet(&packet(GossipCommand::Ping, &addr(1)), true)
        .await;
    let a_ref = a.coordinator.self_ref().clone();
    assert!(b.coordinator.contains_peer(&a_ref));

    b.coordinator
        .handle_packet(&packet(GossipCommand::Leave, &addr(1)), true)
        .await;
    assert!(!b.coordinator.contains_peer(&a_ref));

    a.kill().await;
    b.kill().await;
}

#[tokio::test]
async fn test_leave_from_vanished_node_matches_host() {
    let hub = MemoryGossipHub::new();
    let port = free_port();
    let a = node(1, port, &hub).await;
    let b = node(2, port, &hub).await;

    b.coordinator
        .handle_packet(&packet(GossipCommand::Ping, &addr(1)), true)
        .await;
    assert_eq!(b.coordinator.known_peers().len(), 1);

    // registry gone before the leave arrives
    a.kill().await;
    b.coordinator
        .handle_packet(&packet(GossipCommand::Leave, &addr(1)), true)
        .await;
    assert!(b.coordinator.known_peers().is_empty());

    b.kill().await;
}

#[tokio::test]
async fn test_seeds_are_resolved_then_requeued_on_loss() {
    let hub = MemoryGossipHub::new();
    let port = free_port();
    let a = node_with(1, port, &hub, Some(format!("{}, {}", addr(2), addr(3))), None).await;

    // nothing reachable yet
    assert!(a.coordinator.resolve_server_names().await.is_empty());
    assert_eq!(a.coordinator.unresolved_seeds(), vec![addr(2), addr(3)]);

    let b = node(2, port, &hub).await;
    assert_eq!(a.coordinator.resolve_server_names().await, vec![addr(2)]);
    assert_eq!(a.coordinator.unresolved_seeds(), vec![addr(3)]);
    assert_eq!(a.coordinator.known_peers(), vec![b.coordinator.self_ref().clone()]);

    b.kill().await;
    assert!(a.coordinator.resolve_server_names().await.is_empty());
    assert!(a.coordinator.known_peers().is_empty());
    assert_eq!(a.coordinator.unresolved_seeds(), vec![addr(2), addr(3)]);
    // the seed list itself never shrinks
    assert_eq!(a.coordinator.seeds(), &[addr(2), addr(3)]);

    a.kill().await;
}

#[tokio::test]
async fn test_discovered_peer_is_dropped_without_requeue() {
    let hub = MemoryGossipHub::new();
    let port = free_port();
    let a = node(1, port, &hub).await;
    let b = node(2, port, &hub).await;

    a.coordinator
        .handle_packet(&packet(GossipCommand::Ping, &addr(2)), true)
        .await;
    assert_eq!(a.coordinator.resolve_server_names().await, vec![addr(2)]);

    b.kill().await;
    assert!(a.coordinator.resolve_server_names().await.is_empty());
    assert!(a.coordinator.unresolved_seeds().is_empty());

    a.kill().await;
}

#[tokio::test]
async fn test_seed_naming_this_node_is_dropped() {
    let hub = MemoryGossipHub::new();
    let a = node_with(1, free_port(), &hub, Some(addr(1)), None).await;

    assert!(a.coordinator.resolve_server_names().await.is_empty());
    assert!(a.coordinator.unresolved_seeds().is_empty());
    assert!(a.coordinator.known_peers().is_empty());

    a.kill().await;
}

#[tokio::test]
async fn test_reload_cluster_merges_reports() {
    let hub = MemoryGossipHub::new();
    let port = free_port();
    let seeds = format!("{};{}", addr(2), addr(3));
    let a = node_with(1, port, &hub, Some(seeds), None).await;
    let b = node_with(2, port, &hub, None, Some(Arc::new(FixedHook(vec!["page.tea", "base.tea"])))).await;
    let c = node_with(3, port, &hub, None, Some(Arc::new(FixedHook(vec!["base.tea"])))).await;

    let report = a.coordinator.reload_cluster(true).await;
    assert_eq!(
        report,
        ReloadReport {
            reloaded: vec!["base.tea".to_string(), "page.tea".to_string()],
            errors: vec![],
        }
    );

    c.kill().await;
    let report = a.coordinator.reload_cluster(false).await;
    assert_eq!(report.reloaded, vec!["base.tea".to_string(), "page.tea".to_string()]);
    assert_eq!(a.coordinator.known_peers(), vec![b.coordinator.self_ref().clone()]);

    a.kill().await;
    b.kill().await;
}

#[tokio::test]
async fn test_reload_reports_nodes_without_hook() {
    let hub = MemoryGossipHub::new();
    let port = free_port();
    let a = node_with(1, port, &hub, Some(addr(2)), None).await;
    let b = node(2, port, &hub).await;

    let report = a.coordinator.reload_cluster(false).await;
    assert!(report.reloaded.is_empty());
    assert_eq!(
        report.errors,
        vec![format!("{} has no template reload hook", addr(2))]
    );
    // a reachable node without a hook stays a peer
    assert_eq!(a.coordinator.known_peers().len(), 1);

    a.kill().await;
    b.kill().await;
}

#[tokio::test]
async fn test_restart_peers_reports_unreachable() {
    let hub = MemoryGossipHub::new();
    let a = node(1, free_port(), &hub).await;
    let dead = PeerRef::new(addr(9), free_port(), CLUSTER);

    let (report, failed) =
        restart_peers(a.coordinator.registry(), vec![dead.clone()], false).await;
    assert_eq!(failed, vec![dead]);
    assert_eq!(report.errors.len(), 1);

    a.kill().await;
}

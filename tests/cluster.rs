//! Integration Tests for TeaCluster Membership
//!
//! Each node gets its own runtime and loopback address (127.0.0.x) with a
//! shared registry port, as separate hosts would. Gossip travels through an
//! in-memory hub standing in for the multicast group.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use teacluster::cluster::{ClusterCoordinator, CoordinatorOptions, GossipCommand, GossipMessage};
use teacluster::cluster::{GossipTransport, MemoryGossip, MemoryGossipHub};
use teacluster::net::SubnetSpec;
use teacluster::remote::{ClusterIdentity, PeerHandle};
use teacluster::rpc::RpcRuntime;

const CLUSTER: &str = "teacluster";

// Atomic port counter to avoid port conflicts between tests
static PORT_COUNTER: AtomicU16 = AtomicU16::new(21000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn addr(octet: u8) -> String {
    Ipv4Addr::new(127, 0, 0, octet).to_string()
}

struct Node {
    coordinator: Arc<ClusterCoordinator>,
    runtime: Arc<RpcRuntime>,
}

impl Node {
    async fn start(octet: u8, port: u16, hub: &MemoryGossipHub, seeds: Option<String>) -> Self {
        Self::start_in(CLUSTER, octet, port, hub, seeds).await
    }

    async fn start_in(
        cluster: &str,
        octet: u8,
        port: u16,
        hub: &MemoryGossipHub,
        seeds: Option<String>,
    ) -> Self {
        let runtime = RpcRuntime::with_call_timeout(Duration::from_secs(2));
        let options = CoordinatorOptions {
            identity: ClusterIdentity::new(cluster).with_server_name(addr(octet)),
            rpc_port: port,
            local_net: Some(SubnetSpec::new(Ipv4Addr::new(127, 0, 0, octet), 32).unwrap()),
            seeds,
            ..Default::default()
        };
        let coordinator =
            ClusterCoordinator::with_transport(runtime.clone(), options, hub.endpoint(), None)
                .await
                .unwrap();
        Self {
            coordinator,
            runtime,
        }
    }

    async fn stop(&self) {
        self.coordinator.destroy().await;
        self.runtime.shutdown();
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn commands_seen(tap: &MemoryGossip, wait: Duration) -> Vec<GossipMessage> {
    let mut seen = Vec::new();
    while let Ok(Ok(payload)) = tokio::time::timeout(wait, tap.recv()).await {
        if let Ok(msg) = GossipMessage::decode(&payload) {
            seen.push(msg);
        }
    }
    seen
}

#[tokio::test]
async fn test_two_nodes_converge_after_join() {
    let hub = MemoryGossipHub::new();
    let port = next_port();
    let a = Node::start(1, port, &hub, Some(addr(2))).await;
    let b = Node::start(2, port, &hub, Some(addr(1))).await;

    assert!(a.coordinator.launch_auto(true).await);
    assert!(b.coordinator.launch_auto(true).await);
    a.coordinator.join_cluster().await.unwrap();

    let a_ref = a.coordinator.self_ref().clone();
    let b_ref = b.coordinator.self_ref().clone();
    eventually("B to add A", || b.coordinator.contains_peer(&a_ref)).await;
    eventually("A to add B", || a.coordinator.contains_peer(&b_ref)).await;

    assert_eq!(a.coordinator.known_peers(), vec![b_ref.clone()]);
    assert_eq!(b.coordinator.known_peers(), vec![a_ref.clone()]);

    // the remote view agrees with the local one
    let stub = a.coordinator.registry().stub(b_ref);
    assert_eq!(stub.known_peers().await.unwrap(), vec![a_ref]);
    assert_eq!(stub.server_name().await.unwrap(), addr(2));

    assert_eq!(a.coordinator.resolve_server_names().await, vec![addr(2)]);
    assert_eq!(b.coordinator.resolve_server_names().await, vec![addr(1)]);
    assert!(a.coordinator.unresolved_seeds().is_empty());
    assert!(b.coordinator.unresolved_seeds().is_empty());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_passive_node_never_accepts() {
    let hub = MemoryGossipHub::new();
    let port = next_port();
    let a = Node::start(1, port, &hub, None).await;
    let b = Node::start(2, port, &hub, None).await;
    let tap = hub.endpoint();

    a.coordinator.launch_auto(true).await;
    b.coordinator.launch_auto(false).await;
    a.coordinator.join_cluster().await.unwrap();

    let a_ref = a.coordinator.self_ref().clone();
    eventually("B to observe A", || b.coordinator.contains_peer(&a_ref)).await;

    let seen = commands_seen(&tap, Duration::from_millis(300)).await;
    assert!(seen.iter().all(|m| m.command != GossipCommand::Accept));
    assert!(a.coordinator.known_peers().is_empty());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_leave_announcement_removes_node() {
    let hub = MemoryGossipHub::new();
    let port = next_port();
    let a = Node::start(1, port, &hub, None).await;
    let b = Node::start(2, port, &hub, None).await;

    a.coordinator.launch_auto(true).await;
    b.coordinator.launch_auto(true).await;
    b.coordinator.join_cluster().await.unwrap();

    let b_ref = b.coordinator.self_ref().clone();
    eventually("A to add B", || a.coordinator.contains_peer(&b_ref)).await;

    b.coordinator.destroy().await;
    assert!(!b.coordinator.is_auto_running());
    eventually("A to drop B", || !a.coordinator.contains_peer(&b_ref)).await;

    a.stop().await;
    b.runtime.shutdown();
}

#[tokio::test]
async fn test_garbage_does_not_stop_loop() {
    let hub = MemoryGossipHub::new();
    let port = next_port();
    let a = Node::start(1, port, &hub, None).await;
    let b = Node::start(2, port, &hub, None).await;

    a.coordinator.launch_auto(true).await;
    hub.inject(&b"garbage"[..]);
    hub.inject(&b"join~teacluster"[..]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(a.coordinator.is_auto_running());
    assert!(a.coordinator.known_peers().is_empty());

    b.coordinator.ping_cluster().await.unwrap();
    let b_ref = b.coordinator.self_ref().clone();
    eventually("A to add B after ping", || a.coordinator.contains_peer(&b_ref)).await;

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_other_cluster_on_same_group_is_ignored() {
    let hub = MemoryGossipHub::new();
    let port = next_port();
    let a = Node::start(1, port, &hub, None).await;
    let other = Node::start_in("coffeecluster", 2, port, &hub, None).await;

    a.coordinator.launch_auto(true).await;
    other.coordinator.launch_auto(true).await;
    other.coordinator.join_cluster().await.unwrap();
    a.coordinator.join_cluster().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(a.coordinator.known_peers().is_empty());
    assert!(other.coordinator.known_peers().is_empty());

    a.stop().await;
    other.stop().await;
}

#[tokio::test]
async fn test_quit_packet_stops_loop() {
    let hub = MemoryGossipHub::new();
    let a = Node::start(1, next_port(), &hub, None).await;

    a.coordinator.launch_auto(true).await;
    hub.inject(&b"quit"[..]);
    eventually("loop to stop", || !a.coordinator.is_auto_running()).await;

    // the loop is not restarted on its own, but may be relaunched
    assert!(a.coordinator.launch_auto(true).await);
    assert!(a.coordinator.is_auto_running());

    a.stop().await;
}

#[tokio::test]
async fn test_kill_auto_is_prompt() {
    let hub = MemoryGossipHub::new();
    let a = Node::start(1, next_port(), &hub, None).await;

    assert!(a.coordinator.launch_auto(true).await);
    tokio::time::timeout(Duration::from_secs(1), a.coordinator.kill_auto())
        .await
        .expect("kill_auto blocked on receive");
    assert!(!a.coordinator.is_auto_running());

    a.stop().await;
}

#[tokio::test]
async fn test_relaunch_replaces_running_loop() {
    let hub = MemoryGossipHub::new();
    let port = next_port();
    let a = Node::start(1, port, &hub, None).await;
    let b = Node::start(2, port, &hub, None).await;
    let tap = hub.endpoint();

    assert!(a.coordinator.launch_auto(true).await);
    assert!(a.coordinator.launch_auto(true).await);
    assert!(a.coordinator.is_auto_running());

    // a second loop would answer the join twice
    b.coordinator.join_cluster().await.unwrap();
    let accepts = commands_seen(&tap, Duration::from_millis(300))
        .await
        .into_iter()
        .filter(|m| m.command == GossipCommand::Accept)
        .count();
    assert_eq!(accepts, 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_passive_node_stays_silent() {
    let hub = MemoryGossipHub::new();
    let port = next_port();
    let a = Node::start(1, port, &hub, None).await;
    let b = Node::start(2, port, &hub, None).await;
    let tap = hub.endpoint();

    a.coordinator.launch_auto(true).await;
    assert!(b.coordinator.launch_auto(false).await);
    assert!(b.coordinator.is_passive());

    b.coordinator.join_cluster().await.unwrap();
    b.coordinator.ping_cluster().await.unwrap();
    b.coordinator.destroy().await;

    let seen = commands_seen(&tap, Duration::from_millis(300)).await;
    assert!(
        seen.iter().all(|m| m.server_name != addr(2)),
        "passive node announced itself: {:?}",
        seen
    );
    assert!(a.coordinator.known_peers().is_empty());

    a.stop().await;
    b.runtime.shutdown();
}

#[tokio::test]
async fn test_passive_loop_can_switch_to_active() {
    let hub = MemoryGossipHub::new();
    let port = next_port();
    let a = Node::start(1, port, &hub, None).await;
    let b = Node::start(2, port, &hub, None).await;

    a.coordinator.launch_auto(true).await;
    b.coordinator.launch_auto(false).await;
    b.coordinator.join_cluster().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(a.coordinator.known_peers().is_empty());

    assert!(b.coordinator.launch_auto(true).await);
    assert!(!b.coordinator.is_passive());
    b.coordinator.join_cluster().await.unwrap();

    let b_ref = b.coordinator.self_ref().clone();
    eventually("A to add B once active", || a.coordinator.contains_peer(&b_ref)).await;

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_second_process_attaches_to_registry() {
    let hub = MemoryGossipHub::new();
    let port = next_port();
    let a = Node::start(1, port, &hub, None).await;
    // same host and port as A, so it must attach to A's registry
    let late = Node::start_in("coffeecluster", 1, port, &hub, None).await;

    assert_eq!(a.runtime.registry_port(), Some(port));
    assert_eq!(late.runtime.registry_port(), None);
    let late_ref = late.coordinator.self_ref().clone();
    assert_ne!(late_ref.port, port);

    let b = Node::start(2, port, &hub, None).await;
    let found = b
        .coordinator
        .registry()
        .lookup(&addr(1), "coffeecluster")
        .await
        .unwrap();
    assert_eq!(found, late_ref);
    assert_eq!(
        b.coordinator.registry().stub(found).cluster_name().await.unwrap(),
        "coffeecluster"
    );
    assert_eq!(
        b.coordinator.registry().list(&addr(1)).await.unwrap(),
        vec!["coffeecluster".to_string(), CLUSTER.to_string()]
    );

    late.stop().await;
    a.stop().await;
    b.stop().await;
}

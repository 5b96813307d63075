//! Cluster Coordinator
//!
//! Owns a node's gossip socket, its registry binding, and the seed list.
//! Membership converges through three paths: gossip announcements handled
//! by the background loop, explicit seeds resolved through the registry,
//! and the reconciliation pass that prunes dead peers.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::gossip::{GossipTransport, MulticastGossip};
use super::protocol::{is_quit, GossipCommand, GossipMessage};
use super::worker::GossipWorker;
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::net::{resolve_local_net, BoundTransport, SubnetSpec};
use crate::remote::{ClusterIdentity, LocalPeer, PeerHandle, PeerRef, ReloadHook, ReloadReport};
use crate::rpc::{MembershipRegistry, RpcRuntime, DEFAULT_RPC_PORT};

/// Default multicast port, shared with the registry port
pub const DEFAULT_MULTICAST_PORT: u16 = 1099;

/// Construction parameters of a [`ClusterCoordinator`]
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub identity: ClusterIdentity,
    /// Multicast group; `None` disables gossip discovery
    pub multicast_group: Option<Ipv4Addr>,
    pub multicast_port: u16,
    pub rpc_port: u16,
    /// Subnet whose local address carries gossip and invocations
    pub local_net: Option<SubnetSpec>,
    /// Seed hostnames separated by commas, semicolons or whitespace
    pub seeds: Option<String>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            identity: ClusterIdentity::default(),
            multicast_group: None,
            multicast_port: DEFAULT_MULTICAST_PORT,
            rpc_port: DEFAULT_RPC_PORT,
            local_net: None,
            seeds: None,
        }
    }
}

impl CoordinatorOptions {
    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        let local_net = config
            .local_net
            .as_deref()
            .map(str::parse::<SubnetSpec>)
            .transpose()?;

        let mut identity = ClusterIdentity {
            cluster_name: config.name.clone(),
            server_name: None,
        };
        if let Some(server_name) = &config.server_name {
            identity = identity.with_server_name(server_name.clone());
        }

        Ok(Self {
            identity,
            multicast_group: config.multicast.group,
            multicast_port: config.multicast.port,
            rpc_port: config.rmi.port,
            local_net,
            seeds: config.servers.clone(),
        })
    }
}

/// Split a seed list on `,`, `;` and whitespace, lower-casing and
/// dropping blanks
pub fn parse_seeds(list: &str) -> Vec<String> {
    let mut seeds: Vec<String> = Vec::new();
    for name in list.split(|c: char| c == ',' || c == ';' || c.is_whitespace()) {
        let name = name.to_lowercase();
        if !name.is_empty() && !seeds.contains(&name) {
            seeds.push(name);
        }
    }
    seeds
}

/// Whether the gossip loop keeps going after a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// Cluster membership for one node
pub struct ClusterCoordinator {
    local: Arc<LocalPeer>,
    registry: MembershipRegistry,
    self_ref: PeerRef,
    /// Host announced in gossip and used in our own reference
    advertised_host: String,
    seeds: Vec<String>,
    unresolved: Mutex<BTreeSet<String>>,
    /// Seed name → the reference it resolved to
    seed_refs: Mutex<HashMap<String, PeerRef>>,
    gossip: Mutex<Option<Arc<dyn GossipTransport>>>,
    worker: Mutex<Option<GossipWorker>>,
    /// Set once the loop was launched passive; nothing is announced then
    passive: AtomicBool,
}

impl ClusterCoordinator {
    /// Build a coordinator, joining the multicast group when one is set
    pub async fn new(
        runtime: Arc<RpcRuntime>,
        options: CoordinatorOptions,
        hook: Option<Arc<dyn ReloadHook>>,
    ) -> Result<Arc<Self>> {
        Self::build(runtime, options, None, hook).await
    }

    /// Build a coordinator gossiping over `gossip` instead of multicast
    pub async fn with_transport(
        runtime: Arc<RpcRuntime>,
        options: CoordinatorOptions,
        gossip: Arc<dyn GossipTransport>,
        hook: Option<Arc<dyn ReloadHook>>,
    ) -> Result<Arc<Self>> {
        Self::build(runtime, options, Some(gossip), hook).await
    }

    /// Build from the `[cluster]` config section.
    ///
    /// Returns `None` when the section is absent, or when it names neither
    /// a multicast group nor seed servers.
    pub async fn from_config(
        runtime: Arc<RpcRuntime>,
        config: Option<&ClusterConfig>,
        hook: Option<Arc<dyn ReloadHook>>,
    ) -> Result<Option<Arc<Self>>> {
        let Some(config) = config else {
            debug!("No cluster section; clustering disabled");
            return Ok(None);
        };

        if !config.has_discovery() {
            info!("Cluster section has neither a multicast group nor servers; clustering disabled");
            return Ok(None);
        }
        let options = CoordinatorOptions::from_config(config)?;
        if options.multicast_group.is_none() {
            info!("No multicast group configured; using the seed list only");
        }

        Self::new(runtime, options, hook).await.map(Some)
    }

    async fn build(
        runtime: Arc<RpcRuntime>,
        options: CoordinatorOptions,
        gossip: Option<Arc<dyn GossipTransport>>,
        hook: Option<Arc<dyn ReloadHook>>,
    ) -> Result<Arc<Self>> {
        let local = Arc::new(LocalPeer::new(&options.identity, hook));
        let server_name = local.server().to_string();

        if let Some(spec) = &options.local_net {
            let addr = resolve_local_net(&server_name, spec).await?;
            runtime.install_transport(BoundTransport::new(addr));
        }
        // the runtime keeps the first transport installed in this process
        let bound_addr = runtime.transport().map(|t| t.local_addr());
        let advertised_host = match bound_addr {
            Some(addr) => addr.to_string(),
            None => server_name.clone(),
        };

        let registry = MembershipRegistry::new(runtime, options.rpc_port);
        let self_ref = registry
            .bind(local.cluster(), local.clone(), &advertised_host)
            .await?;
        local.set_self_ref(self_ref.clone());

        let gossip = match (gossip, options.multicast_group) {
            (Some(gossip), _) => Some(gossip),
            (None, Some(group)) => Some(Arc::new(MulticastGossip::join(
                group,
                options.multicast_port,
                bound_addr,
            )?) as Arc<dyn GossipTransport>),
            (None, None) => None,
        };

        let seeds = options.seeds.as_deref().map(parse_seeds).unwrap_or_default();

        info!(
            "Cluster '{}' node {} ready as {} ({}; seeds: {:?})",
            local.cluster(),
            server_name,
            self_ref,
            gossip
                .as_ref()
                .map(|g| g.describe())
                .unwrap_or_else(|| "no gossip".to_string()),
            seeds
        );

        Ok(Arc::new(Self {
            unresolved: Mutex::new(seeds.iter().cloned().collect()),
            seeds,
            seed_refs: Mutex::new(HashMap::new()),
            local,
            registry,
            self_ref,
            advertised_host,
            gossip: Mutex::new(gossip),
            worker: Mutex::new(None),
            passive: AtomicBool::new(false),
        }))
    }

    pub fn cluster_name(&self) -> &str {
        self.local.cluster()
    }

    pub fn server_name(&self) -> &str {
        self.local.server()
    }

    pub fn advertised_host(&self) -> &str {
        &self.advertised_host
    }

    /// Reference under which this node's handle is bound
    pub fn self_ref(&self) -> &PeerRef {
        &self.self_ref
    }

    /// This node's own handle
    pub fn local_handle(&self) -> &Arc<LocalPeer> {
        &self.local
    }

    pub fn registry(&self) -> &MembershipRegistry {
        &self.registry
    }

    /// Configured seed names, never shrinks
    pub fn seeds(&self) -> &[String] {
        &self.seeds
    }

    /// Seeds still waiting to be contacted, sorted
    pub fn unresolved_seeds(&self) -> Vec<String> {
        self.unresolved.lock().iter().cloned().collect()
    }

    pub fn known_peers(&self) -> Vec<PeerRef> {
        self.local.peers()
    }

    pub fn contains_peer(&self, peer: &PeerRef) -> bool {
        self.local.contains(peer)
    }

    pub fn has_gossip(&self) -> bool {
        self.gossip.lock().is_some()
    }

    fn gossip(&self) -> Result<Arc<dyn GossipTransport>> {
        self.gossip.lock().clone().ok_or(ClusterError::NotRunning)
    }

    fn is_self(&self, server_name: &str) -> bool {
        let server_name = server_name.to_lowercase();
        server_name == self.advertised_host || server_name == self.local.server()
    }

    /// Reconciliation pass: resolve pending seeds, then prune peers that no
    /// longer answer. Returns the server names of the reachable peers.
    pub async fn resolve_server_names(&self) -> Vec<String> {
        self.resolve_pending_seeds().await;

        let mut reachable: Vec<(PeerRef, String)> = Vec::new();
        let mut lost: Vec<PeerRef> = Vec::new();
        for peer in self.local.peers() {
            match self.registry.stub(peer.clone()).server_name().await {
                Ok(name) => reachable.push((peer, name.to_lowercase())),
                Err(e) if e.is_peer_gone() => {
                    warn!("Dropping unreachable peer {}: {}", peer, e);
                    self.local.remove(&peer);
                    lost.push(peer);
                }
                Err(e) => warn!("Keeping peer {} after local failure: {}", peer, e),
            }
        }

        self.requeue_lost_seeds(&lost, &reachable);

        let mut names: Vec<String> = Vec::with_capacity(reachable.len());
        for (_, name) in reachable {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        debug!("Reachable peers of {}: {:?}", self.server_name(), names);
        names
    }

    async fn resolve_pending_seeds(&self) {
        let pending = self.unresolved_seeds();
        for name in pending {
            match self.registry.lookup(&name, self.cluster_name()).await {
                Ok(peer) if peer == self.self_ref => {
                    debug!("Seed {} is this node", name);
                    self.unresolved.lock().remove(&name);
                    self.seed_refs.lock().insert(name, peer);
                }
                Ok(peer) => {
                    if self.local.insert(peer.clone()) {
                        info!("Seed {} resolved to {}", name, peer);
                    }
                    self.unresolved.lock().remove(&name);
                    self.seed_refs.lock().insert(name, peer);
                }
                Err(e) => debug!("Seed {} not resolved yet: {}", name, e),
            }
        }
    }

    /// Put seeds whose peers were lost back on the pending list, then make
    /// sure no reachable peer is still pending.
    fn requeue_lost_seeds(&self, lost: &[PeerRef], reachable: &[(PeerRef, String)]) {
        let seed_refs = self.seed_refs.lock();
        let mut unresolved = self.unresolved.lock();

        for peer in lost {
            for seed in &self.seeds {
                if seed_refs.get(seed) == Some(peer) || *seed == peer.host {
                    info!("Seed {} will be retried", seed);
                    unresolved.insert(seed.clone());
                }
            }
        }

        for (peer, name) in reachable {
            unresolved.remove(name);
            unresolved.remove(&peer.host);
            unresolved.retain(|seed| seed_refs.get(seed) != Some(peer));
        }
    }

    /// Transmit a raw datagram to the gossip group
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        self.gossip()?.send(payload).await
    }

    /// Wait for the next gossip datagram
    pub async fn next_packet(&self) -> Result<Bytes> {
        self.gossip()?.recv().await
    }

    async fn announce(&self, command: GossipCommand) -> Result<()> {
        if self.is_passive() {
            debug!("Passive node; not announcing {}", command);
            return Ok(());
        }
        let msg = GossipMessage::new(command, self.cluster_name(), self.advertised_host.as_str());
        debug!("Sending {}", msg);
        self.send(&msg.encode()).await
    }

    /// Announce this node. A no-op while the loop runs passive.
    pub async fn join_cluster(&self) -> Result<()> {
        self.announce(GossipCommand::Join).await
    }

    pub async fn ping_cluster(&self) -> Result<()> {
        self.announce(GossipCommand::Ping).await
    }

    /// Apply one received datagram
    pub(crate) async fn handle_packet(&self, payload: &[u8], active: bool) -> Flow {
        if is_quit(payload) {
            info!("Quit packet received; stopping gossip loop");
            return Flow::Stop;
        }

        let msg = match GossipMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Dropping gossip packet: {}", e);
                return Flow::Continue;
            }
        };

        if msg.cluster_name != self.cluster_name() {
            debug!("Ignoring {} for another cluster", msg);
            return Flow::Continue;
        }
        if self.is_self(&msg.server_name) {
            return Flow::Continue;
        }

        debug!("Gossip received: {}", msg);
        match msg.command {
            GossipCommand::Join => {
                if let Some(peer) = self.lookup_sender(&msg).await {
                    if self.local.insert(peer.clone()) {
                        info!("{} joined", peer);
                    }
                    if active {
                        if let Err(e) = self.announce(GossipCommand::Accept).await {
                            warn!("Failed to accept {}: {}", msg.server_name, e);
                        }
                    }
                }
            }
            GossipCommand::Accept | GossipCommand::Ping => {
                if let Some(peer) = self.lookup_sender(&msg).await {
                    if self.local.insert(peer.clone()) {
                        info!("{} added after {}", peer, msg.command);
                    }
                }
            }
            GossipCommand::Leave => match self.lookup_sender(&msg).await {
                Some(peer) => {
                    if self.local.remove(&peer) {
                        info!("{} left", peer);
                    }
                }
                None => {
                    // the leaving node's registry may already be gone
                    for peer in self.local.peers() {
                        if peer.host == msg.server_name.to_lowercase() && self.local.remove(&peer) {
                            info!("{} left", peer);
                        }
                    }
                }
            },
        }
        Flow::Continue
    }

    async fn lookup_sender(&self, msg: &GossipMessage) -> Option<PeerRef> {
        match self
            .registry
            .lookup(&msg.server_name, self.cluster_name())
            .await
        {
            Ok(peer) if peer == self.self_ref => None,
            Ok(peer) => Some(peer),
            Err(e) => {
                debug!("Cannot resolve {} from {}: {}", msg.server_name, msg.command, e);
                None
            }
        }
    }

    /// Start the background gossip loop, replacing a running one.
    ///
    /// `active = false` observes only: joins are never answered and this
    /// node sends no `join`, `ping` or `leave` until relaunched active.
    /// Returns false when there is no gossip socket.
    pub async fn launch_auto(self: &Arc<Self>, active: bool) -> bool {
        let gossip = match self.gossip() {
            Ok(gossip) => gossip,
            Err(_) => {
                info!("No gossip socket; relying on seeds only");
                return false;
            }
        };

        self.kill_auto().await;
        self.passive.store(!active, Ordering::Release);
        let mut worker = self.worker.lock();
        if let Some(previous) = worker.take() {
            // another launch raced us between the kill and the lock
            previous.abort();
        }
        *worker = Some(GossipWorker::spawn(Arc::downgrade(self), gossip, active));
        true
    }

    /// Whether the loop was last launched in passive mode
    pub fn is_passive(&self) -> bool {
        self.passive.load(Ordering::Acquire)
    }

    /// Whether the gossip loop is running
    pub fn is_auto_running(&self) -> bool {
        self.worker.lock().as_ref().is_some_and(|w| w.is_running())
    }

    /// Stop the gossip loop and wait for it to exit
    pub async fn kill_auto(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.stop().await;
        }
    }

    /// Announce `leave`, stop gossiping and release the socket. The handle
    /// is withdrawn so remote calls on it fail from now on.
    pub async fn destroy(&self) {
        if let Err(e) = self.announce(GossipCommand::Leave).await {
            debug!("Leave not sent: {}", e);
        }
        self.kill_auto().await;

        if let Some(gossip) = self.gossip.lock().take() {
            gossip.close();
        }
        if let Some(server) = self.registry.runtime().server_if_started() {
            server.unexport(self.cluster_name());
        }
        info!("{} left cluster '{}'", self.server_name(), self.cluster_name());
    }

    /// Reconcile, then ask every known peer to reload its templates
    pub async fn reload_cluster(&self, all: bool) -> ReloadReport {
        self.resolve_server_names().await;
        let (report, failed) = restart_peers(&self.registry, self.local.peers(), all).await;
        for peer in failed {
            self.local.remove(&peer);
        }
        report
    }
}

/// Invoke `restart` on `peers` concurrently.
///
/// Returns the merged report and the peers found gone. Each
/// call is bounded by [`RESTART_CALL_TIMEOUT`](crate::rpc::RESTART_CALL_TIMEOUT).
pub async fn restart_peers(
    registry: &MembershipRegistry,
    peers: Vec<PeerRef>,
    all: bool,
) -> (ReloadReport, Vec<PeerRef>) {
    let calls = peers.into_iter().map(|peer| {
        let stub = registry.stub(peer.clone());
        async move { (peer, stub.restart(all).await) }
    });

    let mut report = ReloadReport::default();
    let mut failed = Vec::new();
    for (peer, result) in join_all(calls).await {
        match result {
            Ok(peer_report) => {
                if !peer_report.is_success() {
                    warn!("{} reported reload errors: {:?}", peer, peer_report.errors);
                }
                report.merge(peer_report);
            }
            Err(e) => {
                warn!("Reload on {} failed: {}", peer, e);
                report.errors.push(format!("{}: {}", peer, e));
                if e.is_peer_gone() {
                    failed.push(peer);
                }
            }
        }
    }
    (report, failed)
}

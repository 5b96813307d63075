//! Gossip Loop
//!
//! Background task receiving gossip datagrams and feeding them to the
//! coordinator. The loop runs until it is stopped, receives a quit packet,
//! fails to receive, or its coordinator is dropped. It is never restarted
//! automatically.

use std::sync::{Arc, Weak};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::coordinator::{ClusterCoordinator, Flow};
use super::gossip::GossipTransport;

pub(crate) struct GossipWorker {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl GossipWorker {
    pub(crate) fn spawn(
        coordinator: Weak<ClusterCoordinator>,
        gossip: Arc<dyn GossipTransport>,
        active: bool,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(coordinator, gossip, active, stop_rx));
        Self { stop, handle }
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop without waiting for the loop to exit
    pub(crate) fn abort(self) {
        let _ = self.stop.send(true);
        self.handle.abort();
    }

    /// Signal the loop and wait until it has exited
    pub(crate) async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            error!("Gossip loop panicked: {}", e);
        }
    }
}

async fn run(
    coordinator: Weak<ClusterCoordinator>,
    gossip: Arc<dyn GossipTransport>,
    active: bool,
    mut stop_rx: watch::Receiver<bool>,
) {
    info!(
        "Gossip loop started on {} ({})",
        gossip.describe(),
        if active { "active" } else { "passive" }
    );

    loop {
        let payload = tokio::select! {
            _ = stop_rx.changed() => break,
            result = gossip.recv() => match result {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Gossip receive failed: {}", e);
                    break;
                }
            },
        };

        let Some(coordinator) = coordinator.upgrade() else {
            debug!("Coordinator dropped");
            break;
        };

        let flow = tokio::select! {
            _ = stop_rx.changed() => break,
            flow = coordinator.handle_packet(&payload, active) => flow,
        };
        if flow == Flow::Stop {
            break;
        }
    }

    info!("Gossip loop stopped");
}

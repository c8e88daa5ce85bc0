//! Membership-driven retries of in-flight query runs.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tsq_common::{NodeId, TopologyVersion};

use crate::cluster::{ClusterView, MembershipEvent};
use crate::run::{RunOutcome, RunRegistry};

/// Forces runs that pull rows from a departed node into retry.
///
/// A departure is treated as a topology change, never as a hard failure.
#[derive(Clone)]
pub struct FailureMonitor {
    runs: Arc<RunRegistry>,
    cluster: Arc<dyn ClusterView>,
}

impl FailureMonitor {
    pub fn new(runs: Arc<RunRegistry>, cluster: Arc<dyn ClusterView>) -> Self {
        Self { runs, cluster }
    }

    /// Handle one membership event; returns the number of runs sent to retry.
    pub fn on_event(&self, event: &MembershipEvent) -> usize {
        let Some(node) = event.departed() else {
            return 0;
        };
        let version = self.cluster.ready_topology_version().max(event.version());
        self.on_node_left(node, version)
    }

    pub fn on_node_left(&self, node: &NodeId, version: TopologyVersion) -> usize {
        let mut retried = 0;
        for run in self.runs.snapshot() {
            if !run.has_source(node) {
                continue;
            }
            if run.transition(RunOutcome::Retry {
                version,
                node: Some(node.clone()),
                reason: "node_left",
            }) {
                retried += 1;
                info!(
                    request_id = %run.request_id(),
                    node = %node,
                    topology_version = %version,
                    operator = "FailureMonitor",
                    "participant left; query run will retry"
                );
            }
        }
        retried
    }

    /// Consume membership events until `shutdown` fires or the feed closes.
    pub fn spawn(
        self,
        mut events: broadcast::Receiver<MembershipEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => {
                        self.on_event(&event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            skipped,
                            operator = "FailureMonitor",
                            "membership feed lagged; checking liveness of every run source"
                        );
                        self.sweep_dead_sources();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(operator = "FailureMonitor", "failure monitor stopped");
        })
    }

    // Missed events may hide departures.
    fn sweep_dead_sources(&self) {
        let version = self.cluster.ready_topology_version();
        for run in self.runs.snapshot() {
            let dead = run
                .stores()
                .iter()
                .flat_map(|s| s.sources())
                .find(|n| !self.cluster.is_alive(n));
            if let Some(node) = dead {
                self.on_node_left(&node, version);
            }
        }
    }
}

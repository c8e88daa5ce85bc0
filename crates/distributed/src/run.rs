//! Per-attempt query run state and the registry routing replies to it.
//!
//! A run starts `Running` (no outcome). The first writer of an outcome wins:
//! - `Error`: terminal for the query;
//! - `Retry`: terminal for this attempt only.
//!
//! Writing the outcome drains the completion latch and fails every merge
//! store, so both the waiting caller and row consumers unblock.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use tokio::sync::watch;
use tsq_common::{NodeId, RequestId, TopologyVersion, TsqError};

use crate::merge::MergeStore;

/// Why a run ended with an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunFailure {
    Remote {
        node: Option<NodeId>,
        message: String,
    },
    /// Local node lost its cluster connection.
    Disconnected,
    /// Coordinator was stopped.
    Stopped,
}

impl RunFailure {
    pub fn fetch_failed(node: &NodeId) -> Self {
        RunFailure::Remote {
            node: Some(node.clone()),
            message: format!("failed to fetch data from node {node}"),
        }
    }

    pub fn to_error(&self) -> TsqError {
        match self {
            RunFailure::Remote { node, message } => TsqError::remote(node.clone(), message.clone()),
            RunFailure::Disconnected => TsqError::ClientDisconnected,
            RunFailure::Stopped => {
                TsqError::Interrupted("reduce coordinator is stopping".to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Error(RunFailure),
    Retry {
        version: TopologyVersion,
        node: Option<NodeId>,
        /// Metric label: `node_left`, `remote_retry` or `send_failed`.
        reason: &'static str,
    },
}

impl RunOutcome {
    /// Failure observed by row consumers of a store failed by this outcome.
    fn store_failure(&self) -> RunFailure {
        match self {
            RunOutcome::Error(f) => f.clone(),
            RunOutcome::Retry {
                node: Some(node), ..
            } => RunFailure::fetch_failed(node),
            RunOutcome::Retry { node: None, .. } => RunFailure::Remote {
                node: None,
                message: "query run was abandoned for retry".to_string(),
            },
        }
    }
}

/// Countdown of first pages still expected for a run.
#[derive(Debug)]
pub struct Latch {
    count: watch::Sender<usize>,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        let (count, _) = watch::channel(count);
        Self { count }
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    pub fn count_down(&self) {
        self.count.send_modify(|c| *c = c.saturating_sub(1));
    }

    pub fn drain(&self) {
        self.count.send_modify(|c| *c = 0);
    }

    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = rx.wait_for(|c| *c == 0).await;
    }
}

#[derive(Debug)]
pub struct QueryRun {
    request_id: RequestId,
    page_size: u32,
    stores: Vec<Arc<MergeStore>>,
    latch: Latch,
    outcome: OnceLock<RunOutcome>,
}

impl QueryRun {
    /// `participants` first pages are expected per store.
    pub fn new(
        request_id: RequestId,
        page_size: u32,
        stores: Vec<Arc<MergeStore>>,
        participants: usize,
    ) -> Self {
        let expected = stores.len() * participants;
        Self {
            request_id,
            page_size,
            stores,
            latch: Latch::new(expected),
            outcome: OnceLock::new(),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn stores(&self) -> &[Arc<MergeStore>] {
        &self.stores
    }

    pub fn store(&self, query: usize) -> Option<&Arc<MergeStore>> {
        self.stores.get(query)
    }

    pub fn latch(&self) -> &Latch {
        &self.latch
    }

    pub fn outcome(&self) -> Option<&RunOutcome> {
        self.outcome.get()
    }

    pub fn has_source(&self, node: &NodeId) -> bool {
        self.stores.iter().any(|s| s.has_source(node))
    }

    /// Record the terminal outcome. Returns `false` if one was already set.
    pub fn transition(&self, outcome: RunOutcome) -> bool {
        let failure = outcome.store_failure();
        if self.outcome.set(outcome).is_err() {
            return false;
        }
        self.latch.drain();
        for store in &self.stores {
            store.fail(None, failure.clone());
        }
        true
    }
}

/// Runs in flight, keyed by request id.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: DashMap<RequestId, Arc<QueryRun>>,
}

impl RunRegistry {
    pub fn insert(&self, run: Arc<QueryRun>) {
        self.runs.insert(run.request_id(), run);
    }

    pub fn get(&self, request_id: RequestId) -> Option<Arc<QueryRun>> {
        self.runs.get(&request_id).map(|r| Arc::clone(r.value()))
    }

    pub fn remove(&self, request_id: RequestId) -> Option<Arc<QueryRun>> {
        self.runs.remove(&request_id).map(|(_, run)| run)
    }

    pub fn snapshot(&self) -> Vec<Arc<QueryRun>> {
        self.runs.iter().map(|r| Arc::clone(r.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

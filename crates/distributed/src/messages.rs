//! Page protocol between the reduce coordinator and map participants.
//!
//! Flow for one request id:
//! - coordinator scatters a [`QueryRequest`] to every participant;
//! - each participant answers with the first [`NextPageResponse`] per map
//!   query (the only page carrying `all_rows`);
//! - further pages are pulled one at a time with [`NextPageRequest`], so at
//!   most one page per (request, map query, participant) is in flight;
//! - a participant that cannot run its map query replies [`FailResponse`];
//! - the coordinator sends a best-effort [`CancelRequest`] for anything it
//!   did not fully consume.

use std::collections::BTreeMap;

use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use tsq_common::{NodeId, PartitionId, RequestId, Result, TopologyVersion, TsqError};

use crate::query::SqlFragment;

/// Scatter request: map queries for one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub request_id: RequestId,
    pub page_size: u32,
    /// Main cache the query runs against.
    pub space: String,
    pub queries: Vec<SqlFragment>,
    /// Topology the participant set was resolved on.
    pub topology_version: TopologyVersion,
    /// Other caches joined by the query.
    pub extra_spaces: Vec<String>,
    /// Explicit partitions to scan, ascending; only under unstable partitioned topology.
    pub partitions: Option<Vec<PartitionId>>,
}

impl QueryRequest {
    /// Copy of this request addressed to `node`, carrying its partition slice.
    pub fn for_node(
        &self,
        node: &NodeId,
        partitions: Option<&BTreeMap<NodeId, Vec<PartitionId>>>,
    ) -> Result<Self> {
        let Some(parts) = partitions else {
            return Ok(self.clone());
        };
        let node_parts = parts.get(node).ok_or_else(|| {
            TsqError::InvalidConfig(format!("no partitions assigned to participant {node}"))
        })?;
        Ok(Self {
            partitions: Some(node_parts.clone()),
            ..self.clone()
        })
    }
}

/// Pull of the next page for one map query from one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextPageRequest {
    pub request_id: RequestId,
    pub query: usize,
    pub page_size: u32,
}

/// One page of map-query rows.
#[derive(Debug, Clone)]
pub struct NextPageResponse {
    pub request_id: RequestId,
    /// Map query index within the request.
    pub query: usize,
    /// Page sequence number, starting at 0.
    pub page: u32,
    /// Total rows of this map query on the participant; first page only.
    pub all_rows: Option<u64>,
    pub rows: Option<RecordBatch>,
    pub last: bool,
    /// Participant observed a newer topology and asks the coordinator to retry.
    pub retry: Option<TopologyVersion>,
}

impl NextPageResponse {
    pub fn is_first(&self) -> bool {
        self.all_rows.is_some()
    }

    pub fn row_count(&self) -> usize {
        self.rows.as_ref().map(|b| b.num_rows()).unwrap_or(0)
    }
}

/// Participant could not complete its map query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailResponse {
    pub request_id: RequestId,
    pub message: String,
}

/// Best-effort cancellation; no response expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub request_id: RequestId,
}

#[derive(Debug, Clone)]
pub enum QueryMessage {
    Request(QueryRequest),
    NextPageRequest(NextPageRequest),
    NextPageResponse(NextPageResponse),
    Fail(FailResponse),
    Cancel(CancelRequest),
}

impl QueryMessage {
    pub fn request_id(&self) -> RequestId {
        match self {
            QueryMessage::Request(m) => m.request_id,
            QueryMessage::NextPageRequest(m) => m.request_id,
            QueryMessage::NextPageResponse(m) => m.request_id,
            QueryMessage::Fail(m) => m.request_id,
            QueryMessage::Cancel(m) => m.request_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            QueryMessage::Request(_) => "QueryRequest",
            QueryMessage::NextPageRequest(_) => "NextPageRequest",
            QueryMessage::NextPageResponse(_) => "NextPageResponse",
            QueryMessage::Fail(_) => "FailResponse",
            QueryMessage::Cancel(_) => "CancelRequest",
        }
    }
}

//! Merge stores: local accumulation of map-query pages from every participant.
//!
//! Variants:
//! - [`MergeKind::Table`] copies every page into an in-memory table that the
//!   local engine queries once all sources are fetched. Next pages are pulled
//!   as soon as a page arrives.
//! - [`MergeKind::PassThrough`] queues pages for a single consumer that reads
//!   them directly. The next page from a source is pulled when the consumer
//!   takes the current one.

use std::collections::{BTreeMap, VecDeque};

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use parking_lot::Mutex;
use tokio::sync::watch;
use tsq_common::{NodeId, Result, TsqError};

use crate::run::RunFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    Table,
    PassThrough,
}

/// One page as accepted by a merge store.
#[derive(Debug, Clone)]
pub struct Page {
    pub source: NodeId,
    pub query: usize,
    pub page: u32,
    pub rows: Option<RecordBatch>,
    pub last: bool,
}

#[derive(Debug, Default)]
struct MergeState {
    /// Source node -> fetched all pages.
    sources: BTreeMap<NodeId, bool>,
    queue: VecDeque<Page>,
    rows: Vec<RecordBatch>,
    failure: Option<RunFailure>,
}

impl MergeState {
    fn fetched_all(&self) -> bool {
        self.sources.values().all(|done| *done)
    }
}

#[derive(Debug)]
pub struct MergeStore {
    query: usize,
    kind: MergeKind,
    columns: SchemaRef,
    state: Mutex<MergeState>,
    version: watch::Sender<u64>,
}

impl MergeStore {
    pub fn new(query: usize, kind: MergeKind, columns: SchemaRef) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            query,
            kind,
            columns,
            state: Mutex::new(MergeState::default()),
            version,
        }
    }

    pub fn query(&self) -> usize {
        self.query
    }

    pub fn kind(&self) -> MergeKind {
        self.kind
    }

    pub fn schema(&self) -> SchemaRef {
        self.columns.clone()
    }

    pub fn add_source(&self, node: NodeId) {
        self.state.lock().sources.entry(node).or_insert(false);
    }

    pub fn has_source(&self, node: &NodeId) -> bool {
        self.state.lock().sources.contains_key(node)
    }

    pub fn sources(&self) -> Vec<NodeId> {
        self.state.lock().sources.keys().cloned().collect()
    }

    pub fn fetched_all(&self) -> bool {
        self.state.lock().fetched_all()
    }

    pub fn failure(&self) -> Option<RunFailure> {
        self.state.lock().failure.clone()
    }

    /// Accept a page from one source. Pages arriving after a failure are dropped.
    pub fn add_page(&self, page: Page) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.failure.is_some() {
                return Ok(());
            }
            let done = match state.sources.get(&page.source) {
                Some(done) => *done,
                None => {
                    return Err(TsqError::remote(
                        page.source.clone(),
                        format!(
                            "page for map query {} from a node that is not a source",
                            self.query
                        ),
                    ));
                }
            };
            if done {
                return Err(TsqError::remote(
                    page.source.clone(),
                    format!("page {} arrived after the last page", page.page),
                ));
            }

            let rows = match page.rows {
                Some(batch) => Some(self.conform(&page.source, batch)?),
                None => None,
            };
            if page.last {
                state.sources.insert(page.source.clone(), true);
            }
            match self.kind {
                MergeKind::Table => {
                    if let Some(batch) = rows.filter(|b| b.num_rows() > 0) {
                        state.rows.push(batch);
                    }
                }
                MergeKind::PassThrough => state.queue.push_back(Page { rows, ..page }),
            }
        }
        self.notify();
        Ok(())
    }

    /// Fail the store if `node` (or, with `None`, any source) has not been fetched.
    pub fn fail(&self, node: Option<&NodeId>, failure: RunFailure) {
        {
            let mut state = self.state.lock();
            if state.failure.is_some() {
                return;
            }
            let pending = match node {
                Some(node) => state.sources.get(node) == Some(&false),
                None => !state.fetched_all(),
            };
            if !pending {
                return;
            }
            state.failure = Some(failure);
        }
        self.notify();
    }

    /// Resolve once every source delivered its last page.
    pub async fn wait_fetched_all(&self) -> Result<()> {
        let mut rx = self.version.subscribe();
        loop {
            {
                let state = self.state.lock();
                if let Some(failure) = &state.failure {
                    return Err(failure.to_error());
                }
                if state.fetched_all() {
                    return Ok(());
                }
            }
            if rx.changed().await.is_err() {
                return Err(TsqError::remote(None, "merge store closed"));
            }
        }
    }

    /// Next queued page in arrival order; `None` once all sources are drained.
    pub async fn next_page(&self) -> Result<Option<Page>> {
        let mut rx = self.version.subscribe();
        loop {
            {
                let mut state = self.state.lock();
                if let Some(page) = state.queue.pop_front() {
                    return Ok(Some(page));
                }
                if let Some(failure) = &state.failure {
                    return Err(failure.to_error());
                }
                if state.fetched_all() {
                    return Ok(None);
                }
            }
            if rx.changed().await.is_err() {
                return Err(TsqError::remote(None, "merge store closed"));
            }
        }
    }

    /// Rows copied into a table store so far.
    pub fn table_rows(&self) -> Vec<RecordBatch> {
        self.state.lock().rows.clone()
    }

    fn conform(&self, source: &NodeId, batch: RecordBatch) -> Result<RecordBatch> {
        let expected = self.columns.fields().len();
        if batch.num_columns() != expected {
            return Err(TsqError::remote(
                source.clone(),
                format!(
                    "map query {} returned {} columns, expected {expected}",
                    self.query,
                    batch.num_columns()
                ),
            ));
        }
        RecordBatch::try_new(self.columns.clone(), batch.columns().to_vec()).map_err(|e| {
            TsqError::remote(
                source.clone(),
                format!("map query {} rows do not match merge columns: {e}", self.query),
            )
        })
    }

    fn notify(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}

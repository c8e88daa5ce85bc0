//! Reduce-side coordinator.
//!
//! One call to [`ReduceCoordinator::query`] runs an unbounded attempt loop.
//! Each attempt:
//! 1. resolves participants for the current topology;
//! 2. builds a fresh [`QueryRun`] with one [`MergeStore`] per map query and
//!    registers it so replies can be routed by request id;
//! 3. scatters the map queries (remote participants first, the local node
//!    last);
//! 4. waits for the first page of every (map query, participant), checking
//!    participant liveness at a bounded interval;
//! 5. maps the run outcome to an error, a retry or result production.
//!
//! Per-attempt resources are released by the [`Attempt`] guard on every exit
//! path. A successful attempt hands its guard to the returned cursor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tsq_common::{
    MetricsRegistry, NodeId, ReduceConfig, RequestId, Result, TopologyVersion, TsqError,
    global_metrics,
};

use crate::cluster::{ClusterView, LocalMapExecutor, MembershipEvent, Transport};
use crate::cursor::{QueryCursor, first_text, plan_batch, plan_schema};
use crate::engine::{EngineConnection, LocalEngine, ScratchTables};
use crate::merge::{MergeKind, MergeStore, Page};
use crate::messages::{
    CancelRequest, FailResponse, NextPageRequest, NextPageResponse, QueryMessage, QueryRequest,
};
use crate::monitor::FailureMonitor;
use crate::query::TwoStepQuery;
use crate::run::{QueryRun, RunFailure, RunOutcome, RunRegistry};
use crate::topology::{self, Participants, Resolution};

/// External systems the coordinator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub cluster: Arc<dyn ClusterView>,
    pub transport: Arc<dyn Transport>,
    pub local: Arc<dyn LocalMapExecutor>,
    pub engine: Arc<dyn LocalEngine>,
}

#[derive(Clone)]
pub struct ReduceCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    config: ReduceConfig,
    cluster: Arc<dyn ClusterView>,
    transport: Arc<dyn Transport>,
    local: Arc<dyn LocalMapExecutor>,
    engine: Arc<dyn LocalEngine>,
    runs: Arc<RunRegistry>,
    scratch: ScratchTables,
    next_request_id: AtomicU64,
    stopped: AtomicBool,
    monitor: Mutex<Option<CancellationToken>>,
    metrics: MetricsRegistry,
}

enum AttemptStep {
    Done(QueryCursor),
    Retry {
        /// Topology to wait for before the next attempt.
        version: Option<TopologyVersion>,
        reason: &'static str,
    },
}

impl ReduceCoordinator {
    pub fn new(config: ReduceConfig, collaborators: Collaborators) -> Result<Self> {
        Self::with_metrics(config, collaborators, global_metrics().clone())
    }

    pub fn with_metrics(
        config: ReduceConfig,
        collaborators: Collaborators,
        metrics: MetricsRegistry,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                config,
                cluster: collaborators.cluster,
                transport: collaborators.transport,
                local: collaborators.local,
                engine: collaborators.engine,
                runs: Arc::new(RunRegistry::default()),
                scratch: ScratchTables::default(),
                next_request_id: AtomicU64::new(1),
                stopped: AtomicBool::new(false),
                monitor: Mutex::new(None),
                metrics,
            }),
        })
    }

    pub fn config(&self) -> &ReduceConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.inner.metrics
    }

    /// Runs currently registered (attempts in flight plus open cursors).
    pub fn active_runs(&self) -> usize {
        self.inner.runs.len()
    }

    /// Start the failure monitor on `events`. Must be called within a tokio runtime.
    pub fn start(&self, events: broadcast::Receiver<MembershipEvent>) -> Result<()> {
        let mut monitor = self.inner.monitor.lock();
        if monitor.is_some() {
            return Err(TsqError::InvalidConfig(
                "reduce coordinator is already started".to_string(),
            ));
        }
        let token = CancellationToken::new();
        FailureMonitor::new(Arc::clone(&self.inner.runs), Arc::clone(&self.inner.cluster))
            .spawn(events, token.clone());
        *monitor = Some(token);
        self.inner.stopped.store(false, Ordering::SeqCst);
        info!(operator = "ReduceCoordinator", "reduce coordinator started");
        Ok(())
    }

    /// Stop the failure monitor and fail every registered run.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Some(token) = self.inner.monitor.lock().take() {
            token.cancel();
        }
        for run in self.inner.runs.snapshot() {
            run.transition(RunOutcome::Error(RunFailure::Stopped));
        }
        info!(operator = "ReduceCoordinator", "reduce coordinator stopped");
    }

    /// The local node lost its cluster connection.
    pub fn on_disconnected(&self) {
        for run in self.inner.runs.snapshot() {
            if run.transition(RunOutcome::Error(RunFailure::Disconnected)) {
                warn!(
                    request_id = %run.request_id(),
                    operator = "ReduceCoordinator",
                    "client node disconnected; failing query run"
                );
            }
        }
    }

    /// Route a reply from a participant. Failures are logged, never returned.
    pub fn on_message(&self, from: &NodeId, msg: QueryMessage) {
        self.inner.on_message(from, msg);
    }

    /// Run `qry` with `space` as the main cache.
    ///
    /// Fails with [`TsqError::Interrupted`] once `cancel` fires while waiting.
    pub async fn query(
        &self,
        space: &str,
        qry: &TwoStepQuery,
        cancel: &CancellationToken,
    ) -> Result<QueryCursor> {
        qry.validate()?;
        let started = Instant::now();
        let res = self.run_attempts(space, qry, cancel).await;
        let outcome = match &res {
            Ok(_) => "ok",
            Err(e) => error_label(e),
        };
        self.inner
            .metrics
            .record_query(outcome, started.elapsed().as_secs_f64());
        res
    }

    async fn run_attempts(
        &self,
        space: &str,
        qry: &TwoStepQuery,
        cancel: &CancellationToken,
    ) -> Result<QueryCursor> {
        let page_size = self.inner.config.effective_page_size(qry.page_size);
        let extra = qry.extra_spaces(space);
        let mut attempt: u32 = 0;
        loop {
            if attempt > 0 {
                let delay = self.inner.config.retry_delay(attempt);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(interrupted("retry backoff")),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self
                .inner
                .attempt(space, &extra, qry, page_size, attempt, cancel)
                .await?
            {
                AttemptStep::Done(cursor) => return Ok(cursor),
                AttemptStep::Retry { version, reason } => {
                    self.inner.metrics.inc_retries(reason);
                    info!(
                        space,
                        attempt,
                        reason,
                        operator = "ReduceCoordinator",
                        "reduce attempt abandoned; retrying"
                    );
                    if let Some(version) = version {
                        self.inner.await_topology(version, cancel).await?;
                    }
                }
            }
            attempt = attempt.saturating_add(1);
        }
    }
}

impl CoordinatorInner {
    async fn attempt(
        self: &Arc<Self>,
        space: &str,
        extra: &[String],
        qry: &TwoStepQuery,
        page_size: u32,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<AttemptStep> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(interrupted("reduce coordinator is stopping"));
        }
        if self.cluster.client_disconnected() {
            return Err(TsqError::ClientDisconnected);
        }
        self.metrics.inc_attempts();

        let request_id = RequestId(self.next_request_id.fetch_add(1, Ordering::SeqCst));
        let topology_version = self.cluster.ready_topology_version();
        let resolution = {
            let mut rng = rand::thread_rng();
            topology::resolve(self.cluster.as_ref(), space, extra, qry.explain, &mut rng)?
        };
        let participants = match resolution {
            Resolution::Ready(p) => p,
            Resolution::Retry { reason } => {
                debug!(
                    request_id = %request_id,
                    attempt,
                    %reason,
                    operator = "TopologyResolver",
                    "participants not resolvable on current topology"
                );
                return Ok(AttemptStep::Retry {
                    version: None,
                    reason: "topology",
                });
            }
        };
        let nodes: Vec<NodeId> = participants.nodes.iter().cloned().collect();

        let kind = if qry.uses_pass_through() {
            MergeKind::PassThrough
        } else {
            MergeKind::Table
        };
        let stores: Vec<Arc<MergeStore>> = qry
            .map_queries
            .iter()
            .enumerate()
            .map(|(i, mq)| {
                let columns = if qry.explain {
                    plan_schema()
                } else {
                    mq.columns.clone()
                };
                let store = MergeStore::new(i, kind, columns);
                for node in &nodes {
                    store.add_source(node.clone());
                }
                Arc::new(store)
            })
            .collect();

        let run = Arc::new(QueryRun::new(request_id, page_size, stores, nodes.len()));
        let mut guard = Attempt::new(Arc::clone(self), Arc::clone(&run), nodes.clone());
        self.runs.insert(Arc::clone(&run));
        self.metrics.set_active_runs(self.runs.len());

        if kind == MergeKind::Table {
            guard.connect(space)?;
        }
        if self.cluster.client_disconnected() {
            return Err(TsqError::ClientDisconnected);
        }

        let queries = qry
            .map_queries
            .iter()
            .map(|mq| {
                if qry.explain {
                    mq.fragment.explain()
                } else {
                    mq.fragment.clone()
                }
            })
            .collect();
        let request = QueryRequest {
            request_id,
            page_size,
            space: space.to_string(),
            queries,
            topology_version,
            extra_spaces: extra.to_vec(),
            partitions: None,
        };
        info!(
            request_id = %request_id,
            attempt,
            space,
            nodes = nodes.len(),
            map_queries = qry.map_queries.len(),
            topology_version = %topology_version,
            operator = "ReduceCoordinator",
            "scattering map queries"
        );
        guard.scattered = true;
        if !self.scatter(&request, &participants)? {
            return Ok(AttemptStep::Retry {
                version: None,
                reason: "send_failed",
            });
        }

        self.await_replies(&run, &nodes, cancel).await?;
        if let Some(step) = outcome_step(&run)? {
            return Ok(step);
        }

        if qry.explain {
            self.await_stores_fetched(&run, &nodes, cancel).await?;
            if let Some(step) = outcome_step(&run)? {
                return Ok(step);
            }
            return self.explain(guard, qry).map(AttemptStep::Done);
        }
        if kind == MergeKind::PassThrough {
            return pass_through_cursor(guard).map(AttemptStep::Done);
        }

        self.await_stores_fetched(&run, &nodes, cancel).await?;
        if let Some(step) = outcome_step(&run)? {
            return Ok(step);
        }
        let rows = guard.session()?.query(&qry.reduce)?;
        debug!(
            request_id = %request_id,
            operator = "ReduceCoordinator",
            "reduce query started on merged rows"
        );
        let cursor = QueryCursor::new(
            rows.schema,
            futures::stream::unfold((guard, rows.batches), |(guard, mut batches)| async move {
                let next = batches.next()?;
                Some((next, (guard, batches)))
            }),
        );
        Ok(AttemptStep::Done(cursor))
    }

    /// Send the request to every participant. `Ok(false)` when a send failed.
    fn scatter(&self, request: &QueryRequest, participants: &Participants) -> Result<bool> {
        let local = self.cluster.local_node();
        let partitions = participants.partitions.as_ref();

        let mut wire = request.clone();
        if participants.nodes.iter().any(|n| *n != local) {
            for q in &mut wire.queries {
                q.marshal_params()?;
            }
        }

        let mut ok = true;
        for node in participants.nodes.iter().filter(|n| **n != local) {
            let msg = wire.for_node(node, partitions)?;
            if let Err(e) = self.transport.send(node, QueryMessage::Request(msg)) {
                if !e.is_retryable() {
                    return Err(e);
                }
                warn!(
                    request_id = %request.request_id,
                    node = %node,
                    error = %e,
                    operator = "ReduceCoordinator",
                    "failed to send map query request"
                );
                ok = false;
            }
        }

        if ok && participants.nodes.contains(&local) {
            let msg = request.for_node(&local, partitions)?;
            self.local.execute(QueryMessage::Request(msg));
        }
        Ok(ok)
    }

    async fn await_replies(
        &self,
        run: &Arc<QueryRun>,
        nodes: &[NodeId],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let interval = self.config.liveness_check_interval();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(interrupted("awaiting map query results")),
                done = tokio::time::timeout(interval, run.latch().wait()) => {
                    if done.is_ok() {
                        return Ok(());
                    }
                }
            }
            if self.check_participants(run, nodes) {
                return Ok(());
            }
        }
    }

    /// Wait until every table store holds all rows of every participant.
    async fn await_stores_fetched(
        &self,
        run: &Arc<QueryRun>,
        nodes: &[NodeId],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let interval = self.config.liveness_check_interval();
        let stores: Vec<Arc<MergeStore>> = run.stores().to_vec();
        for store in stores {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(interrupted("awaiting merge table rows")),
                    res = tokio::time::timeout(interval, store.wait_fetched_all()) => match res {
                        Ok(Ok(())) => break,
                        Ok(Err(e)) => {
                            if run.outcome().is_some() {
                                return Ok(());
                            }
                            return Err(e);
                        }
                        Err(_) => {
                            if self.check_participants(run, nodes) {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Drive the run to an outcome if a participant is gone. Returns whether it has one.
    fn check_participants(&self, run: &QueryRun, nodes: &[NodeId]) -> bool {
        if self.cluster.client_disconnected() {
            run.transition(RunOutcome::Error(RunFailure::Disconnected));
            return true;
        }
        if let Some(dead) = nodes.iter().find(|n| !self.cluster.is_alive(n)) {
            let version = self.cluster.ready_topology_version();
            if run.transition(RunOutcome::Retry {
                version,
                node: Some(dead.clone()),
                reason: "node_left",
            }) {
                info!(
                    request_id = %run.request_id(),
                    node = %dead,
                    operator = "ReduceCoordinator",
                    "participant is no longer alive"
                );
            }
            return true;
        }
        run.outcome().is_some()
    }

    async fn await_topology(
        &self,
        version: TopologyVersion,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(interrupted("awaiting topology version")),
            res = self.cluster.await_topology_version(version) => res,
        }
    }

    fn explain(&self, mut guard: Attempt, qry: &TwoStepQuery) -> Result<QueryCursor> {
        let mut plans = Vec::with_capacity(qry.map_queries.len() + 1);
        for store in guard.run.stores() {
            let plan = first_text(&store.table_rows()).ok_or_else(|| {
                TsqError::remote(
                    None,
                    format!("no plan returned for map query {}", store.query()),
                )
            })?;
            plans.push(plan);
        }

        // Plan the reduce step against empty tables shaped like the map output.
        let mut empty = Vec::with_capacity(qry.map_queries.len());
        for (i, mq) in qry.map_queries.iter().enumerate() {
            let name = self.scratch.slot(self.engine.as_ref(), i)?;
            empty.push((name, Arc::new(MergeStore::new(i, MergeKind::Table, mq.columns.clone()))));
        }
        let session = guard.session()?;
        for (name, store) in empty {
            session.bind_merge_table(&name, Some(store))?;
        }
        let rows = session.query(&qry.reduce.explain())?;
        let batches = rows.batches.collect::<Result<Vec<RecordBatch>>>()?;
        let reduce_plan = first_text(&batches).ok_or_else(|| {
            TsqError::Engine("local engine returned no plan for the reduce query".to_string())
        })?;
        plans.push(reduce_plan);

        Ok(QueryCursor::from_batches(
            plan_schema(),
            vec![plan_batch(plans)?],
        ))
    }

    fn on_message(&self, from: &NodeId, msg: QueryMessage) {
        if self.stopped.load(Ordering::SeqCst) {
            debug!(
                node = %from,
                kind = msg.kind(),
                operator = "ReduceCoordinator",
                "ignoring message; coordinator is stopped"
            );
            return;
        }
        if !self.cluster.is_alive(from) {
            debug!(
                node = %from,
                request_id = %msg.request_id(),
                kind = msg.kind(),
                operator = "ReduceCoordinator",
                "ignoring message from node that left the topology"
            );
            return;
        }
        let request_id = msg.request_id();
        let res = match msg {
            QueryMessage::NextPageResponse(resp) => self.on_next_page(from, resp),
            QueryMessage::Fail(fail) => {
                self.on_fail(from, fail);
                Ok(())
            }
            other => Err(TsqError::InvalidConfig(format!(
                "unexpected {} message for the reduce coordinator",
                other.kind()
            ))),
        };
        if let Err(e) = res {
            error!(
                node = %from,
                request_id = %request_id,
                error = %e,
                operator = "ReduceCoordinator",
                "failed to process message"
            );
        }
    }

    fn on_next_page(&self, from: &NodeId, resp: NextPageResponse) -> Result<()> {
        let Some(run) = self.runs.get(resp.request_id) else {
            debug!(
                request_id = %resp.request_id,
                node = %from,
                operator = "ReduceCoordinator",
                "page for a finished or cancelled request"
            );
            return Ok(());
        };
        self.metrics.inc_pages_received();

        if let Some(version) = resp.retry {
            run.transition(RunOutcome::Retry {
                version,
                node: Some(from.clone()),
                reason: "remote_retry",
            });
            return Ok(());
        }
        let Some(store) = run.store(resp.query).cloned() else {
            run.transition(RunOutcome::Error(RunFailure::Remote {
                node: Some(from.clone()),
                message: format!("page for unknown map query {}", resp.query),
            }));
            return Ok(());
        };

        let first = resp.is_first();
        let last = resp.last;
        debug!(
            request_id = %resp.request_id,
            node = %from,
            query = resp.query,
            page = resp.page,
            rows = resp.row_count(),
            last,
            operator = "ReduceCoordinator",
            "received page"
        );
        let page = Page {
            source: from.clone(),
            query: resp.query,
            page: resp.page,
            rows: resp.rows,
            last,
        };
        if let Err(e) = store.add_page(page) {
            run.transition(RunOutcome::Error(failure_from(from, e)));
            return Ok(());
        }
        if first {
            run.latch().count_down();
        }

        if store.kind() == MergeKind::Table && !last && run.outcome().is_none() {
            if let Err(e) = self.fetch_next_page(&run, from, resp.query) {
                warn!(
                    request_id = %resp.request_id,
                    node = %from,
                    error = %e,
                    operator = "ReduceCoordinator",
                    "failed to request next page"
                );
                run.transition(RunOutcome::Retry {
                    version: self.cluster.ready_topology_version(),
                    node: Some(from.clone()),
                    reason: "send_failed",
                });
            }
        }
        Ok(())
    }

    fn on_fail(&self, from: &NodeId, fail: FailResponse) {
        let Some(run) = self.runs.get(fail.request_id) else {
            return;
        };
        let failure = if *from == self.cluster.local_node() && self.cluster.client_disconnected() {
            RunFailure::Disconnected
        } else {
            RunFailure::Remote {
                node: Some(from.clone()),
                message: fail.message,
            }
        };
        if run.transition(RunOutcome::Error(failure)) {
            warn!(
                request_id = %fail.request_id,
                node = %from,
                operator = "ReduceCoordinator",
                "participant failed its map query"
            );
        }
    }

    /// Pull the next page of map query `query` from `node`.
    fn fetch_next_page(&self, run: &QueryRun, node: &NodeId, query: usize) -> Result<()> {
        if let Some(outcome) = run.outcome() {
            return Err(match outcome {
                RunOutcome::Error(RunFailure::Disconnected) => TsqError::ClientDisconnected,
                _ => RunFailure::fetch_failed(node).to_error(),
            });
        }
        self.metrics.inc_page_requests();
        let msg = QueryMessage::NextPageRequest(NextPageRequest {
            request_id: run.request_id(),
            query,
            page_size: run.page_size(),
        });
        self.deliver(node, msg)
            .map_err(|e| TsqError::remote(node.clone(), e.to_string()))
    }

    fn deliver(&self, node: &NodeId, msg: QueryMessage) -> Result<()> {
        if *node == self.cluster.local_node() {
            self.local.execute(msg);
            Ok(())
        } else {
            self.transport.send(node, msg)
        }
    }
}

/// Resources of one attempt, released on drop.
struct Attempt {
    inner: Arc<CoordinatorInner>,
    run: Arc<QueryRun>,
    nodes: Vec<NodeId>,
    session: Option<Box<dyn EngineConnection>>,
    bound: Vec<String>,
    scattered: bool,
}

impl Attempt {
    fn new(inner: Arc<CoordinatorInner>, run: Arc<QueryRun>, nodes: Vec<NodeId>) -> Self {
        Self {
            inner,
            run,
            nodes,
            session: None,
            bound: Vec::new(),
            scattered: false,
        }
    }

    /// Open the engine session and bind every store to its scratch table.
    fn connect(&mut self, space: &str) -> Result<()> {
        let session = self.session.insert(self.inner.engine.connect(space)?);
        for store in self.run.stores() {
            let name = self.inner.scratch.slot(self.inner.engine.as_ref(), store.query())?;
            self.bound.push(name.clone());
            session.bind_merge_table(&name, Some(Arc::clone(store)))?;
        }
        Ok(())
    }

    fn session(&mut self) -> Result<&mut Box<dyn EngineConnection>> {
        self.session
            .as_mut()
            .ok_or_else(|| TsqError::Engine("attempt has no engine session".to_string()))
    }
}

impl Drop for Attempt {
    fn drop(&mut self) {
        let request_id = self.run.request_id();
        if self.scattered && self.run.stores().iter().any(|s| !s.fetched_all()) {
            let cancel = QueryMessage::Cancel(CancelRequest { request_id });
            let mut sent = 0;
            for node in &self.nodes {
                match self.inner.deliver(node, cancel.clone()) {
                    Ok(()) => sent += 1,
                    Err(e) => debug!(
                        request_id = %request_id,
                        node = %node,
                        error = %e,
                        operator = "ReduceCoordinator",
                        "failed to send cancel"
                    ),
                }
            }
            self.inner.metrics.inc_cancels_sent(sent);
        }

        if let Some(mut session) = self.session.take() {
            for name in &self.bound {
                if let Err(e) = session.bind_merge_table(name, None) {
                    warn!(
                        request_id = %request_id,
                        table = %name,
                        error = %e,
                        operator = "ReduceCoordinator",
                        "failed to clear merge table binding"
                    );
                }
            }
        }

        if self.inner.runs.remove(request_id).is_none() {
            warn!(
                request_id = %request_id,
                operator = "ReduceCoordinator",
                "query run was already removed from the registry"
            );
        }
        self.inner.metrics.set_active_runs(self.inner.runs.len());
    }
}

fn pass_through_cursor(guard: Attempt) -> Result<QueryCursor> {
    let store = guard.run.stores().first().cloned().ok_or_else(|| {
        TsqError::InvalidConfig("pass-through query has no map query".to_string())
    })?;
    let schema = store.schema();
    let stream = futures::stream::unfold(
        (guard, store, false),
        |(guard, store, done)| async move {
            if done {
                return None;
            }
            loop {
                match store.next_page().await {
                    Ok(Some(page)) => {
                        if !page.last {
                            if let Err(e) =
                                guard
                                    .inner
                                    .fetch_next_page(&guard.run, &page.source, page.query)
                            {
                                return Some((Err(e), (guard, store, true)));
                            }
                        }
                        match page.rows {
                            Some(batch) if batch.num_rows() > 0 => {
                                return Some((Ok(batch), (guard, store, false)));
                            }
                            _ => continue,
                        }
                    }
                    Ok(None) => return None,
                    Err(e) => return Some((Err(e), (guard, store, true))),
                }
            }
        },
    );
    Ok(QueryCursor::new(schema, stream))
}

fn outcome_step(run: &QueryRun) -> Result<Option<AttemptStep>> {
    match run.outcome() {
        None => Ok(None),
        Some(RunOutcome::Error(failure)) => Err(failure.to_error()),
        Some(RunOutcome::Retry {
            version, reason, ..
        }) => Ok(Some(AttemptStep::Retry {
            version: Some(*version),
            reason: *reason,
        })),
    }
}

fn failure_from(node: &NodeId, err: TsqError) -> RunFailure {
    let message = match err {
        TsqError::RemoteExecution { message, .. } => message,
        other => other.to_string(),
    };
    RunFailure::Remote {
        node: Some(node.clone()),
        message,
    }
}

fn interrupted(while_doing: &str) -> TsqError {
    TsqError::Interrupted(format!("cancelled while {while_doing}"))
}

fn error_label(err: &TsqError) -> &'static str {
    match err {
        TsqError::ConfigurationMismatch(_) => "configuration_mismatch",
        TsqError::RemoteExecution { .. } => "remote_execution",
        TsqError::ClientDisconnected => "client_disconnected",
        TsqError::Interrupted(_) => "interrupted",
        TsqError::Send { .. } => "send_failed",
        TsqError::Engine(_) => "engine",
        TsqError::Codec(_) => "codec",
        TsqError::InvalidConfig(_) => "invalid_config",
        TsqError::Io(_) => "io",
    }
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;

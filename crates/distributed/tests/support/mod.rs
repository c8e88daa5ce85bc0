#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arrow::array::{Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tsq_common::{
    MetricsRegistry, NodeId, ReduceConfig, RequestId, Result, TopologyVersion, TsqError,
};
use tsq_distributed::codec::{decode_message, encode_message};
use tsq_distributed::{
    CacheMode, CacheTopology, ClusterView, Collaborators, EngineConnection, EngineRows,
    FailResponse, LocalEngine, LocalMapExecutor, MapQuery, MembershipEvent, MergeStore,
    NextPageRequest, NextPageResponse, QueryMessage, QueryRequest, ReduceCoordinator,
    SqlFragment, Transport, TwoStepQuery,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> ReduceConfig {
    ReduceConfig {
        default_page_size: 10,
        retry_delay_base_ms: 1,
        liveness_check_interval_ms: 20,
    }
}

pub fn value_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, true)]))
}

pub fn node(id: &str) -> NodeId {
    NodeId::from(id)
}

pub fn map_query(sql: &str) -> MapQuery {
    MapQuery {
        fragment: SqlFragment::new(sql),
        columns: value_schema(),
    }
}

pub fn two_step(map_sqls: &[&str], reduce_sql: &str, spaces: &[&str]) -> TwoStepQuery {
    TwoStepQuery {
        map_queries: map_sqls.iter().map(|s| map_query(s)).collect(),
        reduce: SqlFragment::new(reduce_sql),
        page_size: 0,
        explain: false,
        skip_merge_table: false,
        spaces: spaces.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn values(batches: &[RecordBatch]) -> Vec<i64> {
    let mut out = Vec::new();
    for batch in batches {
        let col = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("int64 column");
        out.extend(col.values().iter().copied());
    }
    out.sort_unstable();
    out
}

pub fn texts(batches: &[RecordBatch]) -> Vec<String> {
    let mut out = Vec::new();
    for batch in batches {
        let col = batch
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("utf8 column");
        for i in 0..col.len() {
            out.push(col.value(i).to_string());
        }
    }
    out
}

pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn bounded<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("operation finished within bound")
}

/// Partitioned cache with partition `p` owned by `owners[p % owners.len()]`.
pub fn partitioned_cache(name: &str, partitions: u32, owners: &[&str]) -> CacheTopology {
    let per_part: Vec<Vec<NodeId>> = (0..partitions)
        .map(|p| vec![NodeId::from(owners[p as usize % owners.len()])])
        .collect();
    CacheTopology {
        name: name.to_string(),
        mode: CacheMode::Partitioned,
        partitions,
        data_nodes: owners.iter().map(|s| NodeId::from(*s)).collect(),
        owners: per_part,
        rebalancing: false,
    }
}

pub fn replicated_cache(name: &str, partitions: u32, owners: &[&str]) -> CacheTopology {
    let nodes: Vec<NodeId> = owners.iter().map(|s| NodeId::from(*s)).collect();
    CacheTopology {
        name: name.to_string(),
        mode: CacheMode::Replicated,
        partitions,
        data_nodes: nodes.iter().cloned().collect(),
        owners: (0..partitions).map(|_| nodes.clone()).collect(),
        rebalancing: false,
    }
}

// ---------------------------------------------------------------------------
// Cluster view
// ---------------------------------------------------------------------------

struct ClusterState {
    alive: BTreeSet<NodeId>,
    caches: BTreeMap<String, CacheTopology>,
}

pub struct SimCluster {
    local: NodeId,
    state: Mutex<ClusterState>,
    disconnected: AtomicBool,
    version: watch::Sender<TopologyVersion>,
    events: broadcast::Sender<MembershipEvent>,
}

impl SimCluster {
    fn new(local: &str, nodes: &[&str]) -> Self {
        let (version, _) = watch::channel(TopologyVersion::new(1, 0));
        let (events, _) = broadcast::channel(64);
        Self {
            local: NodeId::from(local),
            state: Mutex::new(ClusterState {
                alive: nodes.iter().map(|s| NodeId::from(*s)).collect(),
                caches: BTreeMap::new(),
            }),
            disconnected: AtomicBool::new(false),
            version,
            events,
        }
    }

    pub fn set_cache(&self, cache: CacheTopology) {
        self.state.lock().caches.insert(cache.name.clone(), cache);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    pub fn version(&self) -> TopologyVersion {
        *self.version.borrow()
    }

    pub fn bump_minor(&self) -> TopologyVersion {
        self.version.send_modify(|v| v.minor += 1);
        self.version()
    }

    /// Remove `node` from the topology and publish a failure event.
    pub fn kill(&self, node: &str) {
        let node = NodeId::from(node);
        self.remove_node(&node);
        let _ = self.events.send(MembershipEvent::NodeFailed {
            node,
            version: self.version(),
        });
    }

    /// Remove `node` without any membership event.
    pub fn kill_silently(&self, node: &str) {
        self.remove_node(&NodeId::from(node));
    }

    // Departed nodes stop owning data in every cache.
    fn remove_node(&self, node: &NodeId) {
        {
            let mut state = self.state.lock();
            state.alive.remove(node);
            for cache in state.caches.values_mut() {
                cache.data_nodes.remove(node);
                for owners in &mut cache.owners {
                    owners.retain(|n| n != node);
                }
            }
        }
        self.version
            .send_modify(|v| *v = TopologyVersion::new(v.major + 1, 0));
    }

    pub fn set_disconnected(&self, disconnected: bool) {
        self.disconnected.store(disconnected, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterView for SimCluster {
    fn local_node(&self) -> NodeId {
        self.local.clone()
    }

    fn is_alive(&self, node: &NodeId) -> bool {
        self.state.lock().alive.contains(node)
    }

    fn ready_topology_version(&self) -> TopologyVersion {
        self.version()
    }

    async fn await_topology_version(&self, version: TopologyVersion) -> Result<()> {
        let mut rx = self.version.subscribe();
        rx.wait_for(|v| *v >= version)
            .await
            .map(|_| ())
            .map_err(|_| TsqError::Interrupted("topology feed closed".to_string()))
    }

    fn client_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn cache(&self, name: &str) -> Option<CacheTopology> {
        self.state.lock().caches.get(name).cloned()
    }
}

// ---------------------------------------------------------------------------
// Map-side nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Behavior {
    /// Page through the node's rows on demand.
    Serve,
    /// Accept requests and never answer.
    Silent,
    /// Answer first pages, ignore page pulls.
    StallPulls,
    /// Reply with a failure.
    Fail(String),
    /// Ask the coordinator to retry on `version` once, then serve.
    RetryOnce(TopologyVersion),
}

/// Delivers replies of one node back to the coordinator on a spawned task.
#[derive(Clone)]
pub struct ReplySink {
    coordinator: Arc<OnceLock<ReduceCoordinator>>,
    from: NodeId,
    remote: bool,
}

impl ReplySink {
    fn reply(&self, msg: QueryMessage) {
        let msg = if self.remote {
            let bytes = encode_message(&msg).expect("encode reply");
            decode_message(&bytes).expect("decode reply")
        } else {
            msg
        };
        let coordinator = Arc::clone(&self.coordinator);
        let from = self.from.clone();
        tokio::spawn(async move {
            if let Some(c) = coordinator.get() {
                c.on_message(&from, msg);
            }
        });
    }
}

struct OpenCursor {
    next_page: u32,
    pages: VecDeque<RecordBatch>,
}

pub struct SimNode {
    pub id: NodeId,
    data: Mutex<HashMap<String, Vec<i64>>>,
    behavior: Mutex<Behavior>,
    cursors: Mutex<HashMap<(RequestId, usize), OpenCursor>>,
    requests: Mutex<Vec<QueryRequest>>,
    pulls: Mutex<BTreeMap<usize, usize>>,
    cancels: AtomicUsize,
}

impl SimNode {
    fn new(id: &str) -> Self {
        Self {
            id: NodeId::from(id),
            data: Mutex::new(HashMap::new()),
            behavior: Mutex::new(Behavior::Serve),
            cursors: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            pulls: Mutex::new(BTreeMap::new()),
            cancels: AtomicUsize::new(0),
        }
    }

    /// Rows this node returns for map query `sql`.
    pub fn set_rows(&self, sql: &str, rows: Vec<i64>) {
        self.data.lock().insert(sql.to_string(), rows);
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn requests(&self) -> Vec<QueryRequest> {
        self.requests.lock().clone()
    }

    /// Next-page pulls received for map query `query`.
    pub fn pulls(&self, query: usize) -> usize {
        self.pulls.lock().get(&query).copied().unwrap_or(0)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn open_cursors(&self) -> usize {
        self.cursors.lock().len()
    }

    fn handle(&self, msg: QueryMessage, sink: &ReplySink) {
        match msg {
            QueryMessage::Request(req) => self.on_request(req, sink),
            QueryMessage::NextPageRequest(req) => self.on_pull(req, sink),
            QueryMessage::Cancel(cancel) => {
                self.cancels.fetch_add(1, Ordering::SeqCst);
                self.cursors
                    .lock()
                    .retain(|(id, _), _| *id != cancel.request_id);
            }
            other => panic!("map node got unexpected {}", other.kind()),
        }
    }

    fn on_request(&self, req: QueryRequest, sink: &ReplySink) {
        self.requests.lock().push(req.clone());
        let behavior = self.behavior.lock().clone();
        match behavior {
            Behavior::Silent => return,
            Behavior::Fail(message) => {
                sink.reply(QueryMessage::Fail(FailResponse {
                    request_id: req.request_id,
                    message,
                }));
                return;
            }
            Behavior::RetryOnce(version) => {
                self.set_behavior(Behavior::Serve);
                for query in 0..req.queries.len() {
                    sink.reply(QueryMessage::NextPageResponse(NextPageResponse {
                        request_id: req.request_id,
                        query,
                        page: 0,
                        all_rows: Some(0),
                        rows: None,
                        last: true,
                        retry: Some(version),
                    }));
                }
                return;
            }
            Behavior::Serve | Behavior::StallPulls => {}
        }

        for (query, fragment) in req.queries.iter().enumerate() {
            let (total, mut pages) = self.pages_for(fragment, req.page_size);
            let first = pages.pop_front();
            let last = pages.is_empty();
            if !last {
                self.cursors.lock().insert(
                    (req.request_id, query),
                    OpenCursor {
                        next_page: 1,
                        pages,
                    },
                );
            }
            sink.reply(QueryMessage::NextPageResponse(NextPageResponse {
                request_id: req.request_id,
                query,
                page: 0,
                all_rows: Some(total),
                rows: first,
                last,
                retry: None,
            }));
        }
    }

    fn on_pull(&self, req: NextPageRequest, sink: &ReplySink) {
        *self.pulls.lock().entry(req.query).or_default() += 1;
        if *self.behavior.lock() == Behavior::StallPulls {
            return;
        }
        let reply = {
            let mut cursors = self.cursors.lock();
            let Some(cursor) = cursors.get_mut(&(req.request_id, req.query)) else {
                return;
            };
            let rows = cursor.pages.pop_front();
            let page = cursor.next_page;
            cursor.next_page += 1;
            let last = cursor.pages.is_empty();
            if last {
                cursors.remove(&(req.request_id, req.query));
            }
            NextPageResponse {
                request_id: req.request_id,
                query: req.query,
                page,
                all_rows: None,
                rows,
                last,
                retry: None,
            }
        };
        sink.reply(QueryMessage::NextPageResponse(reply));
    }

    fn pages_for(&self, fragment: &SqlFragment, page_size: u32) -> (u64, VecDeque<RecordBatch>) {
        if fragment.sql.starts_with("EXPLAIN ") {
            let plan = plan_rows(vec![fragment.sql.clone()]);
            return (1, VecDeque::from([plan]));
        }
        let rows = self
            .data
            .lock()
            .get(&fragment.sql)
            .cloned()
            .unwrap_or_default();
        let pages = rows
            .chunks(page_size.max(1) as usize)
            .map(|chunk| int_rows(chunk.to_vec()))
            .collect();
        (rows.len() as u64, pages)
    }
}

fn int_rows(values: Vec<i64>) -> RecordBatch {
    RecordBatch::try_new(value_schema(), vec![Arc::new(Int64Array::from(values))])
        .expect("int rows")
}

fn plan_rows(plans: Vec<String>) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new("PLAN", DataType::Utf8, false)]));
    RecordBatch::try_new(schema, vec![Arc::new(StringArray::from(plans))]).expect("plan rows")
}

/// Remote delivery through the wire codec.
pub struct SimTransport {
    nodes: BTreeMap<NodeId, Arc<SimNode>>,
    coordinator: Arc<OnceLock<ReduceCoordinator>>,
    failing_sends: Mutex<BTreeMap<NodeId, usize>>,
}

impl SimTransport {
    /// Fail the next `count` sends to `node`.
    pub fn fail_sends(&self, node: &str, count: usize) {
        self.failing_sends.lock().insert(NodeId::from(node), count);
    }
}

impl Transport for SimTransport {
    fn send(&self, node: &NodeId, msg: QueryMessage) -> Result<()> {
        if let Some(left) = self.failing_sends.lock().get_mut(node) {
            if *left > 0 {
                *left -= 1;
                return Err(TsqError::Send {
                    node: node.clone(),
                    message: "connection reset".to_string(),
                });
            }
        }
        let target = self.nodes.get(node).cloned().ok_or_else(|| TsqError::Send {
            node: node.clone(),
            message: "unknown node".to_string(),
        })?;
        let bytes = encode_message(&msg)?;
        let sink = ReplySink {
            coordinator: Arc::clone(&self.coordinator),
            from: node.clone(),
            remote: true,
        };
        tokio::spawn(async move {
            let msg = decode_message(&bytes).expect("decode request");
            target.handle(msg, &sink);
        });
        Ok(())
    }
}

pub struct LocalExec {
    node: Arc<SimNode>,
    sink: ReplySink,
}

impl LocalMapExecutor for LocalExec {
    fn execute(&self, msg: QueryMessage) {
        let node = Arc::clone(&self.node);
        let sink = self.sink.clone();
        tokio::spawn(async move { node.handle(msg, &sink) });
    }
}

// ---------------------------------------------------------------------------
// Embedded engine
// ---------------------------------------------------------------------------

/// Engine understanding `SELECT * FROM __Tn [, __Tm ...]` (concatenation of the
/// referenced merge tables) and `EXPLAIN <anything>`.
#[derive(Default)]
pub struct MemoryEngine {
    tables: Arc<Mutex<BTreeSet<String>>>,
    created: AtomicUsize,
    sessions: AtomicUsize,
    live_bindings: Arc<AtomicI64>,
    statements: Arc<Mutex<Vec<String>>>,
}

impl MemoryEngine {
    pub fn tables_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn live_bindings(&self) -> i64 {
        self.live_bindings.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }
}

impl LocalEngine for MemoryEngine {
    fn create_merge_table(&self, name: &str) -> Result<()> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.tables.lock().insert(name.to_string());
        Ok(())
    }

    fn connect(&self, _space: &str) -> Result<Box<dyn EngineConnection>> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            tables: Arc::clone(&self.tables),
            bindings: HashMap::new(),
            live_bindings: Arc::clone(&self.live_bindings),
            statements: Arc::clone(&self.statements),
        }))
    }
}

struct MemorySession {
    tables: Arc<Mutex<BTreeSet<String>>>,
    bindings: HashMap<String, Arc<MergeStore>>,
    live_bindings: Arc<AtomicI64>,
    statements: Arc<Mutex<Vec<String>>>,
}

impl EngineConnection for MemorySession {
    fn bind_merge_table(&mut self, name: &str, store: Option<Arc<MergeStore>>) -> Result<()> {
        if !self.tables.lock().contains(name) {
            return Err(TsqError::Engine(format!("table {name} does not exist")));
        }
        match store {
            Some(store) => {
                if self.bindings.insert(name.to_string(), store).is_none() {
                    self.live_bindings.fetch_add(1, Ordering::SeqCst);
                }
            }
            None => {
                if self.bindings.remove(name).is_some() {
                    self.live_bindings.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        Ok(())
    }

    fn query(&mut self, statement: &SqlFragment) -> Result<EngineRows> {
        self.statements.lock().push(statement.sql.clone());
        let referenced: Vec<&str> = statement
            .sql
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|t| t.starts_with("__T"))
            .collect();
        let mut stores = Vec::with_capacity(referenced.len());
        for name in &referenced {
            let store = self
                .bindings
                .get(*name)
                .cloned()
                .ok_or_else(|| TsqError::Engine(format!("table {name} has no rows bound")))?;
            stores.push(store);
        }

        if statement.sql.starts_with("EXPLAIN ") {
            let plan = plan_rows(vec![statement.sql.clone()]);
            return Ok(EngineRows {
                schema: plan.schema(),
                batches: Box::new(std::iter::once(Ok(plan))),
            });
        }

        let Some(first) = stores.first() else {
            return Err(TsqError::Engine(format!(
                "unsupported statement: {}",
                statement.sql
            )));
        };
        let schema = first.schema();
        let batches: Vec<Result<RecordBatch>> = stores
            .iter()
            .flat_map(|s| s.table_rows())
            .map(Ok)
            .collect();
        Ok(EngineRows {
            schema,
            batches: Box::new(batches.into_iter()),
        })
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub struct Sim {
    pub cluster: Arc<SimCluster>,
    pub transport: Arc<SimTransport>,
    pub engine: Arc<MemoryEngine>,
    pub nodes: BTreeMap<NodeId, Arc<SimNode>>,
    pub coordinator: ReduceCoordinator,
    pub metrics: MetricsRegistry,
}

impl Sim {
    /// Cluster of `local` plus `remotes`, all alive, topology version 1.0.
    pub fn new(local: &str, remotes: &[&str]) -> Self {
        Self::with_config(local, remotes, test_config())
    }

    pub fn with_config(local: &str, remotes: &[&str], config: ReduceConfig) -> Self {
        init_tracing();
        let mut all = vec![local];
        all.extend_from_slice(remotes);
        let cluster = Arc::new(SimCluster::new(local, &all));
        let handle: Arc<OnceLock<ReduceCoordinator>> = Arc::new(OnceLock::new());

        let nodes: BTreeMap<NodeId, Arc<SimNode>> = all
            .iter()
            .map(|id| (NodeId::from(*id), Arc::new(SimNode::new(id))))
            .collect();
        let remote_nodes = nodes
            .iter()
            .filter(|(id, _)| id.as_str() != local)
            .map(|(id, n)| (id.clone(), Arc::clone(n)))
            .collect();
        let transport = Arc::new(SimTransport {
            nodes: remote_nodes,
            coordinator: Arc::clone(&handle),
            failing_sends: Mutex::new(BTreeMap::new()),
        });
        let local_exec = Arc::new(LocalExec {
            node: Arc::clone(&nodes[&NodeId::from(local)]),
            sink: ReplySink {
                coordinator: Arc::clone(&handle),
                from: NodeId::from(local),
                remote: false,
            },
        });
        let engine = Arc::new(MemoryEngine::default());
        let metrics = MetricsRegistry::new();

        let coordinator = ReduceCoordinator::with_metrics(
            config,
            Collaborators {
                cluster: cluster.clone(),
                transport: transport.clone(),
                local: local_exec,
                engine: engine.clone(),
            },
            metrics.clone(),
        )
        .expect("coordinator");
        let _ = handle.set(coordinator.clone());

        Self {
            cluster,
            transport,
            engine,
            nodes,
            coordinator,
            metrics,
        }
    }

    pub fn node(&self, id: &str) -> &Arc<SimNode> {
        self.nodes.get(&NodeId::from(id)).expect("known node")
    }

    /// Start the failure monitor on the cluster's membership feed.
    pub fn start(&self) {
        self.coordinator
            .start(self.cluster.subscribe())
            .expect("start coordinator");
    }
}

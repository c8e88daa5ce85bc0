use std::sync::{Arc, OnceLock};

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, IntCounter, Opts, Registry, TextEncoder,
};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    queries: CounterVec,
    attempts: IntCounter,
    retries: CounterVec,
    pages_received: IntCounter,
    page_requests: IntCounter,
    cancels_sent: IntCounter,
    active_runs: Gauge,
    query_seconds: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Record a finished query; `outcome` is `ok` or the surfaced error kind.
    pub fn record_query(&self, outcome: &str, secs: f64) {
        self.inner.queries.with_label_values(&[outcome]).inc();
        self.inner.query_seconds.observe(secs.max(0.0));
    }

    pub fn inc_attempts(&self) {
        self.inner.attempts.inc();
    }

    pub fn inc_retries(&self, reason: &str) {
        self.inner.retries.with_label_values(&[reason]).inc();
    }

    pub fn inc_pages_received(&self) {
        self.inner.pages_received.inc();
    }

    pub fn inc_page_requests(&self) {
        self.inner.page_requests.inc();
    }

    pub fn inc_cancels_sent(&self, n: u64) {
        self.inner.cancels_sent.inc_by(n);
    }

    pub fn set_active_runs(&self, runs: usize) {
        self.inner.active_runs.set(runs as f64);
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let queries = counter_vec(
            &registry,
            "tsq_reduce_queries_total",
            "Reduce queries finished, by outcome",
            &["outcome"],
        );
        let attempts = int_counter(
            &registry,
            "tsq_reduce_attempts_total",
            "Reduce attempts started",
        );
        let retries = counter_vec(
            &registry,
            "tsq_reduce_retries_total",
            "Reduce attempts abandoned for retry, by reason",
            &["reason"],
        );
        let pages_received = int_counter(
            &registry,
            "tsq_pages_received_total",
            "Result pages received from participants",
        );
        let page_requests = int_counter(
            &registry,
            "tsq_page_requests_total",
            "Follow-up page pulls sent to participants",
        );
        let cancels_sent = int_counter(
            &registry,
            "tsq_cancels_sent_total",
            "Best-effort cancel requests sent to participants",
        );
        let active_runs = Gauge::with_opts(Opts::new(
            "tsq_active_runs",
            "Query runs currently registered",
        ))
        .expect("gauge");
        registry
            .register(Box::new(active_runs.clone()))
            .expect("register gauge");
        let query_seconds = Histogram::with_opts(HistogramOpts::new(
            "tsq_query_seconds",
            "Wall time from query submission to result hand-off",
        ))
        .expect("histogram");
        registry
            .register(Box::new(query_seconds.clone()))
            .expect("register histogram");

        Self {
            registry,
            queries,
            attempts,
            retries,
            pages_received,
            page_requests,
            cancels_sent,
            active_runs,
            query_seconds,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn int_counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).expect("int counter");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

//! ---
//! xbar_section: "03-persistence-logging"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "Metrics collection and export utilities."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Registry shared by the daemon and node metrics.
pub type SharedRegistry = Arc<Registry>;

pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Prometheus text rendering of everything registered in `registry`.
pub fn render(registry: &Registry) -> Result<String> {
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .context("unable to encode node metrics")
}

async fn scrape(State(registry): State<SharedRegistry>) -> Response {
    match render(&registry) {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(err) => {
            error!(error = %err, "metrics scrape failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable").into_response()
        }
    }
}

/// `/metrics` endpoint of a running node daemon.
#[derive(Debug)]
pub struct MetricsExporter {
    local_addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsExporter {
    /// Bind `addr` (port 0 picks a free port) and serve scrapes until [`stop`](Self::stop).
    pub async fn bind(registry: SharedRegistry, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("metrics exporter cannot listen on {addr}"))?;
        let local_addr = listener
            .local_addr()
            .context("metrics exporter has no local address")?;
        let app = Router::new()
            .route("/metrics", get(scrape))
            .with_state(registry);

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stopped.await;
                })
                .await
                .context("metrics exporter stopped with an error")
        });
        info!(address = %local_addr, "metrics exporter listening");

        Ok(Self {
            local_addr,
            stop: Some(stop),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting scrapes and wait for in-flight ones to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task
            .await
            .context("metrics exporter task panicked")?
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    config_load_seconds: Histogram,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "xbard_starts_total",
            "Total number of times the node daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 16)
            .context("failed to construct histogram buckets")?;
        let config_load_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "xbard_config_load_seconds",
                "Time spent loading and validating the node configuration",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(config_load_seconds.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new(
                "xbard_build_info",
                "Build metadata for the running daemon binary",
            ),
            &["version", "profile"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            config_load_seconds,
            build_info,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn observe_config_load(&self, seconds: f64) {
        self.config_load_seconds.observe(seconds);
    }

    pub fn set_build_info(&self, version: &str, profile: &str) {
        self.build_info
            .with_label_values(&[version, profile])
            .set(1.0);
    }
}

/// Metrics describing node startup progress and control-plane traffic.
#[derive(Clone, Debug)]
pub struct NodeMetrics {
    registry: SharedRegistry,
    node_state: IntGaugeVec,
    control_calls: IntCounterVec,
    workers_started: IntCounterVec,
    schema_declarations: IntCounter,
    component_early_exits: IntCounter,
}

impl NodeMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let node_state = IntGaugeVec::new(
            Opts::new(
                "xbar_node_state",
                "Indicator (0/1) of the startup state the node is currently in",
            ),
            &["state"],
        )?;
        registry.register(Box::new(node_state.clone()))?;

        let control_calls = IntCounterVec::new(
            Opts::new(
                "xbar_control_calls_total",
                "Control-plane calls issued by the startup sequencer by procedure and outcome",
            ),
            &["procedure", "outcome"],
        )?;
        registry.register(Box::new(control_calls.clone()))?;

        let workers_started = IntCounterVec::new(
            Opts::new(
                "xbar_workers_started_total",
                "Workers started by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(workers_started.clone()))?;

        let schema_declarations = IntCounter::with_opts(Opts::new(
            "xbar_schema_declarations_total",
            "Schema declarations extracted while starting realms",
        ))?;
        registry.register(Box::new(schema_declarations.clone()))?;

        let component_early_exits = IntCounter::with_opts(Opts::new(
            "xbar_component_early_exits_total",
            "Container components that stopped within the startup grace window",
        ))?;
        registry.register(Box::new(component_early_exits.clone()))?;

        Ok(Self {
            registry,
            node_state,
            control_calls,
            workers_started,
            schema_declarations,
            component_early_exits,
        })
    }

    /// Metrics on a private registry, for tests and embedding.
    pub fn detached() -> Result<Self> {
        Self::new(new_registry())
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Mark `state` as current and clear `previous`.
    pub fn set_state(&self, previous: Option<&str>, state: &str) {
        if let Some(previous) = previous {
            self.node_state.with_label_values(&[previous]).set(0);
        }
        self.node_state.with_label_values(&[state]).set(1);
    }

    pub fn state_value(&self, state: &str) -> i64 {
        self.node_state.with_label_values(&[state]).get()
    }

    pub fn record_call(&self, procedure: &str, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        self.control_calls
            .with_label_values(&[procedure, outcome])
            .inc();
    }

    pub fn calls(&self, procedure: &str, ok: bool) -> u64 {
        let outcome = if ok { "ok" } else { "error" };
        self.control_calls
            .with_label_values(&[procedure, outcome])
            .get()
    }

    pub fn record_worker_started(&self, kind: &str) {
        self.workers_started.with_label_values(&[kind]).inc();
    }

    pub fn workers_started(&self, kind: &str) -> u64 {
        self.workers_started.with_label_values(&[kind]).get()
    }

    pub fn record_schema_declarations(&self, count: usize) {
        self.schema_declarations.inc_by(count as u64);
    }

    pub fn record_component_early_exit(&self) {
        self.component_early_exits.inc();
    }

    pub fn component_early_exits(&self) -> u64 {
        self.component_early_exits.get()
    }
}

pub use prometheus;

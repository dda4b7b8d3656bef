//! ---
//! scada_section: "03-persistence-metrics"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Metrics collection and export utilities."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! The SCADA master's Prometheus families and their scrape endpoint.
//!
//! [`MasterMetrics`] owns its registry; the daemon calls
//! [`MasterMetrics::serve`] once at startup and the infrastructure scraper
//! pulls `/metrics` from there. Every bounded queue named in the concurrency
//! contract exposes its high-water mark here.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Renders the registry for the scraper. Encoding problems answer 500 so a
/// broken exporter shows up on the scraper side instead of silently serving
/// an empty page.
async fn scrape(State(registry): State<Arc<Registry>>) -> Response {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&registry.gather()) {
        Ok(body) => (
            [(header::CONTENT_TYPE, encoder.format_type().to_owned())],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "metric families failed to encode");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response()
        }
    }
}

/// Running scrape endpoint, stopped through [`MetricsExporter::shutdown`].
pub struct MetricsExporter {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MetricsExporter {
    /// Address the scraper should pull from.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop serving and wait for the endpoint task.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await?;
        Ok(())
    }
}

/// Metric families recorded by the SCADA master.
#[derive(Clone)]
pub struct MasterMetrics {
    registry: Arc<Registry>,
    node_state: IntGaugeVec,
    frames_received: IntCounterVec,
    queue_high_water: IntGaugeVec,
    fanout_subscribers: IntGauge,
    fanout_dropped: IntCounter,
    alarms_active: IntGaugeVec,
    sbo_sessions: IntCounterVec,
    historian_rows: IntCounter,
    historian_spill_depth: IntGauge,
    historian_rows_lost: IntCounter,
}

impl MasterMetrics {
    /// Create the master's families on a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let node_state = IntGaugeVec::new(
            Opts::new(
                "scada_node_link_state",
                "Indicator (0/1) of the current link state per node",
            ),
            &["node", "state"],
        )?;
        registry.register(Box::new(node_state.clone()))?;

        let frames_received = IntCounterVec::new(
            Opts::new(
                "scada_frames_received_total",
                "Control-channel frames received, by node and kind",
            ),
            &["node", "kind"],
        )?;
        registry.register(Box::new(frames_received.clone()))?;

        let queue_high_water = IntGaugeVec::new(
            Opts::new(
                "scada_queue_high_water",
                "Highest observed depth of each bounded queue",
            ),
            &["queue"],
        )?;
        registry.register(Box::new(queue_high_water.clone()))?;

        let fanout_subscribers = IntGauge::with_opts(Opts::new(
            "scada_fanout_subscribers",
            "Currently subscribed dashboard clients",
        ))?;
        registry.register(Box::new(fanout_subscribers.clone()))?;

        let fanout_dropped = IntCounter::with_opts(Opts::new(
            "scada_fanout_dropped_total",
            "Messages dropped from slow-consumer queues",
        ))?;
        registry.register(Box::new(fanout_dropped.clone()))?;

        let alarms_active = IntGaugeVec::new(
            Opts::new("scada_alarms_active", "Active alarms by severity"),
            &["severity"],
        )?;
        registry.register(Box::new(alarms_active.clone()))?;

        let sbo_sessions = IntCounterVec::new(
            Opts::new(
                "scada_sbo_sessions_total",
                "SBO sessions by terminal outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(sbo_sessions.clone()))?;

        let historian_rows = IntCounter::with_opts(Opts::new(
            "scada_historian_rows_written_total",
            "Rows successfully written to the historian sink",
        ))?;
        registry.register(Box::new(historian_rows.clone()))?;

        let historian_spill_depth = IntGauge::with_opts(Opts::new(
            "scada_historian_spill_depth",
            "Rows currently held in the historian spillover buffer",
        ))?;
        registry.register(Box::new(historian_spill_depth.clone()))?;

        let historian_rows_lost = IntCounter::with_opts(Opts::new(
            "scada_historian_rows_lost_total",
            "Rows dropped from the historian spillover buffer",
        ))?;
        registry.register(Box::new(historian_rows_lost.clone()))?;

        Ok(Self {
            registry,
            node_state,
            frames_received,
            queue_high_water,
            fanout_subscribers,
            fanout_dropped,
            alarms_active,
            sbo_sessions,
            historian_rows,
            historian_spill_depth,
            historian_rows_lost,
        })
    }

    /// The registry backing these families (tests and extra registrations).
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Bind `listen` and start answering `/metrics` scrapes.
    pub async fn serve(&self, listen: SocketAddr) -> Result<MetricsExporter> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("failed to bind metrics listener {listen}"))?;
        let addr = listener.local_addr()?;
        info!(address = %addr, "prometheus scrape endpoint up");

        let app = Router::new()
            .route("/metrics", get(scrape))
            .with_state(self.registry.clone());

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(err) = server.await {
                warn!(error = %err, "metrics endpoint exited with error");
            }
        });

        Ok(MetricsExporter {
            addr,
            shutdown: shutdown_tx,
            task,
        })
    }

    /// Record a node's link state (clears the other state labels for the node).
    pub fn set_node_state(&self, node: &str, state: &str) {
        for candidate in ["Connecting", "Connected", "Reconnecting", "Degraded", "Offline"] {
            self.node_state
                .with_label_values(&[node, candidate])
                .set(i64::from(candidate == state));
        }
    }

    /// Count one received control-channel frame.
    pub fn inc_frame(&self, node: &str, kind: &str) {
        self.frames_received.with_label_values(&[node, kind]).inc();
    }

    /// Raise a queue's high-water mark if `depth` exceeds it.
    pub fn observe_queue_depth(&self, queue: &str, depth: usize) {
        let gauge = self.queue_high_water.with_label_values(&[queue]);
        if depth as i64 > gauge.get() {
            gauge.set(depth as i64);
        }
    }

    /// Track the subscriber count.
    pub fn set_subscribers(&self, count: usize) {
        self.fanout_subscribers.set(count as i64);
    }

    /// Count messages dropped on slow-consumer queues.
    pub fn inc_fanout_dropped(&self, count: u64) {
        self.fanout_dropped.inc_by(count);
    }

    /// Track active alarm counts by severity.
    pub fn set_alarms_active(&self, severity: &str, count: usize) {
        self.alarms_active
            .with_label_values(&[severity])
            .set(count as i64);
    }

    /// Count an SBO session reaching a terminal state.
    pub fn inc_sbo(&self, outcome: &str) {
        self.sbo_sessions.with_label_values(&[outcome]).inc();
    }

    /// Count rows written to the historian.
    pub fn inc_historian_rows(&self, count: u64) {
        self.historian_rows.inc_by(count);
    }

    /// Track the spillover depth.
    pub fn set_historian_spill_depth(&self, depth: usize) {
        self.historian_spill_depth.set(depth as i64);
    }

    /// Count rows dropped from the spillover buffer.
    pub fn inc_historian_rows_lost(&self, count: u64) {
        self.historian_rows_lost.inc_by(count);
    }
}

pub use prometheus;

//! ---
//! scada_section: "05-master-runtime"
//! scada_subsection: "module"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "SCADA master: registry, aggregation, alarms, control, security, surfaces."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use scada_common::config::MasterConfig;
use scada_historian::{spawn_writer, HistorianHandle, HistorianSink, WriterConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::aggregator::Aggregator;
use crate::alarms::AlarmEngine;
use crate::audit::AuditLog;
use crate::auth::AuthService;
use crate::bus::{FanoutBus, WsMessage};
use crate::http::{spawn_http, HttpServerHandle, HttpState};
use crate::ingest::Ingest;
use crate::link::LinkManager;
use crate::registry::NodeRegistry;
use crate::sbo::SboCoordinator;
use crate::security::SecurityEngine;
use crate::store::TelemetryStore;
use crate::supervisor::{spawn_supervisors, SupervisorDeps};
use crate::ws::{spawn_ws, WsServerHandle, WsState};

/// Grace given to the historian flush and to background tasks on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Builder for a complete master instance.
pub struct MasterRuntime {
    config: MasterConfig,
    sink: Arc<dyn HistorianSink>,
    metrics: Option<scada_metrics::MasterMetrics>,
    ephemeral_ports: bool,
}

impl MasterRuntime {
    /// Create a runtime over the given historian sink.
    pub fn new(config: MasterConfig, sink: Arc<dyn HistorianSink>) -> Self {
        Self {
            config,
            sink,
            metrics: None,
            ephemeral_ports: false,
        }
    }

    /// Attach Prometheus metric families.
    pub fn with_metrics(mut self, metrics: scada_metrics::MasterMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Bind the external surfaces on loopback with kernel-assigned ports.
    /// Test mode.
    pub fn ephemeral(mut self) -> Self {
        self.ephemeral_ports = true;
        self
    }

    fn listen_addr(&self, configured: SocketAddr) -> SocketAddr {
        if self.ephemeral_ports {
            "127.0.0.1:0".parse().expect("valid loopback address")
        } else {
            configured
        }
    }

    /// Start every component in dependency order and open the external
    /// surfaces last.
    pub async fn spawn(self) -> Result<MasterHandle> {
        let config = Arc::new(self.config.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Plumbing first: bus and historian writer are leaves everything
        // else publishes into.
        let bus = Arc::new(FanoutBus::new(
            config.subscriber_queue,
            self.metrics.clone(),
        ));
        let historian = Arc::new(spawn_writer(self.sink.clone(), WriterConfig::default()));

        // Auth and audit before anything that needs gating.
        let auth = Arc::new(AuthService::with_default_users(
            &config.jwt_secret,
            config.token_lifetime,
        ));
        let audit = Arc::new(AuditLog::new(historian.clone()));

        // Stores and engines.
        let registry = Arc::new(NodeRegistry::new(&config.nodes));
        let store = Arc::new(TelemetryStore::new(config.ring_capacity));
        let alarms = Arc::new(AlarmEngine::new(
            bus.clone(),
            historian.clone(),
            self.metrics.clone(),
        ));
        let links = Arc::new(LinkManager::new());
        let security = Arc::new(SecurityEngine::new(
            config
                .effective_allow_list()
                .into_iter()
                .map(|entry| (entry.client_ip, entry.protocol)),
            bus.clone(),
            historian.clone(),
            links.clone(),
        ));

        // Node supervisors.
        let ingest = Arc::new(Ingest::new(
            registry.clone(),
            store.clone(),
            alarms.clone(),
            security.clone(),
            bus.clone(),
            historian.clone(),
            self.metrics.clone(),
        ));
        let supervisor_deps = SupervisorDeps {
            registry: registry.clone(),
            links: links.clone(),
            ingest,
            bus: bus.clone(),
            metrics: self.metrics.clone(),
            config: config.supervision.clone(),
        };
        tasks.extend(spawn_supervisors(
            &config.nodes,
            supervisor_deps,
            shutdown_rx.clone(),
        ));

        // Control coordinator and its sweeper.
        let sbo = Arc::new(SboCoordinator::new(
            registry.clone(),
            links.clone(),
            alarms.clone(),
            audit.clone(),
            config.control.clone(),
            self.metrics.clone(),
        ));
        tasks.push(tokio::spawn(sbo.clone().run_sweeper(shutdown_rx.clone())));

        // Aggregator.
        let aggregator = Arc::new(Aggregator::new(
            registry.clone(),
            store.clone(),
            alarms.clone(),
            bus.clone(),
            historian.clone(),
        ));
        tasks.push(tokio::spawn(
            aggregator
                .clone()
                .run(config.aggregator_interval, shutdown_rx.clone()),
        ));

        // Bus heartbeat.
        {
            let bus = bus.clone();
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(5));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            bus.publish(WsMessage::Heartbeat { timestamp: Utc::now() });
                        }
                    }
                }
            }));
        }

        // Historian stats bridge into the metric families.
        if let Some(metrics) = self.metrics.clone() {
            let stats = historian.stats();
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(5));
                let mut last_written = 0u64;
                let mut last_lost = 0u64;
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            let written = stats.written();
                            let lost = stats.lost();
                            metrics.inc_historian_rows(written.saturating_sub(last_written));
                            metrics.inc_historian_rows_lost(lost.saturating_sub(last_lost));
                            metrics.set_historian_spill_depth(stats.spill_depth() as usize);
                            last_written = written;
                            last_lost = lost;
                        }
                    }
                }
            }));
        }

        // External surfaces last.
        let http_state = Arc::new(HttpState {
            registry: registry.clone(),
            store: store.clone(),
            alarms: alarms.clone(),
            sbo: sbo.clone(),
            security: security.clone(),
            auth: auth.clone(),
            audit: audit.clone(),
            aggregator: aggregator.clone(),
            links: links.clone(),
        });
        let http = spawn_http(self.listen_addr(config.http_listen), http_state).await?;

        let ws_state = Arc::new(WsState {
            auth: auth.clone(),
            bus: bus.clone(),
            registry: registry.clone(),
            store: store.clone(),
            alarms: alarms.clone(),
            security: security.clone(),
            aggregator: aggregator.clone(),
        });
        let ws = spawn_ws(self.listen_addr(config.ws_listen), ws_state).await?;

        info!(
            http = %http.local_addr(),
            ws = %ws.local_addr(),
            nodes = config.nodes.len(),
            "scada master running"
        );

        Ok(MasterHandle {
            registry,
            store,
            alarms,
            sbo,
            security,
            auth,
            audit,
            aggregator,
            links,
            bus,
            historian: Some(historian),
            http: Some(http),
            ws: Some(ws),
            shutdown: shutdown_tx,
            tasks,
        })
    }
}

/// Handle to a running master. Component handles are exposed for the daemon's
/// diagnostics and for integration tests.
pub struct MasterHandle {
    /// Node registry.
    pub registry: Arc<NodeRegistry>,
    /// Telemetry store.
    pub store: Arc<TelemetryStore>,
    /// Alarm engine.
    pub alarms: Arc<AlarmEngine>,
    /// Control coordinator.
    pub sbo: Arc<SboCoordinator>,
    /// Security engine.
    pub security: Arc<SecurityEngine>,
    /// Auth service.
    pub auth: Arc<AuthService>,
    /// Audit log.
    pub audit: Arc<AuditLog>,
    /// Aggregator.
    pub aggregator: Arc<Aggregator>,
    /// Link manager.
    pub links: Arc<LinkManager>,
    /// Fan-out bus.
    pub bus: Arc<FanoutBus>,
    historian: Option<Arc<HistorianHandle>>,
    http: Option<HttpServerHandle>,
    ws: Option<WsServerHandle>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MasterHandle {
    /// Bound HTTP address.
    pub fn http_addr(&self) -> SocketAddr {
        self.http.as_ref().expect("http running").local_addr()
    }

    /// Bound WebSocket address.
    pub fn ws_addr(&self) -> SocketAddr {
        self.ws.as_ref().expect("ws running").local_addr()
    }

    /// Orderly shutdown: close the external surfaces first, drain the bus,
    /// flush the historian within the grace window, then stop supervisors.
    pub async fn shutdown(mut self) {
        info!("scada master shutting down");
        if let Some(http) = self.http.take() {
            if let Err(err) = http.shutdown().await {
                warn!(error = %err, "http shutdown error");
            }
        }
        if let Some(ws) = self.ws.take() {
            if let Err(err) = ws.shutdown().await {
                warn!(error = %err, "ws shutdown error");
            }
        }
        self.bus.close_all();

        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("master task did not stop within grace period; abandoning");
            }
        }

        if let Some(historian) = self.historian.take() {
            historian.shutdown(SHUTDOWN_GRACE).await;
        }
        info!("scada master stopped");
    }
}

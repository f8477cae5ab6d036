//! ---
//! xbar_section: "04-configuration-orchestration"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "Node startup state machine."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use xbar_common::NodeConfig;
use xbar_metrics::NodeMetrics;

use crate::bootstrap::ManagementPlane;
use crate::controller::WorkerLauncher;
use crate::error::{NodeError, Result};
use crate::identity::NodeIdentity;
use crate::managed::{run_managed, TcpUplinkConnector, UplinkConnector, DEFAULT_MANAGED_SETTLE};
use crate::sequencer::{StandaloneSequencer, StartupReport};
use crate::shutdown::ShutdownSignal;
use crate::watchdog::DEFAULT_COMPONENT_GRACE;
use crate::worker::EmbeddedWorkerLauncher;

/// Startup states. `Failed` is terminal and reachable from every other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Init,
    ConfigLoaded,
    MgmtReady,
    ManagedConnecting,
    Managed,
    StandaloneStarting,
    Running,
    Failed,
}

impl NodeState {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeState::Init => "init",
            NodeState::ConfigLoaded => "config_loaded",
            NodeState::MgmtReady => "mgmt_ready",
            NodeState::ManagedConnecting => "managed_connecting",
            NodeState::Managed => "managed",
            NodeState::StandaloneStarting => "standalone_starting",
            NodeState::Running => "running",
            NodeState::Failed => "failed",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime knobs that are not part of the configuration file.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Node directory; config and schema paths are relative to it.
    pub cbdir: PathBuf,
    pub config: PathBuf,
    pub component_grace: Duration,
    pub managed_settle: Duration,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            cbdir: PathBuf::from(".crossbar"),
            config: PathBuf::from("config.json"),
            component_grace: DEFAULT_COMPONENT_GRACE,
            managed_settle: DEFAULT_MANAGED_SETTLE,
        }
    }
}

/// One node orchestrator: owns the shutdown signal, the management plane and startup.
pub struct Node {
    options: NodeOptions,
    launcher: Arc<dyn WorkerLauncher>,
    connector: Arc<dyn UplinkConnector>,
    shutdown: ShutdownSignal,
    metrics: NodeMetrics,
    state: Mutex<NodeState>,
    identity: OnceCell<NodeIdentity>,
    plane: OnceCell<ManagementPlane>,
    watchdogs: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("options", &self.options)
            .field("state", &self.state())
            .field("identity", &self.identity.get())
            .finish()
    }
}

impl Node {
    pub fn new(options: NodeOptions, metrics: NodeMetrics) -> Self {
        metrics.set_state(None, NodeState::Init.as_str());
        Self {
            options,
            launcher: Arc::new(EmbeddedWorkerLauncher::new()),
            connector: Arc::new(TcpUplinkConnector),
            shutdown: ShutdownSignal::new(),
            metrics,
            state: Mutex::new(NodeState::Init),
            identity: OnceCell::new(),
            plane: OnceCell::new(),
            watchdogs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn UplinkConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn identity(&self) -> Option<&NodeIdentity> {
        self.identity.get()
    }

    pub fn management_plane(&self) -> Option<&ManagementPlane> {
        self.plane.get()
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    fn transition(&self, next: NodeState) {
        let mut state = self.state.lock();
        if *state == NodeState::Failed || *state == next {
            return;
        }
        let previous = *state;
        *state = next;
        self.metrics.set_state(Some(previous.as_str()), next.as_str());
        info!(from = %previous, to = %next, "node state changed");
    }

    /// Load the configuration from disk and start the node.
    pub async fn start(&self) -> NodeState {
        let loaded = NodeConfig::load(&self.options.cbdir, &self.options.config);
        match loaded {
            Ok(loaded) => {
                info!(config = %loaded.source.display(), "node configuration loaded");
                self.start_with_config(loaded.config).await
            }
            Err(err) => self.abort(err.into()),
        }
    }

    /// Start the node from an already loaded configuration.
    pub async fn start_with_config(&self, config: NodeConfig) -> NodeState {
        match self.run(config).await {
            Ok(state) => state,
            Err(err) => self.abort(err),
        }
    }

    /// Every fatal error ends here: mark failed, log once, stop. Nothing is rolled back.
    fn abort(&self, err: NodeError) -> NodeState {
        error!(error = %err, state = %self.state(), "node startup failed");
        self.transition(NodeState::Failed);
        if self.shutdown.failure().is_none() {
            self.shutdown.fail(err.to_string());
        }
        NodeState::Failed
    }

    async fn run(&self, config: NodeConfig) -> Result<NodeState> {
        self.transition(NodeState::ConfigLoaded);
        match config.digest() {
            Ok(hash) => info!(config_hash = %hash, title = %config.controller.title(), "node configuration accepted"),
            Err(err) => warn!(error = %err, "unable to compute configuration hash"),
        }

        let identity = NodeIdentity::resolve(&config)?;
        info!(node = %identity.node_id, realm = %identity.realm_name, source = ?identity.source, "node identity resolved");
        let identity = self.identity.get_or_init(|| identity);

        let plane = ManagementPlane::bootstrap(
            identity,
            config.controller.title(),
            config.is_managed(),
            Arc::clone(&self.launcher),
            self.shutdown.clone(),
        )
        .await?;
        let plane = self.plane.get_or_init(|| plane);
        self.transition(NodeState::MgmtReady);

        match (&config.manager, plane.bridge()) {
            (Some(manager), Some(bridge)) => {
                self.transition(NodeState::ManagedConnecting);
                run_managed(
                    identity,
                    manager,
                    &config,
                    bridge,
                    self.connector.as_ref(),
                    self.options.managed_settle,
                )
                .await?;
                self.transition(NodeState::Managed);
                Ok(NodeState::Managed)
            }
            (Some(_), None) => Err(NodeError::Configuration(
                "managed node has no management bridge".to_owned(),
            )),
            (None, _) => {
                self.transition(NodeState::StandaloneStarting);
                let sequencer = StandaloneSequencer::new(
                    &identity.node_id,
                    &self.options.cbdir,
                    plane.node_controller(),
                    self.shutdown.clone(),
                    self.metrics.clone(),
                    self.options.component_grace,
                );
                let mut report = StartupReport::default();
                let outcome = sequencer.run_into(&config, &mut report).await;
                self.watchdogs.lock().extend(report.watchdogs);
                outcome?;
                // The last call may have succeeded after a component already exited.
                if let Some(reason) = self.shutdown.failure() {
                    return Err(NodeError::Aborted(reason));
                }
                info!(node = %identity.node_id, workers = report.workers.len(), "standalone startup complete");
                self.transition(NodeState::Running);
                Ok(NodeState::Running)
            }
        }
    }

    /// Wait for the stop signal and return the final state.
    ///
    /// A failure recorded after startup (an early component exit) turns the node `Failed`.
    pub async fn wait(&self) -> NodeState {
        self.shutdown.wait().await;
        if let Some(reason) = self.shutdown.failure() {
            if self.state() != NodeState::Failed {
                error!(%reason, "node failed after startup");
                self.transition(NodeState::Failed);
            }
        }
        for handle in self.watchdogs.lock().drain(..) {
            handle.abort();
        }
        self.state()
    }
}

//! ---
//! xbar_section: "04-configuration-orchestration"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "Standalone startup sequencer."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
//! Standalone startup walks the configuration in declaration order and issues
//! one control call at a time, waiting for each result before the next. Any
//! failed call, unknown worker type or missing required field ends the walk;
//! nothing already started is rolled back.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use xbar_common::{
    ControllerSection, NodeConfig, WorkerEndpoint, WorkerKind, WorkerProcedure, WorkerSpec,
};
use xbar_metrics::NodeMetrics;
use xbar_router::RouterError;

use crate::controller::NodeController;
use crate::error::{NodeError, Result};
use crate::ids::{resolve_ids, IdKind};
use crate::shutdown::ShutdownSignal;
use crate::watchdog::ComponentWatchdog;

/// What a completed standalone startup leaves behind.
#[derive(Debug, Default)]
pub struct StartupReport {
    /// Resolved ids of the started workers, in start order.
    pub workers: Vec<String>,
    /// Pending watchdog releases, one per container worker.
    pub watchdogs: Vec<JoinHandle<()>>,
}

pub struct StandaloneSequencer<'a> {
    node_id: &'a str,
    cbdir: &'a Path,
    controller: Arc<dyn NodeController>,
    shutdown: ShutdownSignal,
    metrics: NodeMetrics,
    component_grace: Duration,
}

impl<'a> StandaloneSequencer<'a> {
    pub fn new(
        node_id: &'a str,
        cbdir: &'a Path,
        controller: Arc<dyn NodeController>,
        shutdown: ShutdownSignal,
        metrics: NodeMetrics,
        component_grace: Duration,
    ) -> Self {
        Self {
            node_id,
            cbdir,
            controller,
            shutdown,
            metrics,
            component_grace,
        }
    }

    pub async fn run(&self, config: &NodeConfig) -> Result<StartupReport> {
        let mut report = StartupReport::default();
        self.run_into(config, &mut report).await?;
        Ok(report)
    }

    /// Like [`run`](Self::run), but `report` keeps the workers and watchdog
    /// releases created before a failure.
    pub async fn run_into(&self, config: &NodeConfig, report: &mut StartupReport) -> Result<()> {
        self.start_controller_services(&config.controller).await?;

        for worker in resolve_ids(IdKind::Worker, &config.workers) {
            self.ensure_running()?;
            let spec = worker.spec;
            let label = format!("{} '{}'", spec.kind.label(), worker.id);
            let endpoint = WorkerEndpoint::new(self.node_id, &worker.id, spec.kind.clone());
            match &spec.kind {
                WorkerKind::Router => {
                    self.control(
                        "start_router",
                        None,
                        self.controller.start_router(&worker.id, spec.options()),
                    )
                    .await?;
                    info!(node = %self.node_id, worker = %worker.id, %label, "router worker started");
                    self.native_setup(&endpoint, spec, &label).await?;
                    self.start_router_resources(&endpoint, spec, &label).await?;
                }
                WorkerKind::Container => {
                    self.control(
                        "start_container",
                        None,
                        self.controller.start_container(&worker.id, spec.options()),
                    )
                    .await?;
                    info!(node = %self.node_id, worker = %worker.id, %label, "container worker started");
                    self.native_setup(&endpoint, spec, &label).await?;
                    let release = self.start_container_components(&endpoint, spec, &label).await?;
                    report.watchdogs.push(release);
                }
                WorkerKind::Guest => {
                    self.control(
                        "start_guest",
                        None,
                        self.controller.start_guest(&worker.id, worker.payload()?),
                    )
                    .await?;
                    info!(node = %self.node_id, worker = %worker.id, %label, "guest worker started");
                }
                WorkerKind::Unknown(other) => {
                    return Err(NodeError::Configuration(format!(
                        "invalid worker type '{other}' for worker '{}'",
                        worker.id
                    )));
                }
            }
            self.metrics.record_worker_started(spec.kind.as_str());
            report.workers.push(worker.id);
        }
        Ok(())
    }

    /// A stop or failure recorded mid-startup ends the walk before the next call.
    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_running() {
            Ok(())
        } else {
            Err(NodeError::from_shutdown(self.shutdown.failure()))
        }
    }

    async fn start_controller_services(&self, controller: &ControllerSection) -> Result<()> {
        if let Some(manhole) = controller.manhole() {
            self.control(
                "start_manhole",
                None,
                self.controller.start_manhole(manhole),
            )
            .await?;
            info!(node = %self.node_id, "controller manhole started");
        }
        if let Some(transport) = controller.transport() {
            self.control(
                "start_management_transport",
                None,
                self.controller.start_management_transport(transport),
            )
            .await?;
            info!(node = %self.node_id, "management transport started");
        }
        Ok(())
    }

    /// Setup shared by router and container workers.
    async fn native_setup(
        &self,
        endpoint: &WorkerEndpoint,
        spec: &WorkerSpec,
        label: &str,
    ) -> Result<()> {
        if let Some(paths) = &spec.options().pythonpath {
            let added = self
                .call(endpoint, WorkerProcedure::AddPythonpath, vec![json!(paths)])
                .await?;
            info!(worker = %endpoint.worker_id(), %label, paths = %added, "search paths added");
        }
        if let Some(cpus) = &spec.options().cpu_affinity {
            let set = self
                .call(endpoint, WorkerProcedure::SetCpuAffinity, vec![json!(cpus)])
                .await?;
            info!(worker = %endpoint.worker_id(), %label, cpus = %set, "CPU affinity set");
        }
        if let Some(manhole) = spec.manhole() {
            self.call(endpoint, WorkerProcedure::StartManhole, vec![manhole.clone()])
                .await?;
            info!(worker = %endpoint.worker_id(), %label, "worker manhole started");
        }
        Ok(())
    }

    /// Realms, then roles, then components, then transports; each phase completes before the next.
    async fn start_router_resources(
        &self,
        endpoint: &WorkerEndpoint,
        spec: &WorkerSpec,
        label: &str,
    ) -> Result<()> {
        let worker_id = endpoint.worker_id();
        let realms = resolve_ids(IdKind::Realm, spec.realms());

        for realm in &realms {
            let schemas = match &realm.spec.schemas {
                Some(files) => {
                    let extraction = xbar_schema::extract(self.cbdir, files)?;
                    info!(
                        worker = %worker_id,
                        realm = %realm.id,
                        files = extraction.files,
                        declarations = extraction.declarations,
                        uris = extraction.uris(),
                        skipped = extraction.skipped,
                        "schema declarations extracted"
                    );
                    self.metrics
                        .record_schema_declarations(extraction.declarations);
                    extraction.to_value()
                }
                None => Value::Null,
            };
            self.call(
                endpoint,
                WorkerProcedure::StartRouterRealm,
                vec![json!(realm.id), realm.payload()?, schemas],
            )
            .await?;
            info!(worker = %worker_id, %label, realm = %realm.id, name = %realm.spec.name, "realm started");
        }

        for realm in &realms {
            for role in resolve_ids(IdKind::Role, &realm.spec.roles) {
                self.call(
                    endpoint,
                    WorkerProcedure::StartRouterRealmRole,
                    vec![json!(realm.id), json!(role.id), role.payload()?],
                )
                .await?;
                info!(worker = %worker_id, %label, realm = %realm.id, role = %role.id, name = %role.spec.name, "role started");
            }
        }

        for component in resolve_ids(IdKind::Component, spec.components()) {
            self.call(
                endpoint,
                WorkerProcedure::StartRouterComponent,
                vec![json!(component.id), component.payload()?],
            )
            .await?;
            info!(worker = %worker_id, %label, component = %component.id, "router component started");
        }

        let transports = spec.transports.as_deref().ok_or_else(|| {
            NodeError::Configuration(format!(
                "missing transports in router worker '{worker_id}'"
            ))
        })?;
        for transport in resolve_ids(IdKind::Transport, transports) {
            self.call(
                endpoint,
                WorkerProcedure::StartRouterTransport,
                vec![json!(transport.id), transport.payload()?],
            )
            .await?;
            info!(worker = %worker_id, %label, transport = %transport.id, "transport started");
        }
        Ok(())
    }

    /// Arm the watchdog, start every component, then schedule the watchdog release.
    async fn start_container_components(
        &self,
        endpoint: &WorkerEndpoint,
        spec: &WorkerSpec,
        label: &str,
    ) -> Result<JoinHandle<()>> {
        let watchdog = ComponentWatchdog::arm(
            Arc::clone(&self.controller),
            endpoint,
            self.shutdown.clone(),
            self.metrics.clone(),
        )
        .await?;

        match self.start_container_component_list(endpoint, spec, label).await {
            Ok(()) => Ok(watchdog.release_after(self.component_grace)),
            Err(err) => {
                watchdog.disarm().await;
                Err(err)
            }
        }
    }

    async fn start_container_component_list(
        &self,
        endpoint: &WorkerEndpoint,
        spec: &WorkerSpec,
        label: &str,
    ) -> Result<()> {
        for component in resolve_ids(IdKind::Component, spec.components()) {
            self.call(
                endpoint,
                WorkerProcedure::StartContainerComponent,
                vec![json!(component.id), component.payload()?],
            )
            .await?;
            info!(worker = %endpoint.worker_id(), %label, component = %component.id, "container component started");
        }
        Ok(())
    }

    async fn call(
        &self,
        endpoint: &WorkerEndpoint,
        procedure: WorkerProcedure,
        args: Vec<Value>,
    ) -> Result<Value> {
        let uri = endpoint.procedure(procedure)?;
        self.control(
            procedure.name(),
            Some(uri.as_str()),
            self.controller.call(&uri, args),
        )
        .await
    }

    /// Await one control call, record its outcome and map failures to [`NodeError::Rpc`].
    async fn control<F>(&self, name: &str, uri: Option<&str>, call: F) -> Result<Value>
    where
        F: Future<Output = std::result::Result<Value, RouterError>>,
    {
        self.ensure_running()?;
        match call.await {
            Ok(value) => {
                self.metrics.record_call(name, true);
                Ok(value)
            }
            Err(source) => {
                self.metrics.record_call(name, false);
                let procedure = uri.unwrap_or(name).to_owned();
                warn!(node = %self.node_id, %procedure, error = %source, "control call failed");
                Err(NodeError::Rpc { procedure, source })
            }
        }
    }
}

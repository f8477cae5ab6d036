//! ---
//! xbar_section: "04-configuration-orchestration"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "In-process worker host backing the worker launcher seam."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
//! Workers hosted inside the node process.
//!
//! Each router or container worker gets a trusted session on the management
//! realm that registers exactly the procedures its kind exposes. Started
//! sub-resources are kept in a [`WorkerInventory`]; a second resource with an
//! id already used in the same scope is rejected the way a worker process
//! would reject it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use xbar_common::{ProcedureUri, WorkerEndpoint, WorkerKind, WorkerProcedure, WorkerTopic};
use xbar_router::{
    RouterError, RouterSession, RouterSessionFactory, SessionHandle, TRUSTED_AUTHROLE,
};

use crate::controller::{WorkerLaunch, WorkerLauncher};

type CallResult<T> = std::result::Result<T, RouterError>;

const ALREADY_RUNNING: &str = "crossbar.error.already_running";
const NO_SUCH_OBJECT: &str = "crossbar.error.no_such_object";
const INVALID_ARGUMENT: &str = "wamp.error.invalid_argument";

#[derive(Debug, Clone, Default, Serialize)]
pub struct HostedRealm {
    pub config: Value,
    pub schemas: Value,
    pub roles: IndexMap<String, Value>,
}

/// Runtime state of one hosted worker.
#[derive(Debug, Clone, Serialize)]
pub struct HostedWorker {
    #[serde(rename = "type")]
    pub kind: WorkerKind,
    pub config: Value,
    pub pythonpath: Vec<String>,
    pub cpu_affinity: Option<Vec<u32>>,
    pub manhole: Option<Value>,
    pub realms: IndexMap<String, HostedRealm>,
    pub components: IndexMap<String, Value>,
    pub transports: IndexMap<String, Value>,
}

impl HostedWorker {
    fn new(kind: WorkerKind, config: Value) -> Self {
        Self {
            kind,
            config,
            pythonpath: Vec::new(),
            cpu_affinity: None,
            manhole: None,
            realms: IndexMap::new(),
            components: IndexMap::new(),
            transports: IndexMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct InventoryInner {
    workers: IndexMap<String, HostedWorker>,
    calls: Vec<ProcedureUri>,
}

/// Shared record of everything the embedded host has started.
#[derive(Debug, Clone, Default)]
pub struct WorkerInventory {
    inner: Arc<Mutex<InventoryInner>>,
}

fn arg<T: DeserializeOwned>(args: &[Value], index: usize, name: &str) -> CallResult<T> {
    let value = args.get(index).cloned().ok_or_else(|| {
        RouterError::application(INVALID_ARGUMENT, format!("missing argument `{name}`"))
    })?;
    serde_json::from_value(value).map_err(|err| {
        RouterError::application(INVALID_ARGUMENT, format!("argument `{name}`: {err}"))
    })
}

fn insert_unique(
    scope: &mut IndexMap<String, Value>,
    what: &str,
    id: String,
    config: Value,
) -> CallResult<()> {
    if scope.contains_key(&id) {
        return Err(RouterError::application(
            ALREADY_RUNNING,
            format!("a {what} with id '{id}' is already running"),
        ));
    }
    scope.insert(id, config);
    Ok(())
}

impl WorkerInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn worker(&self, id: &str) -> Option<HostedWorker> {
        self.inner.lock().workers.get(id).cloned()
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.inner.lock().workers.keys().cloned().collect()
    }

    /// Every worker procedure served so far, in arrival order.
    pub fn calls(&self) -> Vec<ProcedureUri> {
        self.inner.lock().calls.clone()
    }

    fn add_worker(&self, id: &str, kind: WorkerKind, config: Value) -> CallResult<()> {
        let mut inner = self.inner.lock();
        if inner.workers.contains_key(id) {
            return Err(RouterError::application(
                ALREADY_RUNNING,
                format!("a worker with id '{id}' is already running"),
            ));
        }
        inner
            .workers
            .insert(id.to_owned(), HostedWorker::new(kind, config));
        Ok(())
    }

    fn remove_component(&self, worker: &str, component: &str) -> bool {
        self.inner
            .lock()
            .workers
            .get_mut(worker)
            .map(|hosted| hosted.components.shift_remove(component).is_some())
            .unwrap_or(false)
    }

    /// Serve one worker procedure against the worker's state.
    fn apply(
        &self,
        uri: &ProcedureUri,
        worker_id: &str,
        procedure: WorkerProcedure,
        args: &[Value],
    ) -> CallResult<Value> {
        let mut inner = self.inner.lock();
        inner.calls.push(uri.clone());
        let worker = inner.workers.get_mut(worker_id).ok_or_else(|| {
            RouterError::application(NO_SUCH_OBJECT, format!("no worker with id '{worker_id}'"))
        })?;
        let started = json!({"started": Utc::now()});
        match procedure {
            WorkerProcedure::AddPythonpath => {
                let paths: Vec<String> = arg(args, 0, "paths")?;
                worker.pythonpath.extend(paths);
                Ok(json!(worker.pythonpath))
            }
            WorkerProcedure::SetCpuAffinity => {
                let cpus: Vec<u32> = arg(args, 0, "cpus")?;
                worker.cpu_affinity = Some(cpus.clone());
                Ok(json!(cpus))
            }
            WorkerProcedure::StartManhole => {
                if worker.manhole.is_some() {
                    return Err(RouterError::application(
                        ALREADY_RUNNING,
                        "worker manhole already started",
                    ));
                }
                worker.manhole = Some(arg(args, 0, "config")?);
                Ok(started)
            }
            WorkerProcedure::StartRouterRealm => {
                let id: String = arg(args, 0, "realm_id")?;
                let config: Value = arg(args, 1, "config")?;
                let schemas = args.get(2).cloned().unwrap_or(Value::Null);
                if worker.realms.contains_key(&id) {
                    return Err(RouterError::application(
                        ALREADY_RUNNING,
                        format!("a realm with id '{id}' is already running"),
                    ));
                }
                worker.realms.insert(
                    id,
                    HostedRealm {
                        config,
                        schemas,
                        roles: IndexMap::new(),
                    },
                );
                Ok(started)
            }
            WorkerProcedure::StartRouterRealmRole => {
                let realm_id: String = arg(args, 0, "realm_id")?;
                let role_id: String = arg(args, 1, "role_id")?;
                let config: Value = arg(args, 2, "config")?;
                let realm = worker.realms.get_mut(&realm_id).ok_or_else(|| {
                    RouterError::application(
                        NO_SUCH_OBJECT,
                        format!("no realm with id '{realm_id}'"),
                    )
                })?;
                insert_unique(&mut realm.roles, "role", role_id, config)?;
                Ok(started)
            }
            WorkerProcedure::StartRouterComponent | WorkerProcedure::StartContainerComponent => {
                let id: String = arg(args, 0, "component_id")?;
                let config: Value = arg(args, 1, "config")?;
                insert_unique(&mut worker.components, "component", id, config)?;
                Ok(started)
            }
            WorkerProcedure::StartRouterTransport => {
                let id: String = arg(args, 0, "transport_id")?;
                let config: Value = arg(args, 1, "config")?;
                insert_unique(&mut worker.transports, "transport", id, config)?;
                Ok(started)
            }
        }
    }
}

/// Session representing a hosted worker on the management realm.
struct EmbeddedWorkerSession {
    name: String,
    realm: String,
    endpoint: WorkerEndpoint,
    inventory: WorkerInventory,
}

#[async_trait]
impl RouterSession for EmbeddedWorkerSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn realm(&self) -> &str {
        &self.realm
    }

    async fn on_join(&self, handle: SessionHandle) -> CallResult<()> {
        for procedure in WorkerProcedure::for_kind(self.endpoint.kind()) {
            let uri = self
                .endpoint
                .procedure(procedure)
                .map_err(|err| RouterError::application(NO_SUCH_OBJECT, err.to_string()))?;
            let inventory = self.inventory.clone();
            let worker_id = self.endpoint.worker_id().to_owned();
            let served = uri.clone();
            handle.router().register_fn(
                uri.as_str(),
                Some(handle.id()),
                move |args, _details| {
                    let result = inventory.apply(&served, &worker_id, procedure, &args);
                    async move { result }
                },
            )?;
        }
        debug!(worker = %self.endpoint.worker_id(), kind = %self.endpoint.kind(), "worker session joined");
        Ok(())
    }
}

/// Hosts workers in-process instead of spawning OS processes.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedWorkerLauncher {
    inventory: WorkerInventory,
    sessions: Arc<Mutex<HashMap<String, (WorkerEndpoint, SessionHandle)>>>,
}

impl EmbeddedWorkerLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inventory(&self) -> &WorkerInventory {
        &self.inventory
    }

    /// Stop a container component and announce it on the container's stop topic.
    ///
    /// Returns the number of subscribers that received the event.
    pub fn stop_component(&self, worker_id: &str, component_id: &str) -> CallResult<usize> {
        let (endpoint, handle) = self
            .sessions
            .lock()
            .get(worker_id)
            .cloned()
            .ok_or_else(|| {
                RouterError::application(NO_SUCH_OBJECT, format!("no worker with id '{worker_id}'"))
            })?;
        let topic = endpoint
            .topic(WorkerTopic::ContainerComponentStop)
            .map_err(|err| RouterError::application(NO_SUCH_OBJECT, err.to_string()))?;
        if !self.inventory.remove_component(worker_id, component_id) {
            return Err(RouterError::application(
                NO_SUCH_OBJECT,
                format!("no component with id '{component_id}' on worker '{worker_id}'"),
            ));
        }
        info!(worker = %worker_id, component = %component_id, "component stopped");
        Ok(handle.publish(topic.as_str(), json!({"id": component_id})))
    }
}

#[async_trait]
impl WorkerLauncher for EmbeddedWorkerLauncher {
    async fn launch(
        &self,
        sessions: &Arc<RouterSessionFactory>,
        request: WorkerLaunch,
    ) -> CallResult<Value> {
        let WorkerLaunch {
            endpoint,
            realm,
            config,
        } = request;
        let worker_id = endpoint.worker_id().to_owned();
        let kind = endpoint.kind().clone();
        if let WorkerKind::Unknown(other) = &kind {
            return Err(RouterError::application(
                INVALID_ARGUMENT,
                format!("cannot host worker of type '{other}'"),
            ));
        }
        self.inventory.add_worker(&worker_id, kind.clone(), config)?;
        if kind.is_native() {
            let session = Arc::new(EmbeddedWorkerSession {
                name: format!("worker:{worker_id}"),
                realm,
                endpoint: endpoint.clone(),
                inventory: self.inventory.clone(),
            });
            let handle = sessions.add(session, TRUSTED_AUTHROLE).await?;
            self.sessions
                .lock()
                .insert(worker_id.clone(), (endpoint, handle));
        }
        info!(worker = %worker_id, kind = %kind, "embedded worker started");
        Ok(json!({"id": worker_id, "type": kind.as_str(), "started": Utc::now()}))
    }
}

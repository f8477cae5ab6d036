//! ---
//! xbar_section: "04-configuration-orchestration"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "Node controller session and the seams the sequencer drives."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use xbar_common::{NodeProcedure, ProcedureUri, WorkerEndpoint, WorkerKind, WorkerOptions};
use xbar_router::{
    EventHandler, MatchPolicy, RouterError, RouterSession, RouterSessionFactory, SessionHandle,
    SubscriptionId,
};

use crate::identity::NodeIdentity;
use crate::shutdown::ShutdownSignal;

type CallResult<T> = std::result::Result<T, RouterError>;

/// The control-plane operations the startup sequencer issues, in the order it issues them.
///
/// Every method is a suspension point; the sequencer awaits each before issuing the next.
#[async_trait]
pub trait NodeController: Send + Sync {
    async fn start_manhole(&self, config: &Value) -> CallResult<Value>;

    async fn start_management_transport(&self, config: &Value) -> CallResult<Value>;

    async fn start_router(&self, worker_id: &str, options: &WorkerOptions) -> CallResult<Value>;

    async fn start_container(&self, worker_id: &str, options: &WorkerOptions)
        -> CallResult<Value>;

    async fn start_guest(&self, worker_id: &str, config: Value) -> CallResult<Value>;

    /// Invoke a worker procedure.
    async fn call(&self, procedure: &ProcedureUri, args: Vec<Value>) -> CallResult<Value>;

    async fn subscribe(
        &self,
        topic: &ProcedureUri,
        handler: EventHandler,
    ) -> CallResult<SubscriptionId>;

    async fn unsubscribe(&self, subscription: SubscriptionId) -> CallResult<()>;
}

/// Request to bring up one worker.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub endpoint: WorkerEndpoint,
    /// Realm the worker session joins.
    pub realm: String,
    /// Worker options for native workers, the whole worker spec for guests.
    pub config: Value,
}

/// Boundary to worker process creation.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start the worker and return once it is reachable on the management realm.
    async fn launch(
        &self,
        sessions: &Arc<RouterSessionFactory>,
        request: WorkerLaunch,
    ) -> CallResult<Value>;
}

/// Controller-side bookkeeping for one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: &'static str,
    pub started: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Serialize)]
struct ManagementEndpoints {
    manhole: Option<Value>,
    transport: Option<Value>,
}

#[derive(Debug)]
struct ControllerState {
    identity: NodeIdentity,
    title: String,
    started: DateTime<Utc>,
    workers: Mutex<IndexMap<String, WorkerRecord>>,
    management: Mutex<ManagementEndpoints>,
    shutdown: ShutdownSignal,
}

impl ControllerState {
    fn info(&self) -> Value {
        json!({
            "node_id": self.identity.node_id,
            "realm": self.identity.realm_name,
            "title": self.title,
            "pid": std::process::id(),
            "started": self.started,
            "workers": self.workers.lock().len(),
        })
    }

    fn workers(&self) -> CallResult<Value> {
        let workers: Vec<WorkerRecord> = self.workers.lock().values().cloned().collect();
        serde_json::to_value(workers).map_err(payload_error)
    }
}

/// The node controller: a trusted session on the management realm.
pub struct ControllerSession {
    state: Arc<ControllerState>,
    sessions: Arc<RouterSessionFactory>,
    launcher: Arc<dyn WorkerLauncher>,
    handle: OnceCell<SessionHandle>,
}

impl std::fmt::Debug for ControllerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerSession")
            .field("node", &self.state.identity.node_id)
            .field("joined", &self.handle.get().map(SessionHandle::id))
            .finish()
    }
}

impl ControllerSession {
    pub fn new(
        identity: NodeIdentity,
        title: impl Into<String>,
        sessions: Arc<RouterSessionFactory>,
        launcher: Arc<dyn WorkerLauncher>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            state: Arc::new(ControllerState {
                identity,
                title: title.into(),
                started: Utc::now(),
                workers: Mutex::new(IndexMap::new()),
                management: Mutex::new(ManagementEndpoints::default()),
                shutdown,
            }),
            sessions,
            launcher,
            handle: OnceCell::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.state.identity.node_id
    }

    pub fn workers(&self) -> Vec<WorkerRecord> {
        self.state.workers.lock().values().cloned().collect()
    }

    fn handle(&self) -> CallResult<&SessionHandle> {
        self.handle.get().ok_or_else(|| {
            RouterError::application(
                "crossbar.error.not_joined",
                "node controller has not joined the management realm",
            )
        })
    }

    async fn start_worker(&self, worker_id: &str, kind: WorkerKind, config: Value) -> CallResult<Value> {
        if self.state.workers.lock().contains_key(worker_id) {
            return Err(RouterError::application(
                "crossbar.error.worker_already_running",
                format!("a worker with id '{worker_id}' is already running"),
            ));
        }
        let request = WorkerLaunch {
            endpoint: WorkerEndpoint::new(self.node_id(), worker_id, kind.clone()),
            realm: self.state.identity.realm_name.clone(),
            config,
        };
        let reply = self.launcher.launch(&self.sessions, request).await?;
        self.state.workers.lock().insert(
            worker_id.to_owned(),
            WorkerRecord {
                id: worker_id.to_owned(),
                kind: kind.to_string(),
                status: "running",
                started: Utc::now(),
            },
        );
        debug!(node = %self.node_id(), worker = %worker_id, kind = %kind, "worker registered with controller");
        Ok(reply)
    }
}

#[async_trait]
impl RouterSession for ControllerSession {
    fn name(&self) -> &str {
        "node-controller"
    }

    fn realm(&self) -> &str {
        &self.state.identity.realm_name
    }

    async fn on_join(&self, handle: SessionHandle) -> CallResult<()> {
        let node_id = self.node_id().to_owned();
        let router = handle.router();

        let state = Arc::clone(&self.state);
        router.register_fn(
            NodeProcedure::GetInfo.uri(&node_id).as_str(),
            Some(handle.id()),
            move |_args, _details| {
                let info = state.info();
                async move { Ok(info) }
            },
        )?;

        let state = Arc::clone(&self.state);
        router.register_fn(
            NodeProcedure::GetWorkers.uri(&node_id).as_str(),
            Some(handle.id()),
            move |_args, _details| {
                let workers = state.workers();
                async move { workers }
            },
        )?;

        let state = Arc::clone(&self.state);
        router.register_fn(
            NodeProcedure::Shutdown.uri(&node_id).as_str(),
            Some(handle.id()),
            move |_args, details| {
                info!(caller = ?details.caller, "shutdown requested over the management realm");
                let stopped = state.shutdown.request_stop();
                async move { Ok(json!(stopped)) }
            },
        )?;

        let _ = self.handle.set(handle);
        info!(node = %node_id, title = %self.state.title, "node controller joined management realm");
        Ok(())
    }
}

#[async_trait]
impl NodeController for ControllerSession {
    async fn start_manhole(&self, config: &Value) -> CallResult<Value> {
        let mut management = self.state.management.lock();
        if management.manhole.is_some() {
            return Err(RouterError::application(
                "crossbar.error.already_running",
                "controller manhole already started",
            ));
        }
        management.manhole = Some(config.clone());
        Ok(json!({"started": Utc::now()}))
    }

    async fn start_management_transport(&self, config: &Value) -> CallResult<Value> {
        let mut management = self.state.management.lock();
        if management.transport.is_some() {
            return Err(RouterError::application(
                "crossbar.error.already_running",
                "management transport already started",
            ));
        }
        management.transport = Some(config.clone());
        Ok(json!({"started": Utc::now()}))
    }

    async fn start_router(&self, worker_id: &str, options: &WorkerOptions) -> CallResult<Value> {
        let config = options.to_payload().map_err(payload_error)?;
        self.start_worker(worker_id, WorkerKind::Router, config).await
    }

    async fn start_container(
        &self,
        worker_id: &str,
        options: &WorkerOptions,
    ) -> CallResult<Value> {
        let config = options.to_payload().map_err(payload_error)?;
        self.start_worker(worker_id, WorkerKind::Container, config).await
    }

    async fn start_guest(&self, worker_id: &str, config: Value) -> CallResult<Value> {
        self.start_worker(worker_id, WorkerKind::Guest, config).await
    }

    async fn call(&self, procedure: &ProcedureUri, args: Vec<Value>) -> CallResult<Value> {
        self.handle()?.call(procedure.as_str(), args).await
    }

    async fn subscribe(
        &self,
        topic: &ProcedureUri,
        handler: EventHandler,
    ) -> CallResult<SubscriptionId> {
        Ok(self
            .handle()?
            .subscribe(topic.as_str(), MatchPolicy::Exact, handler))
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> CallResult<()> {
        self.handle()?.unsubscribe(subscription)
    }
}

fn payload_error(err: serde_json::Error) -> RouterError {
    RouterError::application("wamp.error.invalid_argument", err.to_string())
}

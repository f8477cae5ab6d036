//! ---
//! xbar_section: "02-messaging-ipc-data-model"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "Typed control-plane procedure and topic descriptors."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
//! Control-plane URIs are never assembled at call sites. A [`WorkerEndpoint`]
//! pairs a node, a worker and its kind; asking it for a [`WorkerProcedure`]
//! the kind does not expose fails instead of producing a dangling URI.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::WorkerKind;

/// Common prefix of every node management URI.
pub const NODE_URI_PREFIX: &str = "crossbar.node.";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("procedure `{procedure}` is not available on {kind} workers")]
    Unsupported {
        procedure: &'static str,
        kind: String,
    },
    #[error("topic `{topic}` is not published by {kind} workers")]
    NoSuchTopic { topic: &'static str, kind: String },
}

/// A fully qualified control-plane URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcedureUri(String);

impl ProcedureUri {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcedureUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ProcedureUri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Per-worker management procedures issued by the startup sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerProcedure {
    AddPythonpath,
    SetCpuAffinity,
    StartManhole,
    StartRouterRealm,
    StartRouterRealmRole,
    StartRouterComponent,
    StartRouterTransport,
    StartContainerComponent,
}

impl WorkerProcedure {
    pub const ALL: [WorkerProcedure; 8] = [
        WorkerProcedure::AddPythonpath,
        WorkerProcedure::SetCpuAffinity,
        WorkerProcedure::StartManhole,
        WorkerProcedure::StartRouterRealm,
        WorkerProcedure::StartRouterRealmRole,
        WorkerProcedure::StartRouterComponent,
        WorkerProcedure::StartRouterTransport,
        WorkerProcedure::StartContainerComponent,
    ];

    pub fn name(self) -> &'static str {
        match self {
            WorkerProcedure::AddPythonpath => "add_pythonpath",
            WorkerProcedure::SetCpuAffinity => "set_cpu_affinity",
            WorkerProcedure::StartManhole => "start_manhole",
            WorkerProcedure::StartRouterRealm => "start_router_realm",
            WorkerProcedure::StartRouterRealmRole => "start_router_realm_role",
            WorkerProcedure::StartRouterComponent => "start_router_component",
            WorkerProcedure::StartRouterTransport => "start_router_transport",
            WorkerProcedure::StartContainerComponent => "start_container_component",
        }
    }

    /// Whether a worker of `kind` exposes this procedure.
    pub fn supports(self, kind: &WorkerKind) -> bool {
        match self {
            WorkerProcedure::AddPythonpath
            | WorkerProcedure::SetCpuAffinity
            | WorkerProcedure::StartManhole => kind.is_native(),
            WorkerProcedure::StartRouterRealm
            | WorkerProcedure::StartRouterRealmRole
            | WorkerProcedure::StartRouterComponent
            | WorkerProcedure::StartRouterTransport => *kind == WorkerKind::Router,
            WorkerProcedure::StartContainerComponent => *kind == WorkerKind::Container,
        }
    }

    /// Procedures exposed by workers of `kind`, in table order.
    pub fn for_kind(kind: &WorkerKind) -> impl Iterator<Item = WorkerProcedure> + '_ {
        Self::ALL.into_iter().filter(move |proc| proc.supports(kind))
    }
}

impl fmt::Display for WorkerProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Events published by workers on the management realm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerTopic {
    ContainerComponentStop,
}

impl WorkerTopic {
    pub fn suffix(self) -> &'static str {
        match self {
            WorkerTopic::ContainerComponentStop => "container.on_component_stop",
        }
    }

    pub fn supports(self, kind: &WorkerKind) -> bool {
        match self {
            WorkerTopic::ContainerComponentStop => *kind == WorkerKind::Container,
        }
    }
}

/// Node-level procedures registered by the controller session itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeProcedure {
    GetInfo,
    GetWorkers,
    Shutdown,
}

impl NodeProcedure {
    pub const ALL: [NodeProcedure; 3] = [
        NodeProcedure::GetInfo,
        NodeProcedure::GetWorkers,
        NodeProcedure::Shutdown,
    ];

    pub fn name(self) -> &'static str {
        match self {
            NodeProcedure::GetInfo => "get_info",
            NodeProcedure::GetWorkers => "get_workers",
            NodeProcedure::Shutdown => "shutdown",
        }
    }

    pub fn uri(self, node_id: &str) -> ProcedureUri {
        ProcedureUri(format!("{NODE_URI_PREFIX}{node_id}.{}", self.name()))
    }
}

/// Address of one worker on the management realm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEndpoint {
    node_id: String,
    worker_id: String,
    kind: WorkerKind,
}

impl WorkerEndpoint {
    pub fn new(node_id: impl Into<String>, worker_id: impl Into<String>, kind: WorkerKind) -> Self {
        Self {
            node_id: node_id.into(),
            worker_id: worker_id.into(),
            kind,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn kind(&self) -> &WorkerKind {
        &self.kind
    }

    fn base(&self) -> String {
        format!("{NODE_URI_PREFIX}{}.worker.{}", self.node_id, self.worker_id)
    }

    /// URI of `procedure` on this worker.
    pub fn procedure(&self, procedure: WorkerProcedure) -> Result<ProcedureUri, DescriptorError> {
        if !procedure.supports(&self.kind) {
            return Err(DescriptorError::Unsupported {
                procedure: procedure.name(),
                kind: self.kind.to_string(),
            });
        }
        Ok(ProcedureUri(format!("{}.{}", self.base(), procedure.name())))
    }

    /// URI of `topic` on this worker.
    pub fn topic(&self, topic: WorkerTopic) -> Result<ProcedureUri, DescriptorError> {
        if !topic.supports(&self.kind) {
            return Err(DescriptorError::NoSuchTopic {
                topic: topic.suffix(),
                kind: self.kind.to_string(),
            });
        }
        Ok(ProcedureUri(format!("{}.{}", self.base(), topic.suffix())))
    }
}

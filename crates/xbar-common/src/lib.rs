//! ---
//! xbar_section: "01-core-functionality"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "Shared primitives for the node orchestrator workspace."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
//! Core shared primitives for the xbar node workspace.
//! This crate exposes the node configuration tree and loader, tracing
//! initialisation, and the typed control-plane URI descriptors consumed
//! across the workspace.

pub mod config;
pub mod logging;
pub mod procedure;

pub use config::{
    ComponentSpec, ConfigError, ConfigFormat, ControllerOptions, ControllerSection,
    LoadedNodeConfig, LoggingConfig, ManagerSection, MetricsConfig, NodeConfig, Payload,
    RealmSpec, RoleSpec, ScopedSpec, TransportSpec, WorkerKind, WorkerOptions, WorkerSpec,
    DEFAULT_CONTROLLER_TITLE, DEFAULT_CONTROL_REALM,
};
pub use logging::{init_tracing, LogFormat};
pub use procedure::{
    DescriptorError, NodeProcedure, ProcedureUri, WorkerEndpoint, WorkerProcedure, WorkerTopic,
    NODE_URI_PREFIX,
};

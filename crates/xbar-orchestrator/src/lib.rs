//! ---
//! xbar_section: "04-configuration-orchestration"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "Node controller and startup orchestration."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
//! Brings one node from cold start to running.
//!
//! [`Node`] loads the configuration, resolves the node identity, builds the
//! [`ManagementPlane`] and then either connects the management uplink
//! (managed mode) or drives the [`StandaloneSequencer`] through the
//! configured workers. Any fatal error moves the node to
//! [`NodeState::Failed`] and trips the [`ShutdownSignal`].

pub mod bootstrap;
pub mod controller;
pub mod error;
pub mod identity;
pub mod ids;
pub mod managed;
pub mod node;
pub mod sequencer;
pub mod shutdown;
pub mod watchdog;
pub mod worker;

pub use bootstrap::ManagementPlane;
pub use controller::{ControllerSession, NodeController, WorkerLaunch, WorkerLauncher, WorkerRecord};
pub use error::{NodeError, Result};
pub use identity::{local_hostname, IdentitySource, NodeIdentity};
pub use ids::{resolve_ids, IdKind, Resolved};
pub use managed::{
    run_managed, PendingUplink, TcpUplinkConnector, UplinkConnector, DEFAULT_MANAGED_SETTLE,
};
pub use node::{Node, NodeOptions, NodeState};
pub use sequencer::{StandaloneSequencer, StartupReport};
pub use shutdown::ShutdownSignal;
pub use watchdog::{ComponentWatchdog, DEFAULT_COMPONENT_GRACE};
pub use worker::{EmbeddedWorkerLauncher, HostedRealm, HostedWorker, WorkerInventory};

//! ---
//! xbar_section: "04-configuration-orchestration"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "Error taxonomy of node startup."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
use thiserror::Error;
use xbar_common::{ConfigError, DescriptorError};
use xbar_router::RouterError;
use xbar_schema::SchemaError;

/// Shared result type for node startup.
pub type Result<T> = std::result::Result<T, NodeError>;

/// Every variant is fatal to startup; schema block parse failures are only logged.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Missing required field or unrecognised worker type.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("control call `{procedure}` failed: {source}")]
    Rpc {
        procedure: String,
        #[source]
        source: RouterError,
    },
    #[error("managed uplink connection failed: {0}")]
    ManagedConnect(String),
    #[error("component `{component}` on worker `{worker}` stopped during the startup grace window")]
    EarlyComponentExit { worker: String, component: String },
    #[error("node stop requested during startup")]
    Stopped,
    /// A failure recorded while startup was still in progress.
    #[error("startup aborted: {0}")]
    Aborted(String),
    #[error("unable to resolve node identity: {0}")]
    Identity(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("management plane bootstrap failed: {0}")]
    Bootstrap(#[source] RouterError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error("failed to render call payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl NodeError {
    /// The error that ends startup once the node has been asked to stop.
    pub(crate) fn from_shutdown(failure: Option<String>) -> Self {
        match failure {
            Some(reason) => NodeError::Aborted(reason),
            None => NodeError::Stopped,
        }
    }
}

//! ---
//! xbar_section: "02-messaging-ipc-data-model"
//! xbar_subsection: "module"
//! xbar_type: "source"
//! xbar_scope: "code"
//! xbar_description: "In-process management-plane router."
//! xbar_version: "v0.0.0-prealpha"
//! xbar_owner: "tbd"
//! ---
//! Management-plane router used by the node controller.
//!
//! This is not an application message router. It hosts the node's control
//! realm so that the controller session, the service session, worker sessions
//! and the uplink bridge can register procedures, call each other and exchange
//! events without leaving the process.

pub mod bridge;
pub mod router;
pub mod service;
pub mod session;
pub mod types;

/// Shared result type for router operations.
pub type Result<T> = std::result::Result<T, RouterError>;

/// Errors surfaced by the management-plane router.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RouterError {
    #[error("no procedure registered under `{0}`")]
    NoSuchProcedure(String),
    #[error("procedure `{0}` is already registered")]
    AlreadyRegistered(String),
    #[error("no subscription with id {0}")]
    NoSuchSubscription(u64),
    #[error("no realm named `{0}`")]
    NoSuchRealm(String),
    #[error("realm `{0}` is already started")]
    RealmAlreadyStarted(String),
    /// The callee raised an application error.
    #[error("{error}: {message}")]
    ApplicationError { error: String, message: String },
}

impl RouterError {
    pub fn application(error: impl Into<String>, message: impl Into<String>) -> Self {
        RouterError::ApplicationError {
            error: error.into(),
            message: message.into(),
        }
    }
}

pub use bridge::{ManagementBridgeSession, UplinkSession, BRIDGED_TOPIC_PREFIX};
pub use router::{Router, RouterFactory, RouterRealm};
pub use service::RouterServiceSession;
pub use session::{RouterSession, RouterSessionFactory, SessionHandle, TRUSTED_AUTHROLE};
pub use types::{
    CallDetails, Event, EventHandler, MatchPolicy, ProcedureHandler, SessionId, SessionInfo,
    SubscriptionId,
};
